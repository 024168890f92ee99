//! Compile-time limits and timeouts of the base driver.

/// Maximum number of adapters managed at once.
pub const MAX_ADAPTERS: usize = 16;

/// Size of the protocol driver table. Slot 0 is never handed out.
pub const MAX_PROTOCOL_DRIVERS: usize = 16;

/// Upper bound on the negotiated request frame size, in bytes.
pub const MAX_REQ_FRAME_SIZE: usize = 128;
/// Upper bound on the number of request frames.
pub const MAX_REQ_DEPTH: usize = 1023;
/// Size of every reply frame, in bytes.
pub const REPLY_FRAME_SIZE: usize = 0x40;
/// Upper bound on the number of reply frames posted to the IOC.
pub const MAX_REPLY_DEPTH: usize = 128;
/// Sense buffer bytes reserved per request frame.
pub const SENSE_BUFFER_SIZE: usize = 0x40;

/// Frame arenas are aligned to this many bytes.
pub const FRAME_ALIGN: usize = 128;
/// The request arena is rounded up to a multiple of this.
pub const REQUEST_ARENA_ROUNDING: usize = 4096;

/// Number of `u16` words buffered for a doorbell handshake reply.
pub const HANDSHAKE_REPLY_HWORDS: usize = 64;

pub const FACTS_TIMEOUT_SECS: u32 = 3;
pub const INIT_TIMEOUT_SECS: u32 = 10;
pub const PORT_ENABLE_TIMEOUT_FC_SECS: u32 = 65;
pub const PORT_ENABLE_TIMEOUT_SCSI_SECS: u32 = 300;
pub const FW_UPLOAD_TIMEOUT_SECS: u32 = 65;
pub const TASK_MGMT_TIMEOUT_SECS: u32 = 5;
pub const OPERATIONAL_TIMEOUT_SECS: u32 = 60;
/// How long `SendIocReset` and `make_ioc_ready` wait for READY.
pub const READY_TIMEOUT_SECS: u32 = 15;
/// How long the kickstart path waits for READY or OPERATIONAL after a diagnostic reset.
pub const KICKSTART_SETTLE_SECS: u32 = 2;
/// How long to wait for firmware to boot from flash after a diagnostic reset.
pub const FLASH_BOOT_TIMEOUT_SECS: u32 = 60;
/// How long to wait for the adapter reset bit to clear before a download boot.
pub const RESET_ADAPTER_CLEAR_SECS: u32 = 30;

/// Attempts at unlocking diagnostic writes, and the pause between them.
pub const DIAG_UNLOCK_ATTEMPTS: u32 = 20;
pub const DIAG_UNLOCK_RETRY_MS: u32 = 100;
/// Attempts at clearing the reset history bit.
pub const RESET_HISTORY_ATTEMPTS: u32 = 20;

/// Config requests never time out sooner than this.
pub const MIN_CONFIG_TIMEOUT_SECS: u32 = 10;

/// Firmware fragments start at the remaining image size and shrink to this cap...
pub const FW_FRAGMENT_CAP: usize = 0x1_0000;
/// ...then halve down to this floor.
pub const FW_FRAGMENT_FLOOR: usize = 0x1000;
/// Bound on the extension image chain of a firmware image.
pub const MAX_FW_IMAGES: usize = 16;

/// Largest reply coalescing timeout left in IOC page 1.
pub const MAX_COALESCING_TIMEOUT: u32 = 0x10;

/// Slowest sync factor allowed on single-ended and HVD buses.
pub const ULTRA_SYNC_FACTOR: u8 = 0x0C;
/// Sync factor meaning "asynchronous".
pub const ASYNC_SYNC_FACTOR: u8 = 0xFF;
/// Marks a per-device NVRAM setting that could not be read.
pub const NVRAM_INVALID: u32 = 0xFFFF_FFFF;

/// MaxDevices sent in IOC init.
pub const FC_MAX_DEVICES: u8 = 255;
pub const SCSI_MAX_DEVICES: u8 = 16;

/// Event-notification reply frames carry at most this many data words that get logged.
pub const EVENT_LOG_DATA_WORDS: usize = 2;
