//! Error types of the base driver.
//!
//! Each component reports failures through its own small enum.
//! `code()` gives the signed status the component has always reported,
//! which is what shows up in logs and what protocol drivers compare against.

/// A doorbell handshake failed; the variant names the wait that timed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    /// The IOC never raised its doorbell interrupt after the handshake doorbell write.
    DoorbellIntTimeout,
    /// The IOC never acknowledged the start of the handshake.
    AckTimeout,
    /// The IOC never acknowledged one of the request words.
    RequestWordAckTimeout,
    /// The IOC never raised the closing doorbell interrupt.
    FinalIntTimeout,
    /// The doorbell did not report an active handshake.
    DoorbellNotActive,
    /// A reply half-word never arrived.
    ReplyTimeout,
}

impl HandshakeError {
    pub fn code(self) -> i32 {
        match self {
            HandshakeError::DoorbellIntTimeout    => -1,
            HandshakeError::AckTimeout            => -2,
            HandshakeError::RequestWordAckTimeout => -3,
            HandshakeError::FinalIntTimeout       => -4,
            HandshakeError::DoorbellNotActive     => -5,
            HandshakeError::ReplyTimeout          => -6,
        }
    }
}

impl From<HandshakeError> for &'static str {
    fn from(e: HandshakeError) -> &'static str {
        match e {
            HandshakeError::DoorbellIntTimeout    => "mpt_base: handshake doorbell interrupt timed out",
            HandshakeError::AckTimeout            => "mpt_base: handshake ack timed out",
            HandshakeError::RequestWordAckTimeout => "mpt_base: handshake request word ack timed out",
            HandshakeError::FinalIntTimeout       => "mpt_base: handshake final interrupt timed out",
            HandshakeError::DoorbellNotActive     => "mpt_base: handshake doorbell not active",
            HandshakeError::ReplyTimeout          => "mpt_base: handshake reply timed out",
        }
    }
}

/// The diagnostic (kickstart) reset failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagError {
    /// The write-sequence keys never enabled diagnostic writes.
    UnlockFailed,
    /// Diagnostic bits still set after the reset: bad flash, stuck reset or a disabled ARM.
    BadState(u32),
    /// No firmware image to download.
    NoImage,
    /// The cached firmware image header chain is malformed.
    BadImage,
}

impl DiagError {
    pub fn code(self) -> i32 {
        match self {
            DiagError::UnlockFailed => -1,
            DiagError::BadState(_)  => -3,
            DiagError::NoImage      => -4,
            DiagError::BadImage     => -5,
        }
    }
}

impl From<DiagError> for &'static str {
    fn from(e: DiagError) -> &'static str {
        match e {
            DiagError::UnlockFailed => "mpt_base: couldn't enable diagnostic writes",
            DiagError::BadState(_)  => "mpt_base: diagnostic reset failed",
            DiagError::NoImage      => "mpt_base: no cached firmware to download",
            DiagError::BadImage     => "mpt_base: cached firmware image is malformed",
        }
    }
}

/// The IOC could not be brought to the READY state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyError {
    KickStart(DiagError),
    /// The IOC never reached READY (or OPERATIONAL) after a kickstart.
    KickStartTimeout,
    MessageUnitResetFailed,
    IoUnitResetFailed,
    /// Another PCI function owns the operational IOC.
    OwnedByPeer,
    Timeout,
}

impl ReadyError {
    pub fn code(self) -> i32 {
        match self {
            ReadyError::KickStart(_) | ReadyError::KickStartTimeout => -1,
            ReadyError::MessageUnitResetFailed => -2,
            ReadyError::IoUnitResetFailed      => -3,
            ReadyError::OwnedByPeer            => -4,
            ReadyError::Timeout                => -62,
        }
    }
}

impl From<ReadyError> for &'static str {
    fn from(e: ReadyError) -> &'static str {
        match e {
            ReadyError::KickStart(d)           => d.into(),
            ReadyError::KickStartTimeout       => "mpt_base: IOC didn't come back after kickstart",
            ReadyError::MessageUnitResetFailed => "mpt_base: message unit reset failed",
            ReadyError::IoUnitResetFailed      => "mpt_base: IO unit reset failed",
            ReadyError::OwnedByPeer            => "mpt_base: IOC is owned by a PCI peer",
            ReadyError::Timeout                => "mpt_base: timed out waiting for IOC READY",
        }
    }
}

/// Getting IOC or port facts failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactsError {
    /// The IOC was last seen in the RESET state.
    NotReady,
    /// The reply was too short to carry the request frame size.
    ShortReply,
    /// The IOC reported a request frame size of zero.
    ZeroFrameSize,
    Handshake(HandshakeError),
}

impl FactsError {
    pub fn code(self) -> i32 {
        match self {
            FactsError::NotReady      => -44,
            FactsError::ShortReply    => -66,
            FactsError::ZeroFrameSize => -55,
            FactsError::Handshake(e)  => e.code(),
        }
    }
}

/// The frame arenas could not be set up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimeError {
    NoMemory,
    /// The request and reply arenas don't share the upper 32 address bits the IOC is given.
    HighAddressMismatch,
    /// A 32-bit IOC was handed memory above 4 GiB.
    AddressTooHigh,
}

/// Sending IOC init or port enable failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitError {
    Init(HandshakeError),
    PortEnable(HandshakeError),
    /// The IOC never reported OPERATIONAL; holds the last doorbell state.
    NotOperational(u32),
}

/// Uploading or caching the IOC firmware failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareError {
    NoMemory,
    Handshake(HandshakeError),
    BadStatus(u16),
    SizeMismatch { expected: u32, actual: u32 },
}

impl FirmwareError {
    pub fn code(self) -> i32 {
        match self {
            FirmwareError::NoMemory         => -12,
            FirmwareError::Handshake(e)     => e.code(),
            FirmwareError::BadStatus(_)     => -5,
            FirmwareError::SizeMismatch{..} => -5,
        }
    }
}

/// Bring-up or recovery stopped at one of its stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryError {
    NotReady(ReadyError),
    Facts(FactsError),
    Prime(PrimeError),
    Init(InitError),
    Upload(FirmwareError),
}

impl RecoveryError {
    pub fn code(self) -> i32 {
        match self {
            RecoveryError::NotReady(_) => -1,
            RecoveryError::Facts(_)    => -2,
            RecoveryError::Prime(_)    => -3,
            RecoveryError::Init(_)     => -4,
            RecoveryError::Upload(_)   => -5,
        }
    }
}

impl From<RecoveryError> for &'static str {
    fn from(e: RecoveryError) -> &'static str {
        match e {
            RecoveryError::NotReady(r) => r.into(),
            RecoveryError::Facts(_)    => "mpt_base: couldn't get IOC or port facts",
            RecoveryError::Prime(_)    => "mpt_base: couldn't allocate and prime the frame FIFOs",
            RecoveryError::Init(_)     => "mpt_base: IOC init or port enable failed",
            RecoveryError::Upload(_)   => "mpt_base: firmware upload failed",
        }
    }
}

/// A configuration request failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Config requests block, so they can't be issued from atomic context.
    InInterrupt,
    /// No request frame was free.
    NoFreeFrame,
    /// The page buffer couldn't be allocated.
    NoMemory,
    /// The IOC (or the reset path) completed the request with this status.
    IocStatus(u16),
}

impl ConfigError {
    pub fn code(self) -> i32 {
        match self {
            ConfigError::InInterrupt  => -1,
            ConfigError::NoFreeFrame  => -11,
            ConfigError::NoMemory     => -12,
            ConfigError::IocStatus(s) => s as i32,
        }
    }
}

impl From<ConfigError> for &'static str {
    fn from(e: ConfigError) -> &'static str {
        match e {
            ConfigError::InInterrupt  => "mpt_base: config request from interrupt context",
            ConfigError::NoFreeFrame  => "mpt_base: no free request frame for config request",
            ConfigError::NoMemory     => "mpt_base: couldn't allocate config page buffer",
            ConfigError::IocStatus(s) => mpi::status::describe(s),
        }
    }
}

/// A protocol driver table operation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryError {
    TableFull,
    InvalidHandle,
}

impl From<RegistryError> for &'static str {
    fn from(e: RegistryError) -> &'static str {
        match e {
            RegistryError::TableFull     => "mpt_base: protocol driver table is full",
            RegistryError::InvalidHandle => "mpt_base: invalid protocol driver handle",
        }
    }
}

/// An adapter could not be attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachError {
    TableFull,
    UnknownChip(u16),
    NoSuchAdapter,
}

impl From<AttachError> for &'static str {
    fn from(e: AttachError) -> &'static str {
        match e {
            AttachError::TableFull      => "mpt_base: too many adapters",
            AttachError::UnknownChip(_) => "mpt_base: unsupported PCI device id",
            AttachError::NoSuchAdapter  => "mpt_base: no such adapter",
        }
    }
}
