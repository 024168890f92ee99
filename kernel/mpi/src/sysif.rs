//! The system interface register block.
//!
//! Every Fusion-MPT IOC exposes the same small block of 32-bit registers,
//! reachable either through a memory BAR or an I/O port BAR.

use bit_field::BitField;
use num_enum::TryFromPrimitive;

/// The registers of the system interface, by byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SysIfReg {
    Doorbell      = 0x00,
    WriteSequence = 0x04,
    Diagnostic    = 0x08,
    TestBase      = 0x0C,
    DiagRwData    = 0x10,
    DiagRwAddress = 0x14,
    IntStatus     = 0x30,
    IntMask       = 0x34,
    RequestFifo   = 0x40,
    ReplyFifo     = 0x44,
    HostIndex     = 0x50,
}

impl SysIfReg {
    /// The byte offset of this register from the start of the register block.
    pub const fn offset(self) -> u32 {
        self as u32
    }
}

/// Size in bytes of the system interface register block.
pub const SYSIF_REGS_SIZE: u32 = 0x54;

/// The value read from the reply FIFO when it holds no replies.
pub const REPLY_FIFO_EMPTY: u32 = 0xFFFF_FFFF;

// Doorbell register layout.
pub const DOORBELL_ACTIVE:           u32 = 0x0800_0000;
pub const DOORBELL_DATA_MASK:        u32 = 0x0000_FFFF;
pub const DOORBELL_FUNCTION_SHIFT:   u32 = 24;
pub const DOORBELL_ADD_DWORDS_SHIFT: u32 = 16;
pub const IOC_STATE_MASK:            u32 = 0xF000_0000;

pub const IOC_STATE_RESET:       u32 = 0x0000_0000;
pub const IOC_STATE_READY:       u32 = 0x1000_0000;
pub const IOC_STATE_OPERATIONAL: u32 = 0x2000_0000;
pub const IOC_STATE_FAULT:       u32 = 0x4000_0000;

/// The "cooked" IOC state held in the top nibble of the doorbell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IocState {
    Reset,
    Ready,
    Operational,
    Fault,
    Unknown(u32),
}

impl IocState {
    pub fn from_doorbell(doorbell: u32) -> IocState {
        match doorbell & IOC_STATE_MASK {
            IOC_STATE_RESET       => IocState::Reset,
            IOC_STATE_READY       => IocState::Ready,
            IOC_STATE_OPERATIONAL => IocState::Operational,
            IOC_STATE_FAULT       => IocState::Fault,
            other                 => IocState::Unknown(other),
        }
    }

    /// The doorbell bits for this state.
    pub fn bits(self) -> u32 {
        match self {
            IocState::Reset       => IOC_STATE_RESET,
            IocState::Ready       => IOC_STATE_READY,
            IocState::Operational => IOC_STATE_OPERATIONAL,
            IocState::Fault       => IOC_STATE_FAULT,
            IocState::Unknown(b)  => b,
        }
    }
}

/// Who last initialized the IOC, as reported in doorbell bits 24..28
/// and in the IOC facts reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum WhoInit {
    NoOne        = 0x00,
    SystemBios   = 0x01,
    RomBios      = 0x02,
    PciPeer      = 0x03,
    HostDriver   = 0x04,
    Manufacturer = 0x05,
}

/// Extracts the raw "who init" field from a doorbell value.
pub fn doorbell_who_init(doorbell: u32) -> u8 {
    doorbell.get_bits(24..28) as u8
}

/// Extracts the fault code the firmware leaves in the data bits of a FAULT doorbell.
pub fn doorbell_fault_code(doorbell: u32) -> u16 {
    (doorbell & DOORBELL_DATA_MASK) as u16
}

/// Builds the doorbell word that starts a handshake of `dwords` request words.
pub fn handshake_doorbell(dwords: usize) -> u32 {
    let mut word = (crate::msg::Function::Handshake as u32) << DOORBELL_FUNCTION_SHIFT;
    word.set_bits(16..24, (dwords as u32) & 0xFF);
    word
}

bitflags! {
    /// Host interrupt status register.
    pub struct IntStatus: u32 {
        const DOORBELL_INTERRUPT  = 0x0000_0001;
        const REPLY_INTERRUPT     = 0x0000_0008;
        /// Set by the host's doorbell write, cleared by the IOC once it has taken the word.
        const IOP_DOORBELL_STATUS = 0x8000_0000;
    }
}

bitflags! {
    /// Host interrupt mask register; a set bit masks the interrupt.
    pub struct IntMask: u32 {
        const DOORBELL = 0x0000_0001;
        const REPLY    = 0x0000_0008;
    }
}

/// The mask written to enable only reply interrupts.
pub const INT_MASK_REPLY_ONLY: u32 = !IntMask::REPLY.bits();
/// The mask written to disable all interrupts.
pub const INT_MASK_ALL: u32 = 0xFFFF_FFFF;

bitflags! {
    /// The diagnostic register.
    pub struct Diagnostic: u32 {
        const MEM_ENABLE          = 0x0000_0001;
        const DISABLE_ARM         = 0x0000_0002;
        const RESET_ADAPTER       = 0x0000_0004;
        const RW_ENABLE           = 0x0000_0010;
        const RESET_HISTORY       = 0x0000_0020;
        const FLASH_BAD_SIG       = 0x0000_0040;
        /// Diagnostic write enable, set once the write-sequence keys have been written.
        const DRWE                = 0x0000_0080;
        const PREVENT_IOC_BOOT    = 0x0000_0200;
        const CLEAR_FLASH_BAD_SIG = 0x0000_0400;
    }
}

/// Written to the write-sequence register before the keys, flushing any partial sequence.
pub const WRSEQ_FLUSH: u32 = 0xFF;
/// The write-sequence keys that unlock diagnostic writes, in order.
pub const WRSEQ_KEYS: [u32; 5] = [0x04, 0x0B, 0x02, 0x07, 0x0D];
/// Written to the write-sequence register to leave diagnostic mode.
pub const WRSEQ_DISABLE: u32 = 0xFFFF_FFFF;

/// Diagnostic RW address of the IOC's internal flash status word.
pub const DIAG_RW_FLASH_STATUS_ADDR: u32 = 0x3F00_0000;
/// The "flash bad" marker within the word at [`DIAG_RW_FLASH_STATUS_ADDR`].
pub const DIAG_RW_FLASH_BAD_BIT: u32 = 0x0400_0000;

// Reply FIFO encoding.
pub const ADDRESS_REPLY_A_BIT: u32 = 0x8000_0000;
pub const CONTEXT_REPLY_TYPE_SHIFT: u32 = 29;
pub const CONTEXT_REPLY_TYPE_SCSI_INIT:   u32 = 0;
pub const CONTEXT_REPLY_TYPE_SCSI_TARGET: u32 = 1;
pub const CONTEXT_REPLY_TYPE_LAN:         u32 = 2;
/// A LAN context reply with all of these bits set only returns a request frame.
pub const LAN_TURBO_FREE_ONLY: u32 = 0x5800_0000;

/// One value read from the reply FIFO, decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyDescriptor {
    /// A full reply frame was written at this bus address (low 32 bits).
    Address(u32),
    /// Context-only completion of the request with this index, for this callback handle.
    Context { req_idx: u16, cb_idx: u8 },
    /// Context-only completion for the target-mode driver; the raw value is its context.
    ScsiTarget(u32),
    /// Context-only completion for the LAN driver; the raw value is its context.
    Lan(u32),
    /// LAN completion that only hands back the request frame with this index.
    LanFreeOnly { req_idx: u16 },
}

impl ReplyDescriptor {
    pub fn decode(value: u32) -> ReplyDescriptor {
        if value & ADDRESS_REPLY_A_BIT != 0 {
            // The IOC drops the low bit of the (aligned) frame address to make room for the A bit.
            return ReplyDescriptor::Address(value << 1);
        }
        match value >> CONTEXT_REPLY_TYPE_SHIFT {
            CONTEXT_REPLY_TYPE_SCSI_TARGET => ReplyDescriptor::ScsiTarget(value),
            CONTEXT_REPLY_TYPE_LAN if value & LAN_TURBO_FREE_ONLY == LAN_TURBO_FREE_ONLY => {
                ReplyDescriptor::LanFreeOnly { req_idx: value.get_bits(0..16) as u16 }
            }
            CONTEXT_REPLY_TYPE_LAN => ReplyDescriptor::Lan(value),
            _ => ReplyDescriptor::Context {
                req_idx: value.get_bits(0..16) as u16,
                cb_idx: value.get_bits(16..24) as u8,
            },
        }
    }

    /// The value an IOC would place in the reply FIFO for this reply.
    pub fn encode(self) -> u32 {
        match self {
            ReplyDescriptor::Address(addr) => ADDRESS_REPLY_A_BIT | (addr >> 1),
            ReplyDescriptor::Context { req_idx, cb_idx } => {
                (CONTEXT_REPLY_TYPE_SCSI_INIT << CONTEXT_REPLY_TYPE_SHIFT)
                    | ((cb_idx as u32) << 16)
                    | req_idx as u32
            }
            ReplyDescriptor::ScsiTarget(raw) | ReplyDescriptor::Lan(raw) => raw,
            ReplyDescriptor::LanFreeOnly { req_idx } => LAN_TURBO_FREE_ONLY | req_idx as u32,
        }
    }
}
