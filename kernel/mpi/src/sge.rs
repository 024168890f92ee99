//! Scatter-gather element (SGE) encoding.
//!
//! A simple element is a `FlagsLength` dword (flags in the top byte, byte count in the low 24 bits)
//! followed by a 32-bit or 64-bit little-endian address.
//! A chain element points at the next block of elements instead of at data.

use byteorder::{ByteOrder, LittleEndian};

/// The shift of the flags byte within an SGE's `FlagsLength` dword.
pub const SGE_FLAGS_SHIFT: u32 = 24;
/// The byte count occupies the low 24 bits of `FlagsLength`.
pub const SGE_LENGTH_MASK: u32 = 0x00FF_FFFF;

bitflags! {
    pub struct SgeFlags: u8 {
        const LAST_ELEMENT   = 0x80;
        const END_OF_BUFFER  = 0x40;
        const SIMPLE_ELEMENT = 0x10;
        const CHAIN_ELEMENT  = 0x30;
        const LOCAL_ADDRESS  = 0x08;
        /// Data flows host to IOC; clear means IOC to host.
        const HOST_TO_IOC    = 0x04;
        const ADDRESSING_64  = 0x02;
        const END_OF_LIST    = 0x01;
    }
}

impl SgeFlags {
    /// Combines these flags with a byte count into a `FlagsLength` dword.
    pub fn flags_length(self, length: u32) -> u32 {
        ((self.bits() as u32) << SGE_FLAGS_SHIFT) | (length & SGE_LENGTH_MASK)
    }
}

/// The width of the DMA addresses carried in SGEs, fixed per platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressWidth {
    Bits32,
    Bits64,
}

impl AddressWidth {
    /// The addressing flag to include in every element.
    pub fn flag(self) -> SgeFlags {
        match self {
            AddressWidth::Bits32 => SgeFlags::empty(),
            AddressWidth::Bits64 => SgeFlags::ADDRESSING_64,
        }
    }

    /// Size in bytes of a simple or chain element.
    pub fn sge_size(self) -> usize {
        match self {
            AddressWidth::Bits32 => 8,
            AddressWidth::Bits64 => 12,
        }
    }

    /// Flags for a single element that ends the list and carries data from the IOC to the host.
    pub fn single_read(self) -> SgeFlags {
        SgeFlags::LAST_ELEMENT | SgeFlags::END_OF_BUFFER | SgeFlags::END_OF_LIST
            | SgeFlags::SIMPLE_ELEMENT | self.flag()
    }

    /// Flags for a single element that ends the list and carries data from the host to the IOC.
    pub fn single_write(self) -> SgeFlags {
        self.single_read() | SgeFlags::HOST_TO_IOC
    }

    /// Flags for a simple element in the middle of a list, IOC to host.
    pub fn simple_read(self) -> SgeFlags {
        SgeFlags::SIMPLE_ELEMENT | self.flag()
    }
}

fn put_address(buf: &mut [u8], width: AddressWidth, addr: u64) {
    LittleEndian::write_u32(&mut buf[0..4], addr as u32);
    if width == AddressWidth::Bits64 {
        LittleEndian::write_u32(&mut buf[4..8], (addr >> 32) as u32);
    }
}

/// Writes a simple element at the start of `buf`.
///
/// Returns the number of bytes written, or `None` if `buf` is too small.
pub fn add_simple(buf: &mut [u8], width: AddressWidth, flags_length: u32, addr: u64) -> Option<usize> {
    let size = width.sge_size();
    let sge = buf.get_mut(..size)?;
    LittleEndian::write_u32(&mut sge[0..4], flags_length);
    put_address(&mut sge[4..], width, addr);
    Some(size)
}

/// Writes a chain element at the start of `buf`, pointing at `length` bytes of further elements at `addr`.
///
/// `next_chain_offset` is the dword offset of the next chain element within that block, or 0.
/// Returns the number of bytes written, or `None` if `buf` is too small.
pub fn add_chain(buf: &mut [u8], width: AddressWidth, next_chain_offset: u8, length: u16, addr: u64) -> Option<usize> {
    let size = width.sge_size();
    let sge = buf.get_mut(..size)?;
    LittleEndian::write_u16(&mut sge[0..2], length);
    sge[2] = next_chain_offset;
    sge[3] = (SgeFlags::CHAIN_ELEMENT | width.flag()).bits();
    put_address(&mut sge[4..], width, addr);
    Some(size)
}
