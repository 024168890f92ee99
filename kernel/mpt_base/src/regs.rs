//! Access to an IOC's system interface registers.
//!
//! The register block is reachable through either a memory BAR or an I/O port BAR.
//! Which one is used is fixed when the adapter is attached.

use core::mem::size_of;
use core::ptr::{addr_of_mut, NonNull};
use alloc::sync::Arc;
use volatile::Volatile;
#[cfg(target_arch = "x86_64")]
use x86_64::instructions::port::Port;
use mpi::sysif::{SysIfReg, SYSIF_REGS_SIZE};

/// Uniform 32-bit access to the system interface registers.
pub trait RegisterAccess: Send + Sync {
    fn read32(&self, reg: SysIfReg) -> u32;
    fn write32(&self, reg: SysIfReg, value: u32);
}

/// How the register block is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterAccessMode {
    Mmio,
    PortIo,
}

/// The system interface register block as laid out behind the memory BAR.
#[repr(C)]
pub struct SysIfRegisters {
    pub doorbell:                       Volatile<u32>,          // 0x00
    pub write_sequence:                 Volatile<u32>,          // 0x04
    pub diagnostic:                     Volatile<u32>,          // 0x08
    pub test_base:                      Volatile<u32>,          // 0x0C
    pub diag_rw_data:                   Volatile<u32>,          // 0x10
    pub diag_rw_address:                Volatile<u32>,          // 0x14
    _padding0:                          [u8; 24],               // 0x18 - 0x2F
    pub int_status:                     Volatile<u32>,          // 0x30
    pub int_mask:                       Volatile<u32>,          // 0x34
    _padding1:                          [u8; 8],                // 0x38 - 0x3F
    pub request_fifo:                   Volatile<u32>,          // 0x40
    pub reply_fifo:                     Volatile<u32>,          // 0x44
    _padding2:                          [u8; 8],                // 0x48 - 0x4F
    pub host_index:                     Volatile<u32>,          // 0x50
}

const_assert_eq!(size_of::<SysIfRegisters>(), SYSIF_REGS_SIZE as usize);

/// The register block mapped into memory.
pub struct MmioRegisters {
    regs: NonNull<SysIfRegisters>,
}

// The block is only ever touched through volatile single-register accesses.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Returns `None` if `base` is null.
    ///
    /// # Safety
    /// `base` must be the virtual address of a mapped, uncached region
    /// at least `SYSIF_REGS_SIZE` bytes long that stays mapped for the life of this struct.
    pub unsafe fn new(base: usize) -> Option<MmioRegisters> {
        NonNull::new(base as *mut SysIfRegisters).map(|regs| MmioRegisters { regs })
    }

    fn register(&self, reg: SysIfReg) -> *mut Volatile<u32> {
        let regs = self.regs.as_ptr();
        unsafe {
            match reg {
                SysIfReg::Doorbell      => addr_of_mut!((*regs).doorbell),
                SysIfReg::WriteSequence => addr_of_mut!((*regs).write_sequence),
                SysIfReg::Diagnostic    => addr_of_mut!((*regs).diagnostic),
                SysIfReg::TestBase      => addr_of_mut!((*regs).test_base),
                SysIfReg::DiagRwData    => addr_of_mut!((*regs).diag_rw_data),
                SysIfReg::DiagRwAddress => addr_of_mut!((*regs).diag_rw_address),
                SysIfReg::IntStatus     => addr_of_mut!((*regs).int_status),
                SysIfReg::IntMask       => addr_of_mut!((*regs).int_mask),
                SysIfReg::RequestFifo   => addr_of_mut!((*regs).request_fifo),
                SysIfReg::ReplyFifo     => addr_of_mut!((*regs).reply_fifo),
                SysIfReg::HostIndex     => addr_of_mut!((*regs).host_index),
            }
        }
    }
}

impl RegisterAccess for MmioRegisters {
    fn read32(&self, reg: SysIfReg) -> u32 {
        unsafe { (*self.register(reg)).read() }
    }

    fn write32(&self, reg: SysIfReg, value: u32) {
        unsafe { (*self.register(reg)).write(value) }
    }
}

/// The register block in I/O port space.
#[cfg(target_arch = "x86_64")]
pub struct PortIoRegisters {
    base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortIoRegisters {
    /// # Safety
    /// `base` must be the I/O BAR of an IOC, with `SYSIF_REGS_SIZE` ports owned by this struct.
    pub unsafe fn new(base: u16) -> PortIoRegisters {
        PortIoRegisters { base }
    }

    fn port(&self, reg: SysIfReg) -> Port<u32> {
        Port::new(self.base + reg.offset() as u16)
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterAccess for PortIoRegisters {
    fn read32(&self, reg: SysIfReg) -> u32 {
        unsafe { self.port(reg).read() }
    }

    fn write32(&self, reg: SysIfReg, value: u32) {
        unsafe { self.port(reg).write(value) }
    }
}

/// The BARs of an IOC's PCI function.
#[derive(Clone, Copy, Debug, Default)]
pub struct PciBars {
    /// Virtual address of the mapped memory BAR.
    pub mem: Option<usize>,
    /// Base of the I/O BAR.
    pub io: Option<u16>,
}

/// Creates register access of the requested kind from an IOC's BARs.
///
/// # Safety
/// The BAR selected by `mode` must satisfy the contract of
/// [`MmioRegisters::new`] or [`PortIoRegisters::new`].
pub unsafe fn map_registers(mode: RegisterAccessMode, bars: PciBars) -> Result<Arc<dyn RegisterAccess>, &'static str> {
    match mode {
        RegisterAccessMode::Mmio => {
            let base = bars.mem.ok_or("mpt_base: IOC has no memory BAR")?;
            trace!("mpt_base: mapping {:#X} bytes of registers at {:#X}", SYSIF_REGS_SIZE, base);
            let regs = MmioRegisters::new(base).ok_or("mpt_base: IOC memory BAR is not mapped")?;
            Ok(Arc::new(regs))
        }
        #[cfg(target_arch = "x86_64")]
        RegisterAccessMode::PortIo => {
            let base = bars.io.ok_or("mpt_base: IOC has no I/O BAR")?;
            Ok(Arc::new(PortIoRegisters::new(base)))
        }
        #[cfg(not(target_arch = "x86_64"))]
        RegisterAccessMode::PortIo => Err("mpt_base: port I/O is not supported on this architecture"),
    }
}
