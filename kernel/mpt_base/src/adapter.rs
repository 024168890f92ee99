//! The per-IOC adapter object and its identity, settings and cached state.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use alloc::{format, string::String, sync::{Arc, Weak}};
use spin::Mutex;
use mpi::msg::{IocFactsReply, PortFactsReply};
use mpi::sge::AddressWidth;
use mpi::sysif::{self, IocState, IntMask, IntStatus, SysIfReg, INT_MASK_ALL, INT_MASK_REPLY_ONLY};
use crate::AdapterTable;
use crate::events::EventLog;
use crate::firmware::CachedFirmware;
use crate::frames::{FrameGeometry, FramePools};
use crate::platform::{IrqSafeMutex, Platform};
use crate::prefetch::{FcPortInfo, LanInfo, RaidInfo, ScsiPortInfo};
use crate::registry::{DriverHandle, DriverRegistry};
use crate::regs::{RegisterAccess, RegisterAccessMode};
use crate::tunables::MIN_CONFIG_TIMEOUT_SECS;

/// PCI vendor id of every Fusion-MPT IOC.
pub const PCI_VENDOR_ID_LSI: u16 = 0x1000;

/// The Fusion-MPT chip families, ordered so that everything up to [`ChipType::Fc929`]
/// is a first-generation Fibre Channel part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChipType {
    Fc909,
    Fc919,
    Fc929,
    Fc919X,
    Fc929X,
    C1030,
    C1035,
}

impl ChipType {
    pub fn from_device_id(device_id: u16) -> Option<ChipType> {
        Some(match device_id {
            0x0621 => ChipType::Fc909,
            0x0624 => ChipType::Fc919,
            0x0622 => ChipType::Fc929,
            0x0628 => ChipType::Fc919X,
            0x0626 => ChipType::Fc929X,
            0x0030 => ChipType::C1030,
            0x0040 => ChipType::C1035,
            _ => return None,
        })
    }

    pub fn bus_type(self) -> BusType {
        match self {
            ChipType::C1030 | ChipType::C1035 => BusType::Scsi,
            _ => BusType::Fc,
        }
    }

    /// Whether this chip has two PCI functions that share one IOC's silicon.
    pub fn is_dual_function(self) -> bool {
        matches!(self, ChipType::Fc929 | ChipType::Fc929X | ChipType::C1030 | ChipType::C1035)
    }

    /// First-generation Fibre Channel parts. Their log info is decoded as Fibre Channel log info.
    pub(crate) fn is_legacy_fc(self) -> bool {
        self <= ChipType::Fc929
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusType {
    Fc,
    Scsi,
}

/// Where an IOC sits on the PCI bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciFunction {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
    pub device_id: u16,
    pub revision: u8,
}

impl PciFunction {
    /// Whether `other` is the second function of the same dual-function chip.
    pub(crate) fn is_sibling_of(&self, other: &PciFunction) -> bool {
        self.device_id == other.device_id
            && self.bus == other.bus
            && self.slot == other.slot
            && (self.function as i16 - other.function as i16).abs() == 1
    }
}

/// Per-adapter run-time settings.
#[derive(Clone, Debug)]
pub struct AdapterSettings {
    /// How the register block is reached.
    pub access: RegisterAccessMode,
    /// Width of the DMA addresses placed in messages.
    pub address_width: AddressWidth,
    /// Number of entries in the event log. Zero leaves it unallocated.
    pub event_log_size: usize,
    /// Bit `n` set logs events of type `n`.
    pub event_log_types: u32,
    /// Config requests time out after this many seconds (never fewer than the minimum).
    pub config_timeout_secs: u32,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        AdapterSettings {
            access: RegisterAccessMode::Mmio,
            address_width: if cfg!(target_pointer_width = "64") { AddressWidth::Bits64 } else { AddressWidth::Bits32 },
            event_log_size: 0,
            event_log_types: 0xFFFF_FFFF,
            config_timeout_secs: MIN_CONFIG_TIMEOUT_SECS,
        }
    }
}

/// State gathered during bring-up, guarded by `Adapter::state`.
#[derive(Default)]
pub(crate) struct AdapterState {
    pub facts: Option<IocFactsReply>,
    pub pfacts: [Option<PortFactsReply>; 2],
    pub geometry: FrameGeometry,
    /// Frame sizes and depths are negotiated once, on the first successful facts.
    pub negotiated: bool,
    /// The IOC boots from a host-supplied image that still needs to be uploaded.
    pub upload_fw: bool,
    pub first_who_init: Option<u8>,
    pub scsi: ScsiPortInfo,
    pub fc_ports: [Option<FcPortInfo>; 2],
    pub lan: Option<LanInfo>,
    pub raid: RaidInfo,
    pub bios_version: u32,
}

/// One Fusion-MPT IOC.
pub struct Adapter {
    id: usize,
    name: String,
    chip: ChipType,
    pci: PciFunction,
    settings: AdapterSettings,
    regs: Arc<dyn RegisterAccess>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) frames: FramePools,
    /// Interrupt-driven frame reclamation is allowed only while set.
    active: AtomicBool,
    pub(crate) diag_pending: AtomicBool,
    pub(crate) diag_lock: Mutex<()>,
    /// Set when firmware asks to be reloaded at the next reset.
    pub(crate) reload_fw: AtomicBool,
    /// The IOC's event notification state: nonzero once notifications are on.
    pub(crate) event_state: AtomicU8,
    /// The cooked IOC state seen by the last `get_ioc_state`.
    last_state: AtomicU32,
    pub(crate) state: Mutex<AdapterState>,
    pub(crate) event_log: IrqSafeMutex<EventLog>,
    pub(crate) cached_fw: Mutex<Option<CachedFirmware>>,
    pub(crate) next_config_id: AtomicU32,
    alt_id: Mutex<Option<usize>>,
    drivers: Arc<DriverRegistry>,
    adapters: Weak<AdapterTable>,
    base_handle: DriverHandle,
}

impl Adapter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        pci: PciFunction,
        chip: ChipType,
        regs: Arc<dyn RegisterAccess>,
        platform: Arc<dyn Platform>,
        settings: AdapterSettings,
        drivers: Arc<DriverRegistry>,
        adapters: Weak<AdapterTable>,
        base_handle: DriverHandle,
    ) -> Adapter {
        let event_log = EventLog::new(settings.event_log_size, settings.event_log_types);
        Adapter {
            id,
            name: format!("ioc{}", id),
            chip,
            pci,
            settings,
            regs,
            platform,
            frames: FramePools::new(),
            active: AtomicBool::new(false),
            diag_pending: AtomicBool::new(false),
            diag_lock: Mutex::new(()),
            reload_fw: AtomicBool::new(false),
            event_state: AtomicU8::new(0),
            last_state: AtomicU32::new(sysif::IOC_STATE_RESET),
            state: Mutex::new(AdapterState::default()),
            event_log: IrqSafeMutex::new(event_log),
            cached_fw: Mutex::new(None),
            next_config_id: AtomicU32::new(1),
            alt_id: Mutex::new(None),
            drivers,
            adapters,
            base_handle,
        }
    }

    pub fn id(&self) -> usize { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn chip(&self) -> ChipType { self.chip }
    pub fn bus_type(&self) -> BusType { self.chip.bus_type() }
    pub fn pci(&self) -> &PciFunction { &self.pci }
    pub fn settings(&self) -> &AdapterSettings { &self.settings }
    pub fn drivers(&self) -> &Arc<DriverRegistry> { &self.drivers }
    pub(crate) fn base_handle(&self) -> DriverHandle { self.base_handle }

    pub(crate) fn read32(&self, reg: SysIfReg) -> u32 {
        self.regs.read32(reg)
    }

    pub(crate) fn write32(&self, reg: SysIfReg, value: u32) {
        self.regs.write32(reg, value)
    }

    /// Returns the doorbell's IOC state bits if `cooked`, else the whole doorbell.
    pub fn get_ioc_state(&self, cooked: bool) -> u32 {
        let doorbell = self.read32(SysIfReg::Doorbell);
        let state = doorbell & sysif::IOC_STATE_MASK;
        self.last_state.store(state, Ordering::Relaxed);
        if cooked { state } else { doorbell }
    }

    pub fn ioc_state(&self) -> IocState {
        IocState::from_doorbell(self.get_ioc_state(true))
    }

    pub(crate) fn last_state(&self) -> u32 {
        self.last_state.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Masks all interrupts and stops frame reclamation.
    pub(crate) fn mask_interrupts(&self) {
        self.write32(SysIfReg::IntMask, INT_MASK_ALL);
        self.set_active(false);
    }

    /// Unmasks reply interrupts and allows frame traffic.
    pub(crate) fn enable_interrupts(&self) {
        self.write32(SysIfReg::IntMask, INT_MASK_REPLY_ONLY);
        self.set_active(true);
    }

    /// Whether the IOC is asserting an unmasked reply interrupt.
    pub fn interrupt_pending(&self) -> bool {
        let status = IntStatus::from_bits_truncate(self.read32(SysIfReg::IntStatus));
        let mask = IntMask::from_bits_truncate(self.read32(SysIfReg::IntMask));
        status.contains(IntStatus::REPLY_INTERRUPT) && !mask.contains(IntMask::REPLY)
    }

    /// The id of the other PCI function of a dual-function chip, if bound.
    pub fn alt_id(&self) -> Option<usize> {
        *self.alt_id.lock()
    }

    pub(crate) fn set_alt_id(&self, alt: Option<usize>) {
        *self.alt_id.lock() = alt;
    }

    /// The bound sibling adapter, looked up through the adapter table.
    pub fn sibling(&self) -> Option<Arc<Adapter>> {
        let alt = self.alt_id()?;
        self.adapters.upgrade()?.get(alt)
    }

    pub(crate) fn geometry(&self) -> FrameGeometry {
        self.state.lock().geometry
    }

    pub fn facts(&self) -> Option<IocFactsReply> {
        self.state.lock().facts
    }

    pub fn port_facts(&self, port: usize) -> Option<PortFactsReply> {
        self.state.lock().pfacts.get(port).copied().flatten()
    }

    pub(crate) fn number_of_ports(&self) -> usize {
        self.state.lock().facts.map_or(0, |f| f.number_of_ports as usize).min(2)
    }

    pub fn first_who_init(&self) -> Option<u8> {
        self.state.lock().first_who_init
    }

    pub fn event_state(&self) -> u8 {
        self.event_state.load(Ordering::Acquire)
    }

    pub fn fc_port(&self, port: usize) -> Option<FcPortInfo> {
        self.state.lock().fc_ports.get(port).copied().flatten()
    }

    pub fn lan_info(&self) -> Option<LanInfo> {
        self.state.lock().lan
    }

    pub fn scsi_port(&self) -> ScsiPortInfo {
        self.state.lock().scsi
    }

    pub fn raid_info(&self) -> RaidInfo {
        self.state.lock().raid.clone()
    }

    pub fn bios_version(&self) -> u32 {
        self.state.lock().bios_version
    }

    pub fn has_cached_firmware(&self) -> bool {
        self.cached_fw.lock().is_some()
    }

    /// Whether this adapter or its sibling holds a cached firmware image.
    pub(crate) fn any_cached_firmware(&self) -> bool {
        self.has_cached_firmware() || self.sibling().map_or(false, |alt| alt.has_cached_firmware())
    }

    /// Runs every registered reset handler for this adapter and, if given, its sibling.
    pub(crate) fn notify_reset_handlers(&self, phase: crate::registry::ResetPhase, sibling: Option<&Adapter>) {
        for handler in self.drivers.reset_handlers() {
            handler.on_reset(self, phase);
            if let Some(alt) = sibling {
                handler.on_reset(alt, phase);
            }
        }
    }
}

impl core::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("chip", &self.chip)
            .field("active", &self.is_active())
            .finish()
    }
}
