//! The Fusion-MPT base driver.
//!
//! Owns everything about a Fusion-MPT IOC that is not specific to one protocol:
//! bringing the IOC up and recovering it after faults, the request and reply frame pools,
//! the doorbell handshake, the interrupt-time reply engine, config page requests,
//! and asynchronous event notification.
//!
//! Protocol drivers (SCSI host, LAN, target mode) register a [`ReplyHandler`] with the
//! [`DriverRegistry`] and get back a [`DriverHandle`]. They then acquire request frames,
//! fill them in and submit them; the matching replies come back to their handler.
//!
//! The subsystem is started with [`fusion_init`], after which each IOC found on the PCI bus
//! is handed to [`Fusion::install_adapter`].

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate spin;
extern crate irq_safety;
extern crate volatile;
#[cfg(target_arch = "x86_64")] extern crate x86_64;
extern crate byteorder;
extern crate zerocopy;
extern crate mpi;

pub mod tunables;
pub mod platform;
pub mod regs;
pub mod error;
pub mod registry;
pub mod adapter;
pub mod frames;
pub mod handshake;
pub mod interrupt;
pub mod config;
pub mod events;
pub mod diag;
pub mod firmware;
pub mod recovery;
pub mod prefetch;
mod base_driver;

#[cfg(test)]
mod test;

use alloc::{sync::Arc, vec::Vec};
use spin::{Mutex, RwLock};
use mpi::msg::Function;
use mpi::sysif::IocState;
use crate::base_driver::BaseDriver;
use crate::tunables::MAX_ADAPTERS;

pub use crate::adapter::{Adapter, AdapterSettings, BusType, ChipType, PciFunction, PCI_VENDOR_ID_LSI};
pub use crate::config::ConfigParams;
pub use crate::error::*;
pub use crate::events::EventLogEntry;
pub use crate::frames::RequestFrame;
pub use crate::platform::{DmaRegion, Platform, SleepMode};
pub use crate::recovery::{ReadyOutcome, RecoveryReason};
pub use crate::registry::{
    DriverClass, DriverHandle, DriverRegistry, EventHandler, ReplyHandler, ReplyRef, ResetHandler, ResetPhase,
};
pub use crate::regs::{RegisterAccess, RegisterAccessMode};

/// Every attached adapter, indexed by adapter id.
pub struct AdapterTable {
    slots: RwLock<Vec<Option<Arc<Adapter>>>>,
}

impl AdapterTable {
    fn new() -> AdapterTable {
        AdapterTable {
            slots: RwLock::new((0..MAX_ADAPTERS).map(|_| None).collect()),
        }
    }

    pub fn get(&self, id: usize) -> Option<Arc<Adapter>> {
        self.slots.read().get(id).cloned().flatten()
    }

    /// The attached adapter with the lowest id.
    pub fn first(&self) -> Option<Arc<Adapter>> {
        self.slots.read().iter().flatten().next().cloned()
    }

    /// The attached adapter with the lowest id above `prev`.
    pub fn next(&self, prev: usize) -> Option<Arc<Adapter>> {
        self.slots.read().iter().skip(prev + 1).flatten().next().cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Adapter>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    fn remove(&self, id: usize) -> Option<Arc<Adapter>> {
        self.slots.write().get_mut(id).and_then(Option::take)
    }
}

/// The Fusion-MPT subsystem: the protocol driver table and every attached adapter.
pub struct Fusion {
    drivers: Arc<DriverRegistry>,
    adapters: Arc<AdapterTable>,
    base_handle: DriverHandle,
}

impl Fusion {
    /// Creates the driver table and registers the base driver's own handlers.
    pub fn new() -> Result<Fusion, RegistryError> {
        let drivers = Arc::new(DriverRegistry::new());
        let base = Arc::new(BaseDriver);
        let base_handle = drivers.register(base.clone(), DriverClass::Base)?;
        drivers.register_reset_handler(base_handle, base)?;
        Ok(Fusion {
            drivers,
            adapters: Arc::new(AdapterTable::new()),
            base_handle,
        })
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    /// The handle the base driver registered under.
    pub fn base_handle(&self) -> DriverHandle {
        self.base_handle
    }

    pub fn register(&self, handler: Arc<dyn ReplyHandler>, class: DriverClass) -> Result<DriverHandle, RegistryError> {
        self.drivers.register(handler, class)
    }

    pub fn deregister(&self, handle: DriverHandle) {
        self.drivers.deregister(handle)
    }

    pub fn register_event_handler(&self, handle: DriverHandle, handler: Arc<dyn EventHandler>) -> Result<(), RegistryError> {
        self.drivers.register_event_handler(handle, handler)
    }

    pub fn deregister_event_handler(&self, handle: DriverHandle) {
        self.drivers.deregister_event_handler(handle)
    }

    pub fn register_reset_handler(&self, handle: DriverHandle, handler: Arc<dyn ResetHandler>) -> Result<(), RegistryError> {
        self.drivers.register_reset_handler(handle, handler)
    }

    pub fn deregister_reset_handler(&self, handle: DriverHandle) {
        self.drivers.deregister_reset_handler(handle)
    }

    /// Attaches an IOC and brings it up.
    ///
    /// A failed bring-up is logged; the adapter stays attached but inactive.
    pub fn install_adapter(
        &self,
        pci: PciFunction,
        regs: Arc<dyn RegisterAccess>,
        platform: Arc<dyn Platform>,
        settings: AdapterSettings,
    ) -> Result<Arc<Adapter>, AttachError> {
        let chip = ChipType::from_device_id(pci.device_id).ok_or(AttachError::UnknownChip(pci.device_id))?;
        let adapter = {
            let mut slots = self.adapters.slots.write();
            let id = slots.iter().position(Option::is_none).ok_or(AttachError::TableFull)?;
            let adapter = Arc::new(Adapter::new(
                id, pci, chip, regs, platform, settings,
                Arc::clone(&self.drivers), Arc::downgrade(&self.adapters), self.base_handle,
            ));
            slots[id] = Some(Arc::clone(&adapter));
            adapter
        };
        info!("{}: {:?} at {:02X}:{:02X}.{} (rev {:#04X})",
            adapter.name(), chip, pci.bus, pci.slot, pci.function, pci.revision);

        adapter.mask_interrupts();

        if chip.is_dual_function() {
            let sibling = self.adapters.snapshot().into_iter().find(|other| {
                other.id() != adapter.id() && other.alt_id().is_none() && other.pci().is_sibling_of(adapter.pci())
            });
            if let Some(alt) = sibling {
                adapter.set_alt_id(Some(alt.id()));
                alt.set_alt_id(Some(adapter.id()));
                info!("{}: bound to sibling {}", adapter.name(), alt.name());
            }
        }

        if let Err(e) = adapter.do_ioc_recovery(RecoveryReason::Bringup, SleepMode::CanSleep) {
            error!("{}: bring-up failed (code {}), adapter left inactive", adapter.name(), e.code());
        }
        Ok(adapter)
    }

    /// Quiesces an IOC and detaches it.
    ///
    /// An operational IOC gets a message unit reset, and a cached firmware image is
    /// downloaded so the IOC is left bootable.
    pub fn remove_adapter(&self, id: usize) -> Result<(), AttachError> {
        let adapter = self.adapters.get(id).ok_or(AttachError::NoSuchAdapter)?;

        if adapter.ioc_state() == IocState::Operational {
            if let Err(e) = adapter.send_ioc_reset(Function::IocMessageUnitReset, SleepMode::NoSleep) {
                warn!("{}: {}", adapter.name(), e);
            }
        }
        if adapter.has_cached_firmware() {
            if let Err(e) = adapter.downloadboot(SleepMode::NoSleep) {
                warn!("{}: firmware download on removal failed: {:?}", adapter.name(), e);
            }
        }
        adapter.mask_interrupts();
        adapter.free_cached_firmware();

        if let Some(alt) = adapter.sibling() {
            alt.set_alt_id(None);
        }
        adapter.set_alt_id(None);
        self.adapters.remove(id);
        info!("{}: removed", adapter.name());
        Ok(())
    }

    pub fn find_first_adapter(&self) -> Option<Arc<Adapter>> {
        self.adapters.first()
    }

    pub fn find_next_adapter(&self, prev: &Adapter) -> Option<Arc<Adapter>> {
        self.adapters.next(prev.id())
    }

    /// Looks up an attached adapter by id.
    pub fn verify_adapter(&self, id: usize) -> Option<Arc<Adapter>> {
        self.adapters.get(id)
    }

    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.snapshot()
    }

    /// Removes every adapter and deregisters the base driver.
    pub fn shutdown(&self) {
        for adapter in self.adapters.snapshot() {
            if let Err(e) = self.remove_adapter(adapter.id()) {
                warn!("{}: {:?}", adapter.name(), e);
            }
        }
        self.drivers.deregister_reset_handler(self.base_handle);
        self.drivers.deregister(self.base_handle);
    }
}

static FUSION: Mutex<Option<Arc<Fusion>>> = Mutex::new(None);

/// Starts the Fusion-MPT subsystem, or returns the running instance.
pub fn fusion_init() -> Result<Arc<Fusion>, &'static str> {
    let mut fusion = FUSION.lock();
    if let Some(f) = fusion.as_ref() {
        return Ok(Arc::clone(f));
    }
    let f = Arc::new(Fusion::new()?);
    *fusion = Some(Arc::clone(&f));
    info!("mpt_base: Fusion-MPT base driver initialized, base driver at index {}", f.base_handle().raw());
    Ok(f)
}

/// Stops the Fusion-MPT subsystem, detaching every adapter.
pub fn fusion_exit() {
    let fusion = FUSION.lock().take();
    if let Some(f) = fusion {
        f.shutdown();
        info!("mpt_base: Fusion-MPT base driver stopped");
    }
}

/// The running Fusion-MPT subsystem, if started.
pub fn fusion() -> Option<Arc<Fusion>> {
    FUSION.lock().clone()
}
