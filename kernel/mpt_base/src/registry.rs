//! The protocol driver table.
//!
//! Upper-layer drivers (SCSI host, LAN, target mode, management) register a reply handler
//! and get back a small handle. The handle travels in every request's `MsgContext`,
//! so the interrupt path can route each reply back to the driver that sent the request.
//! Event and reset handlers are attached to an existing handle.
//!
//! The table is shared by all adapters. Handles are given out from the top slot down;
//! slot 0 is never used, so a zero callback byte in a reply is always invalid.

use core::num::NonZeroU8;
use alloc::{sync::Arc, vec::Vec};
use spin::RwLock;
use crate::adapter::Adapter;
use crate::error::RegistryError;
use crate::frames::RequestFrame;
use crate::tunables::MAX_PROTOCOL_DRIVERS;

/// A registered protocol driver's slot in the driver table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverHandle(NonZeroU8);

impl DriverHandle {
    /// Interprets a raw callback byte. Returns `None` for zero.
    pub fn from_raw(raw: u8) -> Option<DriverHandle> {
        NonZeroU8::new(raw).map(DriverHandle)
    }

    pub fn raw(self) -> u8 {
        self.0.get()
    }

    fn index(self) -> usize {
        self.0.get() as usize
    }
}

/// What kind of protocol driver owns a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverClass {
    Base,
    ScsiHost,
    Lan,
    ScsiTarget,
    Ioctl,
    Dmp,
    Unknown,
}

/// The reply handed to a [`ReplyHandler`].
#[derive(Clone, Copy, Debug)]
pub enum ReplyRef<'a> {
    /// A full reply frame, valid only for the duration of the call.
    Frame(&'a [u8]),
    /// A context-only reply; the raw value read from the reply FIFO.
    Context(u32),
}

/// Receives completions for the requests a protocol driver posted.
pub trait ReplyHandler: Send + Sync {
    /// Handles one reply. `request` is the originating frame, if there is one.
    ///
    /// Returns true if the request frame should go back to the free list now.
    fn on_reply(&self, ioc: &Adapter, request: Option<&RequestFrame>, reply: Option<ReplyRef<'_>>) -> bool;
}

/// Receives asynchronous event notifications.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, ioc: &Adapter, reply: &[u8]) -> i32;
}

/// The phases of an IOC reset, in the order they are announced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetPhase {
    /// A reset is about to start; nothing has been touched yet.
    Setup,
    /// The IOC has just been hard reset; outstanding frames are meaningless.
    Pre,
    /// The IOC is operational again.
    Post,
}

/// Learns about IOC resets.
pub trait ResetHandler: Send + Sync {
    fn on_reset(&self, ioc: &Adapter, phase: ResetPhase) -> i32;
}

#[derive(Clone)]
struct Slot {
    reply: Option<Arc<dyn ReplyHandler>>,
    class: DriverClass,
    event: Option<Arc<dyn EventHandler>>,
    reset: Option<Arc<dyn ResetHandler>>,
}

impl Slot {
    const fn empty() -> Slot {
        Slot { reply: None, class: DriverClass::Unknown, event: None, reset: None }
    }
}

struct Table {
    slots: Vec<Slot>,
    /// The most recently assigned slot, for diagnostics.
    last_drv_idx: usize,
    lan: Option<DriverHandle>,
    target: Option<DriverHandle>,
    registered: usize,
}

/// The process-wide protocol driver table.
pub struct DriverRegistry {
    table: RwLock<Table>,
}

impl DriverRegistry {
    pub fn new() -> DriverRegistry {
        DriverRegistry {
            table: RwLock::new(Table {
                slots: (0..MAX_PROTOCOL_DRIVERS).map(|_| Slot::empty()).collect(),
                last_drv_idx: 0,
                lan: None,
                target: None,
                registered: 0,
            }),
        }
    }

    /// Registers a protocol driver's reply handler, returning its handle.
    ///
    /// Slots are searched from the top of the table down, so successive registrations
    /// return strictly decreasing handles.
    pub fn register(&self, handler: Arc<dyn ReplyHandler>, class: DriverClass) -> Result<DriverHandle, RegistryError> {
        let mut table = self.table.write();
        let idx = (1..MAX_PROTOCOL_DRIVERS).rev()
            .find(|&i| table.slots[i].reply.is_none())
            .ok_or(RegistryError::TableFull)?;
        let handle = DriverHandle::from_raw(idx as u8).ok_or(RegistryError::InvalidHandle)?;

        table.slots[idx] = Slot { reply: Some(handler), class, event: None, reset: None };
        table.last_drv_idx = idx;
        table.registered += 1;
        match class {
            DriverClass::Lan => table.lan = Some(handle),
            DriverClass::ScsiTarget => table.target = Some(handle),
            _ => { }
        }
        debug!("mpt_base: registered {:?} driver at index {}", class, idx);
        Ok(handle)
    }

    /// Clears every handler of a slot. Deregistering a free slot does nothing.
    pub fn deregister(&self, handle: DriverHandle) {
        let mut table = self.table.write();
        let idx = handle.index();
        let Some(slot) = table.slots.get_mut(idx) else { return };
        if slot.reply.is_none() {
            return;
        }
        let class = slot.class;
        *slot = Slot::empty();
        table.registered -= 1;
        if table.lan == Some(handle) { table.lan = None; }
        if table.target == Some(handle) { table.target = None; }
        debug!("mpt_base: deregistered {:?} driver at index {}", class, idx);
    }

    pub fn register_event_handler(&self, handle: DriverHandle, handler: Arc<dyn EventHandler>) -> Result<(), RegistryError> {
        let mut table = self.table.write();
        let slot = table.slots.get_mut(handle.index()).ok_or(RegistryError::InvalidHandle)?;
        slot.event = Some(handler);
        Ok(())
    }

    pub fn deregister_event_handler(&self, handle: DriverHandle) {
        if let Some(slot) = self.table.write().slots.get_mut(handle.index()) {
            slot.event = None;
        }
    }

    pub fn register_reset_handler(&self, handle: DriverHandle, handler: Arc<dyn ResetHandler>) -> Result<(), RegistryError> {
        let mut table = self.table.write();
        let slot = table.slots.get_mut(handle.index()).ok_or(RegistryError::InvalidHandle)?;
        slot.reset = Some(handler);
        Ok(())
    }

    pub fn deregister_reset_handler(&self, handle: DriverHandle) {
        if let Some(slot) = self.table.write().slots.get_mut(handle.index()) {
            slot.reset = None;
        }
    }

    /// Looks up the reply handler for a callback byte taken from a reply.
    pub(crate) fn reply_handler(&self, cb_idx: u8) -> Option<Arc<dyn ReplyHandler>> {
        if cb_idx == 0 {
            return None;
        }
        self.table.read().slots.get(cb_idx as usize).and_then(|s| s.reply.clone())
    }

    /// Every registered event handler, from the top slot down.
    pub(crate) fn event_handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        let table = self.table.read();
        table.slots.iter().skip(1).rev().filter_map(|s| s.event.clone()).collect()
    }

    /// Every registered reset handler, from the top slot down.
    pub(crate) fn reset_handlers(&self) -> Vec<Arc<dyn ResetHandler>> {
        let table = self.table.read();
        table.slots.iter().skip(1).rev().filter_map(|s| s.reset.clone()).collect()
    }

    pub fn class_of(&self, handle: DriverHandle) -> Option<DriverClass> {
        let table = self.table.read();
        table.slots.get(handle.index()).filter(|s| s.reply.is_some()).map(|s| s.class)
    }

    /// The handle of the registered LAN driver.
    pub fn lan_handle(&self) -> Option<DriverHandle> {
        self.table.read().lan
    }

    /// The handle of the registered SCSI target-mode driver.
    pub fn target_handle(&self) -> Option<DriverHandle> {
        self.table.read().target
    }

    /// The slot most recently handed out.
    pub fn last_assigned(&self) -> Option<DriverHandle> {
        DriverHandle::from_raw(self.table.read().last_drv_idx as u8)
    }

    /// How many slots are registered.
    pub fn registered_count(&self) -> usize {
        self.table.read().registered
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        DriverRegistry::new()
    }
}
