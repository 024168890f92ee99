//! IOC bring-up and recovery.
//!
//! [`Adapter::do_ioc_recovery`] walks the IOC from whatever state it is in to OPERATIONAL:
//! make it READY (resetting it if needed), get IOC and port facts, prime the FIFOs,
//! send IOC init and port enable, upload the firmware if it must be cached,
//! then enable interrupts and event notification.
//! On first bring-up it also prefetches the config pages protocol drivers rely on.
//!
//! A dual-function chip's sibling shares the silicon, so a hard reset of one function
//! resets both; the sibling is walked through the same stages alongside.

use core::mem::size_of;
use core::sync::atomic::Ordering;
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use mpi::msg::{
    DefaultReply, Function, IocFactsReply, IocFactsRequest, IocInitRequest, PortEnableRequest, PortFactsReply,
    PortFactsRequest, ProtocolFlags, IOCFACTS_FLAGS_FW_DOWNLOAD_BOOT, IOCFACTS_REQUEST_FRAME_SIZE_OFFSET,
    IOCINIT_FLAGS_DISCARD_FW_IMAGE,
};
use mpi::sge::AddressWidth;
use mpi::sysif::{self, IocState, WhoInit, DOORBELL_ACTIVE};
use mpi::MPI_VERSION_01_02;
use crate::adapter::{Adapter, BusType};
use crate::error::{FactsError, InitError, ReadyError, RecoveryError};
use crate::frames::FrameGeometry;
use crate::platform::{poll_until, SleepMode};
use crate::registry::ResetPhase;
use crate::tunables::{
    FACTS_TIMEOUT_SECS, FC_MAX_DEVICES, INIT_TIMEOUT_SECS, MAX_REPLY_DEPTH, MAX_REQ_DEPTH, MAX_REQ_FRAME_SIZE,
    OPERATIONAL_TIMEOUT_SECS, PORT_ENABLE_TIMEOUT_FC_SECS, PORT_ENABLE_TIMEOUT_SCSI_SECS, READY_TIMEOUT_SECS,
    REPLY_FRAME_SIZE, SCSI_MAX_DEVICES,
};

/// Why the IOC is being (re)initialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryReason {
    /// First bring-up after attach.
    Bringup,
    /// Recovery after a fault or timeout.
    Recover,
}

/// How `make_ioc_ready` got the IOC to READY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyOutcome {
    AlreadyReady,
    /// A message unit reset was enough.
    MessageUnitReset,
    /// A diagnostic reset was performed.
    HardReset,
    /// The kickstart path ran but found a reset had already happened.
    Restarted,
}

impl ReadyOutcome {
    pub fn code(self) -> i32 {
        match self {
            ReadyOutcome::AlreadyReady | ReadyOutcome::MessageUnitReset | ReadyOutcome::Restarted => 0,
            ReadyOutcome::HardReset => 1,
        }
    }
}

/// Converts the pre-1.2 16-bit firmware version to the 32-bit layout.
fn legacy_fw_version(v: u16) -> u32 {
    let v = v as u32;
    ((v << 12) & 0xFF00_0000) | ((v << 8) & 0x000F_FF00)
}

impl Adapter {
    /// Brings the IOC to the READY state, resetting it as hard as necessary.
    pub fn make_ioc_ready(&self, force: bool, mode: SleepMode) -> Result<ReadyOutcome, ReadyError> {
        let doorbell = self.get_ioc_state(false);
        let state = IocState::from_doorbell(doorbell);
        debug!("{}: make_ioc_ready: doorbell {:#010X} ({:?})", self.name(), doorbell, state);

        // Left in the middle of a handshake.
        let mut statefault = doorbell & DOORBELL_ACTIVE != 0;
        if statefault {
            warn!("{}: doorbell handshake left active, resetting", self.name());
        }

        if !statefault && state == IocState::Ready {
            if self.chip().is_legacy_fc() {
                return Ok(ReadyOutcome::AlreadyReady);
            }
            // Later chips can sit READY with stale state; a message unit reset clears it.
            match self.send_ioc_reset(Function::IocMessageUnitReset, mode) {
                Ok(()) => return Ok(ReadyOutcome::AlreadyReady),
                Err(e) => {
                    warn!("{}: {}", self.name(), e);
                    statefault = true;
                }
            }
        }

        if state == IocState::Fault {
            warn!("{}: IOC is in FAULT state, code {:#06X}", self.name(), sysif::doorbell_fault_code(doorbell));
            statefault = true;
        }

        if state == IocState::Operational {
            if sysif::doorbell_who_init(doorbell) == WhoInit::PciPeer as u8 {
                warn!("{}: IOC is owned by a PCI peer", self.name());
                return Err(ReadyError::OwnedByPeer);
            }
            if !statefault && !force && self.send_ioc_reset(Function::IocMessageUnitReset, mode).is_ok() {
                return Ok(ReadyOutcome::MessageUnitReset);
            }
            statefault = true;
        }

        let reset_done = self.kick_start(statefault || force, mode)?;

        let polls = mode.polls(&*self.platform, READY_TIMEOUT_SECS);
        for _ in 0..polls {
            match self.ioc_state() {
                IocState::Ready => {
                    return Ok(if reset_done { ReadyOutcome::HardReset } else { ReadyOutcome::Restarted });
                }
                IocState::Operational => {
                    self.send_ioc_reset(Function::IocMessageUnitReset, mode)
                        .map_err(|_| ReadyError::MessageUnitResetFailed)?;
                }
                IocState::Reset => {
                    self.send_ioc_reset(Function::IoUnitReset, mode)
                        .map_err(|_| ReadyError::IoUnitResetFailed)?;
                }
                _ => { }
            }
            mode.pause(&*self.platform);
        }
        error!("{}: IOC not READY after {}s, doorbell {:#010X}", self.name(), READY_TIMEOUT_SECS, self.get_ioc_state(false));
        Err(ReadyError::Timeout)
    }

    /// Gets the IOC facts and, on first success, negotiates the frame geometry from them.
    pub(crate) fn get_ioc_facts(&self, reason: RecoveryReason, mode: SleepMode) -> Result<(), FactsError> {
        if self.last_state() == sysif::IOC_STATE_RESET {
            error!("{}: can't get IOC facts, IOC is in RESET", self.name());
            return Err(FactsError::NotReady);
        }

        let mut req = IocFactsRequest::new_zeroed();
        req.function = Function::IocFacts as u8;
        let mut reply = [0u8; size_of::<IocFactsReply>()];
        self.handshake_req_reply_wait(req.as_bytes(), &mut reply, FACTS_TIMEOUT_SECS, mode)
            .map_err(FactsError::Handshake)?;
        let mut facts = IocFactsReply::read_from_bytes(&reply[..]).map_err(|_| FactsError::ShortReply)?;

        if facts.msg_length as usize <= IOCFACTS_REQUEST_FRAME_SIZE_OFFSET / 4 {
            error!("{}: IOC facts reply too short ({} dwords)", self.name(), facts.msg_length);
            return Err(FactsError::ShortReply);
        }
        if facts.msg_version.get() < MPI_VERSION_01_02 {
            facts.fw_version.set(legacy_fw_version(facts.fw_version_legacy.get()));
        }
        let rfs = facts.request_frame_size.get() as usize;
        if rfs == 0 {
            error!("{}: IOC reported a zero request frame size", self.name());
            return Err(FactsError::ZeroFrameSize);
        }

        {
            let mut state = self.state.lock();
            if reason == RecoveryReason::Bringup && state.first_who_init.is_none() {
                state.first_who_init = Some(facts.who_init);
            }
            if !state.negotiated {
                state.geometry = FrameGeometry {
                    req_sz: (rfs * 4).min(MAX_REQ_FRAME_SIZE),
                    req_depth: (facts.global_credits.get() as usize).min(MAX_REQ_DEPTH),
                    reply_sz: REPLY_FRAME_SIZE,
                    reply_depth: (facts.reply_queue_depth.get() as usize).min(MAX_REPLY_DEPTH),
                };
                state.negotiated = true;
                debug!("{}: negotiated frames {:?}", self.name(), state.geometry);
            }
            state.facts = Some(facts);
        }
        self.event_state.store(facts.event_state, Ordering::Release);
        trace!("{}: IOC facts: MsgVersion {:#06X}, FWVersion {:#010X}, {} port(s), who_init {}",
            self.name(), facts.msg_version.get(), facts.fw_version.get(), facts.number_of_ports, facts.who_init);
        Ok(())
    }

    pub(crate) fn get_port_facts(&self, port: usize, mode: SleepMode) -> Result<(), FactsError> {
        if self.last_state() == sysif::IOC_STATE_RESET {
            error!("{}: can't get port facts, IOC is in RESET", self.name());
            return Err(FactsError::NotReady);
        }

        let mut req = PortFactsRequest::new_zeroed();
        req.function = Function::PortFacts as u8;
        req.port_number = port as u8;
        let mut reply = [0u8; size_of::<PortFactsReply>()];
        self.handshake_req_reply_wait(req.as_bytes(), &mut reply, FACTS_TIMEOUT_SECS, mode)
            .map_err(FactsError::Handshake)?;
        let pfacts = PortFactsReply::read_from_bytes(&reply[..]).map_err(|_| FactsError::ShortReply)?;
        if let Some(slot) = self.state.lock().pfacts.get_mut(port) {
            *slot = Some(pfacts);
        }
        Ok(())
    }

    fn send_port_enable(&self, port: usize, mode: SleepMode) -> Result<(), InitError> {
        let mut req = PortEnableRequest::new_zeroed();
        req.function = Function::PortEnable as u8;
        req.port_number = port as u8;
        let secs = match self.bus_type() {
            BusType::Fc => PORT_ENABLE_TIMEOUT_FC_SECS,
            BusType::Scsi => PORT_ENABLE_TIMEOUT_SCSI_SECS,
        };
        let mut reply = [0u8; size_of::<DefaultReply>()];
        self.handshake_req_reply_wait(req.as_bytes(), &mut reply, secs, mode)
            .map_err(InitError::PortEnable)?;
        debug!("{}: port {} enabled", self.name(), port);
        Ok(())
    }

    /// Sends IOC init, enables every port and waits for OPERATIONAL.
    pub(crate) fn send_ioc_init(&self, mode: SleepMode) -> Result<(), InitError> {
        let facts_flags = self.facts().map_or(0, |f| f.flags);
        let (mfa_high, sense_high) = match self.settings().address_width {
            AddressWidth::Bits64 => self.arena_high_addrs(),
            AddressWidth::Bits32 => (0, 0),
        };

        let mut req = IocInitRequest::new_zeroed();
        req.who_init = WhoInit::HostDriver as u8;
        req.function = Function::IocInit as u8;
        req.max_devices = match self.bus_type() {
            BusType::Fc => FC_MAX_DEVICES,
            BusType::Scsi => SCSI_MAX_DEVICES,
        };
        req.max_buses = 1;
        req.reply_frame_size.set(self.geometry().reply_sz as u16);
        req.host_mfa_high_addr.set(mfa_high);
        req.sense_buffer_high_addr.set(sense_high);
        if facts_flags & IOCFACTS_FLAGS_FW_DOWNLOAD_BOOT != 0 {
            if self.any_cached_firmware() {
                req.flags |= IOCINIT_FLAGS_DISCARD_FW_IMAGE;
            } else {
                self.state.lock().upload_fw = true;
            }
        }

        let mut reply = [0u8; size_of::<DefaultReply>()];
        self.handshake_req_reply_wait(req.as_bytes(), &mut reply, INIT_TIMEOUT_SECS, mode)
            .map_err(InitError::Init)?;

        for port in 0..self.number_of_ports() {
            self.send_port_enable(port, mode)?;
        }

        poll_until(&*self.platform, mode, OPERATIONAL_TIMEOUT_SECS, || self.ioc_state() == IocState::Operational)
            .ok_or_else(|| {
                let doorbell = self.get_ioc_state(false);
                error!("{}: IOC not OPERATIONAL after init, doorbell {:#010X}", self.name(), doorbell);
                InitError::NotOperational(doorbell)
            })?;
        debug!("{}: IOC is OPERATIONAL", self.name());
        Ok(())
    }

    fn log_capabilities(&self) {
        let Some(facts) = self.facts() else { return };
        let protocols = self.port_facts(0).map_or(ProtocolFlags::empty(), |p| ProtocolFlags::from_bits_truncate(p.protocol_flags.get()));
        info!("{}: {:?} FWVersion={:#010X}, Ports={}, MaxQ={}, Initiator={}, Target={}, LAN={}",
            self.name(), self.chip(), facts.fw_version.get(), facts.number_of_ports, self.req_depth(),
            protocols.contains(ProtocolFlags::INITIATOR),
            protocols.contains(ProtocolFlags::TARGET),
            protocols.contains(ProtocolFlags::LAN),
        );
    }

    fn facts_with_retry(&self, reason: RecoveryReason, mode: SleepMode) -> Result<(), FactsError> {
        self.get_ioc_facts(reason, mode).or_else(|e| {
            warn!("{}: IOC facts failed ({:?}), retrying", self.name(), e);
            self.get_ioc_facts(reason, mode)
        })?;
        for port in 0..self.number_of_ports() {
            self.get_port_facts(port, mode).or_else(|e| {
                warn!("{}: port {} facts failed ({:?}), retrying", self.name(), port, e);
                self.get_port_facts(port, mode)
            })?;
        }
        Ok(())
    }

    /// Brings the IOC from any state to OPERATIONAL, with interrupts and event notification enabled.
    ///
    /// On failure the adapter is left with interrupts masked and inactive.
    pub fn do_ioc_recovery(&self, reason: RecoveryReason, mode: SleepMode) -> Result<(), RecoveryError> {
        info!("{}: {:?} starting", self.name(), reason);
        let sibling = self.sibling();
        let alt_was_active = sibling.as_ref().map_or(false, |alt| alt.is_active());

        self.mask_interrupts();
        if let Some(alt) = sibling.as_deref() {
            alt.mask_interrupts();
        }

        let outcome = match self.make_ioc_ready(reason == RecoveryReason::Recover, mode) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{}: IOC not ready: {:?}", self.name(), e);
                if e == ReadyError::OwnedByPeer && alt_was_active {
                    if let Some(alt) = sibling.as_deref() {
                        alt.enable_interrupts();
                    }
                }
                return Err(RecoveryError::NotReady(e));
            }
        };
        let hard_reset = outcome == ReadyOutcome::HardReset;
        debug!("{}: IOC ready ({:?})", self.name(), outcome);

        // A sibling is only brought back if it was up before the reset took it down with this one.
        let mut alt_ready = false;
        if hard_reset && alt_was_active {
            if let Some(alt) = sibling.as_deref() {
                match alt.make_ioc_ready(false, mode) {
                    Ok(_) => alt_ready = true,
                    Err(e) => error!("{}: sibling not ready after hard reset: {:?}", alt.name(), e),
                }
            }
        }
        let ready_alt = if alt_ready { sibling.as_deref() } else { None };

        let mut alt_up = false;
        let result = self.bring_up_stages(reason, ready_alt, mode, &mut alt_up);
        let up_alt = if alt_up { ready_alt } else { None };

        if result.is_ok() {
            self.enable_interrupts();
        }
        // Without a hard reset the sibling was only masked; after one it must have come all the way up.
        if alt_was_active {
            if let Some(alt) = sibling.as_deref() {
                if !hard_reset || alt_up {
                    alt.enable_interrupts();
                } else {
                    warn!("{}: left down after {}'s hard reset", alt.name(), self.name());
                }
            }
        }

        if result.is_ok() {
            if self.event_state() == 0 {
                self.send_event_notification(true);
            }
            if let Some(alt) = up_alt {
                if alt.is_active() && alt.event_state() == 0 {
                    alt.send_event_notification(true);
                }
            }
            if reason == RecoveryReason::Bringup {
                self.prefetch_config_pages();
            }
            if hard_reset {
                self.notify_reset_handlers(ResetPhase::Post, up_alt);
            }
        }

        match result {
            Ok(()) => info!("{}: {:?} complete", self.name(), reason),
            Err(e) => error!("{}: {:?} failed at {:?} (code {})", self.name(), reason, e, e.code()),
        }
        result
    }

    /// Runs facts, FIFO priming, IOC init and firmware upload on this IOC and, stage by stage,
    /// on `alt`. `alt_up` is set only if every stage succeeded on both.
    fn bring_up_stages(
        &self,
        reason: RecoveryReason,
        alt: Option<&Adapter>,
        mode: SleepMode,
        alt_up: &mut bool,
    ) -> Result<(), RecoveryError> {
        let mut alt_ok = alt.is_some();

        self.facts_with_retry(reason, mode).map_err(RecoveryError::Facts)?;
        if reason == RecoveryReason::Bringup {
            self.log_capabilities();
        }
        if let Some(alt) = alt {
            if let Err(e) = alt.facts_with_retry(reason, mode) {
                error!("{}: sibling facts failed: {:?}", alt.name(), e);
                alt_ok = false;
            }
        }

        self.prime_fifos().map_err(RecoveryError::Prime)?;
        if let Some(alt) = alt.filter(|_| alt_ok) {
            if let Err(e) = alt.prime_fifos() {
                error!("{}: sibling prime failed: {:?}", alt.name(), e);
                alt_ok = false;
            }
        }

        self.send_ioc_init(mode).map_err(RecoveryError::Init)?;
        if let Some(alt) = alt.filter(|_| alt_ok) {
            if let Err(e) = alt.send_ioc_init(mode) {
                error!("{}: sibling init failed: {:?}", alt.name(), e);
                alt_ok = false;
            }
        }

        if reason == RecoveryReason::Bringup {
            if self.state.lock().upload_fw {
                self.upload_firmware(mode).map_err(RecoveryError::Upload)?;
            }
            if let Some(alt) = alt.filter(|_| alt_ok) {
                if alt.state.lock().upload_fw {
                    if let Err(e) = alt.upload_firmware(mode) {
                        error!("{}: sibling firmware upload failed: {:?}", alt.name(), e);
                        alt_ok = false;
                    }
                }
            }
        }

        *alt_up = alt_ok;
        Ok(())
    }

    /// Resets the IOC (and its sibling) and brings it back up.
    ///
    /// If a reset of either function is already under way this returns at once.
    /// Config requests still waiting afterwards are failed.
    pub fn trigger_hard_reset(&self, mode: SleepMode) -> Result<(), RecoveryError> {
        let sibling = self.sibling();
        {
            let _guard = self.diag_lock.lock();
            let alt_pending = sibling.as_ref().map_or(false, |alt| alt.diag_pending.load(Ordering::Acquire));
            if self.diag_pending.load(Ordering::Acquire) || alt_pending {
                debug!("{}: hard reset already pending", self.name());
                return Ok(());
            }
            self.diag_pending.store(true, Ordering::Release);
            if let Some(alt) = sibling.as_deref() {
                alt.diag_pending.store(true, Ordering::Release);
            }
        }

        warn!("{}: hard reset", self.name());
        self.notify_reset_handlers(ResetPhase::Setup, sibling.as_deref());
        let result = self.do_ioc_recovery(RecoveryReason::Recover, mode);

        self.reload_fw.store(false, Ordering::Release);
        {
            let _guard = self.diag_lock.lock();
            self.diag_pending.store(false, Ordering::Release);
            if let Some(alt) = sibling.as_deref() {
                alt.diag_pending.store(false, Ordering::Release);
            }
        }
        self.fail_pending_configs();
        result
    }
}
