//! Resetting the IOC: message unit and IO unit resets through the doorbell,
//! and the diagnostic ("big hammer") reset through the diagnostic register.

use core::sync::atomic::Ordering;
use mpi::msg::Function;
use mpi::sysif::{Diagnostic, IocState, SysIfReg, DOORBELL_FUNCTION_SHIFT, WRSEQ_DISABLE, WRSEQ_FLUSH, WRSEQ_KEYS};
use crate::adapter::{Adapter, BusType};
use crate::error::{DiagError, ReadyError};
use crate::platform::{poll_until, SleepMode};
use crate::registry::ResetPhase;
use crate::tunables::{
    DIAG_UNLOCK_ATTEMPTS, DIAG_UNLOCK_RETRY_MS, FLASH_BOOT_TIMEOUT_SECS, KICKSTART_SETTLE_SECS,
    READY_TIMEOUT_SECS, RESET_ADAPTER_CLEAR_SECS, RESET_HISTORY_ATTEMPTS,
};

/// Seconds to wait for the IOC to take a reset doorbell word.
const RESET_ACK_TIMEOUT_SECS: u32 = 5;
/// Milliseconds to let a parallel SCSI bus settle after the message unit reset that precedes a kickstart.
const SCSI_MUR_SETTLE_MS: u32 = 1000;

impl Adapter {
    /// Writes the write-sequence keys until the IOC allows diagnostic writes.
    ///
    /// Returns the diagnostic register value with `DRWE` set.
    pub(crate) fn unlock_diag(&self, mode: SleepMode) -> Result<u32, DiagError> {
        let mut diag = self.read32(SysIfReg::Diagnostic);
        let mut attempts = 0;
        while diag & Diagnostic::DRWE.bits() == 0 {
            if attempts == DIAG_UNLOCK_ATTEMPTS {
                error!("{}: diagnostic writes still disabled after {} attempts, diag {:#010X}", self.name(), attempts, diag);
                return Err(DiagError::UnlockFailed);
            }
            self.write32(SysIfReg::WriteSequence, WRSEQ_FLUSH);
            for key in WRSEQ_KEYS {
                self.write32(SysIfReg::WriteSequence, key);
            }
            mode.wait_ms(&*self.platform, DIAG_UNLOCK_RETRY_MS);
            attempts += 1;
            diag = self.read32(SysIfReg::Diagnostic);
        }
        trace!("{}: diagnostic writes enabled after {} attempt(s)", self.name(), attempts);
        Ok(diag)
    }

    /// Sends a message unit reset or IO unit reset through the doorbell and waits for READY.
    pub(crate) fn send_ioc_reset(&self, function: Function, mode: SleepMode) -> Result<(), &'static str> {
        debug!("{}: sending {:?}", self.name(), function);
        self.write32(SysIfReg::Doorbell, (function as u32) << DOORBELL_FUNCTION_SHIFT);
        self.wait_for_doorbell_ack(RESET_ACK_TIMEOUT_SECS, mode)
            .ok_or("mpt_base: IOC didn't ack the reset doorbell")?;
        poll_until(&*self.platform, mode, READY_TIMEOUT_SECS, || self.ioc_state() == IocState::Ready)
            .ok_or("mpt_base: IOC didn't reach READY after reset")?;

        self.event_state.store(0, Ordering::Release);
        if let Some(alt) = self.sibling() {
            alt.event_state.store(0, Ordering::Release);
        }
        Ok(())
    }

    /// Resets the IOC through the diagnostic register.
    ///
    /// The reset is skipped when the reset history bit shows one already happened, unless `ignore`.
    /// Returns whether a reset was performed.
    pub(crate) fn diag_reset(&self, ignore: bool, mode: SleepMode) -> Result<bool, DiagError> {
        self.write32(SysIfReg::IntStatus, 0);
        let mut diag = self.read32(SysIfReg::Diagnostic);
        let sibling = self.sibling();
        let mut reset_done = false;

        if ignore || diag & Diagnostic::RESET_HISTORY.bits() == 0 {
            diag = self.unlock_diag(mode)?;
            let cached = self.any_cached_firmware();
            if cached {
                diag |= Diagnostic::PREVENT_IOC_BOOT.bits();
                self.write32(SysIfReg::Diagnostic, diag);
            }
            self.write32(SysIfReg::Diagnostic, diag | Diagnostic::DISABLE_ARM.bits());
            mode.wait_ms(&*self.platform, 1);
            self.write32(SysIfReg::Diagnostic, diag | Diagnostic::RESET_ADAPTER.bits());
            reset_done = true;
            info!("{}: diagnostic reset issued", self.name());

            self.notify_reset_handlers(ResetPhase::Pre, sibling.as_deref());

            if cached {
                let cleared = poll_until(&*self.platform, mode, RESET_ADAPTER_CLEAR_SECS, || {
                    self.read32(SysIfReg::Diagnostic) & Diagnostic::RESET_ADAPTER.bits() == 0
                });
                if cleared.is_none() {
                    warn!("{}: reset adapter bit never cleared", self.name());
                }
                self.downloadboot(mode)?;
            } else if poll_until(&*self.platform, mode, FLASH_BOOT_TIMEOUT_SECS, || self.ioc_state() == IocState::Ready).is_none() {
                warn!("{}: IOC didn't boot from flash within {}s", self.name(), FLASH_BOOT_TIMEOUT_SECS);
            }
            diag = self.read32(SysIfReg::Diagnostic);
        }

        let mut attempts = 0;
        while diag & Diagnostic::RESET_HISTORY.bits() != 0 {
            if attempts == RESET_HISTORY_ATTEMPTS {
                error!("{}: couldn't clear the reset history bit, diag {:#010X}", self.name(), diag);
                break;
            }
            if diag & Diagnostic::DRWE.bits() == 0 {
                diag = self.unlock_diag(mode)?;
            }
            self.write32(SysIfReg::Diagnostic, diag & !Diagnostic::RESET_HISTORY.bits());
            diag = self.read32(SysIfReg::Diagnostic);
            attempts += 1;
        }

        self.write32(SysIfReg::WriteSequence, WRSEQ_DISABLE);
        diag = self.read32(SysIfReg::Diagnostic);
        let bad = Diagnostic::FLASH_BAD_SIG | Diagnostic::RESET_ADAPTER | Diagnostic::DISABLE_ARM;
        if diag & bad.bits() != 0 {
            error!("{}: diagnostic reset left diag at {:#010X}", self.name(), diag);
            return Err(DiagError::BadState(diag));
        }

        self.event_state.store(0, Ordering::Release);
        if let Some(alt) = sibling.as_deref() {
            alt.event_state.store(0, Ordering::Release);
        }
        Ok(reset_done)
    }

    /// Hard resets the IOC and waits for it to come back READY or OPERATIONAL.
    ///
    /// Returns whether a reset was actually performed.
    pub(crate) fn kick_start(&self, force: bool, mode: SleepMode) -> Result<bool, ReadyError> {
        info!("{}: kickstarting IOC (force {})", self.name(), force);
        if self.bus_type() == BusType::Scsi {
            // Clears some parallel SCSI bus hangs before the hard reset.
            if let Err(e) = self.send_ioc_reset(Function::IocMessageUnitReset, mode) {
                debug!("{}: {}", self.name(), e);
            }
            mode.wait_ms(&*self.platform, SCSI_MUR_SETTLE_MS);
        }

        let reset_done = self.diag_reset(force, mode).map_err(ReadyError::KickStart)?;
        poll_until(&*self.platform, mode, KICKSTART_SETTLE_SECS, || {
            matches!(self.ioc_state(), IocState::Ready | IocState::Operational)
        }).ok_or(ReadyError::KickStartTimeout)?;
        Ok(reset_done)
    }
}
