//! The interrupt-time reply engine.
//!
//! Drains the reply FIFO, decodes each value, and routes it to the protocol driver
//! whose handle is in the reply's `MsgContext`. Nothing here blocks or fails loudly:
//! malformed values from the IOC are logged and dropped.

use core::sync::atomic::{fence, Ordering};
use mpi::msg::{self, MsgContext};
use mpi::status::{self, FcLogDetail, IOCSTATUS_FLAG_LOG_INFO_AVAILABLE};
use mpi::sysif::{ReplyDescriptor, SysIfReg, REPLY_FIFO_EMPTY};
use crate::adapter::Adapter;
use crate::frames::RequestFrame;
use crate::registry::{DriverHandle, ReplyRef};
use crate::tunables::MAX_PROTOCOL_DRIVERS;

impl Adapter {
    /// Services the adapter's reply interrupt. Returns whether any reply was found.
    pub fn handle_interrupt(&self) -> bool {
        let mut handled = false;
        loop {
            let raw = self.read32(SysIfReg::ReplyFifo);
            if raw == REPLY_FIFO_EMPTY {
                break;
            }
            handled = true;
            trace!("{}: reply FIFO {:#010X}", self.name(), raw);

            match ReplyDescriptor::decode(raw) {
                ReplyDescriptor::Address(addr) => self.handle_address_reply(addr),
                ReplyDescriptor::Context { req_idx, cb_idx } => self.dispatch_reply(req_idx, cb_idx, None),
                ReplyDescriptor::ScsiTarget(raw) => self.dispatch_context(self.drivers().target_handle(), raw),
                ReplyDescriptor::Lan(raw) => self.dispatch_context(self.drivers().lan_handle(), raw),
                ReplyDescriptor::LanFreeOnly { req_idx } => {
                    if !self.is_active() {
                        debug!("{}: LAN free-only reply for frame {} while inactive", self.name(), req_idx);
                    } else if (req_idx as usize) < self.req_depth() {
                        let handle = self.drivers().lan_handle().unwrap_or(self.base_handle());
                        self.release_request_frame(handle, RequestFrame::in_flight(req_idx));
                    } else {
                        warn!("{}: LAN free-only reply for bad frame index {}", self.name(), req_idx);
                    }
                }
            }
            // Replies are consumed in FIFO order; nothing from one may be reordered past the next read.
            fence(Ordering::SeqCst);
        }
        handled
    }

    fn handle_address_reply(&self, addr: u32) {
        let Some(reply) = self.reply_frame(addr) else {
            warn!("{}: reply at bad address {:#010X}", self.name(), addr);
            return;
        };
        match MsgContext::read(reply) {
            Some(ctx) => {
                if let Some(ioc_status) = msg::ioc_status_of(reply) {
                    if ioc_status & IOCSTATUS_FLAG_LOG_INFO_AVAILABLE != 0 {
                        self.report_log_info(msg::ioc_log_info_of(reply).unwrap_or(0));
                    }
                }
                self.dispatch_reply(ctx.req_idx, ctx.cb_idx, Some(ReplyRef::Frame(reply)));
            }
            None => warn!("{}: reply frame at {:#010X} too short", self.name(), addr),
        }
        // Hand the reply frame back to the IOC.
        self.write32(SysIfReg::ReplyFifo, addr);
    }

    fn report_log_info(&self, log_info: u32) {
        if self.chip().is_legacy_fc() {
            let info = status::decode_fc_log_info(log_info);
            match info.detail {
                FcLogDetail::Description(d) => warn!("{}: LogInfo({:#010X}): {}: {}", self.name(), log_info, info.subclass, d),
                FcLogDetail::InvalidFieldOffset(off) => warn!("{}: LogInfo({:#010X}): {}: offset {:#X}", self.name(), log_info, info.subclass, off),
                FcLogDetail::StateChange(s) => warn!("{}: LogInfo({:#010X}): {}: state {:#X}", self.name(), log_info, info.subclass, s),
            }
        } else {
            let info = status::decode_spi_log_info(log_info);
            warn!("{}: LogInfo({:#010X}): {}", self.name(), log_info, info.description);
            if info.wants_fw_reload {
                self.reload_fw.store(true, Ordering::Release);
            }
        }
    }

    /// Hands a reply to the driver that owns `cb_idx`, freeing the request frame if it asks.
    fn dispatch_reply(&self, req_idx: u16, cb_idx: u8, reply: Option<ReplyRef<'_>>) {
        if cb_idx as usize >= MAX_PROTOCOL_DRIVERS {
            warn!("{}: reply with bad callback index {} (frame {})", self.name(), cb_idx, req_idx);
            return;
        }
        let (Some(handle), Some(handler)) = (DriverHandle::from_raw(cb_idx), self.drivers().reply_handler(cb_idx)) else {
            warn!("{}: reply for unregistered callback index {} (frame {})", self.name(), cb_idx, req_idx);
            return;
        };
        if req_idx as usize >= self.req_depth() {
            warn!("{}: reply with bad frame index {} for callback {}", self.name(), req_idx, cb_idx);
            return;
        }

        let frame = RequestFrame::in_flight(req_idx);
        if handler.on_reply(self, Some(&frame), reply) && self.is_active() {
            self.release_request_frame(handle, frame);
        }
    }

    fn dispatch_context(&self, handle: Option<DriverHandle>, raw: u32) {
        match handle.and_then(|h| self.drivers().reply_handler(h.raw())) {
            Some(handler) => {
                handler.on_reply(self, None, Some(ReplyRef::Context(raw)));
            }
            None => warn!("{}: context reply {:#010X} with no driver to take it", self.name(), raw),
        }
    }
}
