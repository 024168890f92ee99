//! The base driver's own protocol handlers.
//!
//! The base driver registers like any protocol driver. Its reply handler receives
//! event notification, event ack and config replies; its reset handler keeps
//! pending config requests consistent across hard resets.

use mpi::msg::{self, Function, MSGFLAGS_CONTINUATION_REPLY};
use crate::adapter::Adapter;
use crate::frames::RequestFrame;
use crate::registry::{ReplyHandler, ReplyRef, ResetHandler, ResetPhase};

pub(crate) struct BaseDriver;

impl ReplyHandler for BaseDriver {
    fn on_reply(&self, ioc: &Adapter, request: Option<&RequestFrame>, reply: Option<ReplyRef<'_>>) -> bool {
        let Some(request) = request else { return true };
        let Some(ReplyRef::Frame(reply)) = reply else {
            trace!("{}: base driver context reply for frame {}", ioc.name(), request.index());
            return true;
        };

        let function = msg::function_of(reply).unwrap_or(0xFF);
        match Function::try_from(function) {
            Ok(Function::EventNotification) => {
                let handled = ioc.process_event_notification(reply);
                trace!("{}: event handled by {} driver(s)", ioc.name(), handled);
                // More replies for the same request follow; keep its frame.
                msg::msg_flags_of(reply).map_or(true, |f| f & MSGFLAGS_CONTINUATION_REPLY == 0)
            }
            Ok(Function::EventAck) => {
                debug!("{}: event ack reply, IOC status {:#06X}", ioc.name(), msg::ioc_status_of(reply).unwrap_or(0));
                true
            }
            Ok(Function::Config) => ioc.complete_config(request, reply),
            _ => {
                error!("{}: unexpected reply function {:#04X} for the base driver", ioc.name(), function);
                true
            }
        }
    }
}

impl ResetHandler for BaseDriver {
    fn on_reset(&self, ioc: &Adapter, phase: ResetPhase) -> i32 {
        debug!("{}: base driver reset phase {:?}", ioc.name(), phase);
        match phase {
            ResetPhase::Setup => { }
            ResetPhase::Pre => ioc.disarm_config_timers(),
            ResetPhase::Post => ioc.fail_pending_configs(),
        }
        1
    }
}
