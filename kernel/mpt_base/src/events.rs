//! Asynchronous event notifications.
//!
//! Once event notification is switched on, the IOC sends an event notification reply
//! for every event it reports. The base driver logs it, records it in the adapter's
//! event log if that event type is being logged, hands it to every registered event handler,
//! and acknowledges it if the IOC asked for an ack.

use core::sync::atomic::Ordering;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use mpi::event::{self, EventCode, EVENT_NOTIFICATION_ACK_REQUIRED};
use mpi::msg::{EventAckRequest, EventNotificationReply, EventNotificationRequest, Function, EVENT_REPLY_DATA_OFFSET};
use crate::adapter::Adapter;
use crate::tunables::EVENT_LOG_DATA_WORDS;

/// One recorded event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventLogEntry {
    pub event: u32,
    /// The log's running context when this event was recorded.
    pub context: u32,
    /// The first event data words, zero where the event carried fewer.
    pub data: [u32; EVENT_LOG_DATA_WORDS],
}

/// A fixed-size ring of recent events.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Vec<Option<EventLogEntry>>,
    /// Bit `n` set records events of type `n`.
    types: u32,
    /// Incremented for every recorded event.
    context: u32,
}

impl EventLog {
    pub fn new(size: usize, types: u32) -> EventLog {
        EventLog {
            entries: (0..size).map(|_| None).collect(),
            types,
            context: 0,
        }
    }

    fn wants(&self, event: u32) -> bool {
        !self.entries.is_empty() && event < 32 && self.types & (1 << event) != 0
    }

    fn record(&mut self, event: u32, data: [u32; EVENT_LOG_DATA_WORDS]) {
        if !self.wants(event) {
            return;
        }
        let idx = self.context as usize % self.entries.len();
        self.entries[idx] = Some(EventLogEntry { event, context: self.context, data });
        self.context = self.context.wrapping_add(1);
    }

    /// The recorded events, oldest first.
    pub fn snapshot(&self) -> Vec<EventLogEntry> {
        let mut events: Vec<EventLogEntry> = self.entries.iter().flatten().copied().collect();
        events.sort_by_key(|e| e.context);
        events
    }
}

impl Adapter {
    /// Replaces the event log with an empty one of `size` entries that records the event types in `types`.
    pub fn alloc_event_log(&self, size: usize, types: u32) {
        *self.event_log.lock(&*self.platform) = EventLog::new(size, types);
    }

    /// The events recorded so far, oldest first.
    pub fn event_log_snapshot(&self) -> Vec<EventLogEntry> {
        self.event_log.lock(&*self.platform).snapshot()
    }

    /// Asks the IOC to turn event notification on or off.
    ///
    /// Returns false if no request frame was free.
    pub(crate) fn send_event_notification(&self, on: bool) -> bool {
        let handle = self.base_handle();
        let Some(mut frame) = self.acquire_request_frame(handle) else {
            warn!("{}: no free request frame for event notification", self.name());
            return false;
        };
        let mut req = EventNotificationRequest::new_zeroed();
        req.switch = on as u8;
        req.function = Function::EventNotification as u8;
        let bytes = self.request_frame_mut(&mut frame);
        if let Some(dst) = bytes.get_mut(..req.as_bytes().len()) {
            dst.copy_from_slice(req.as_bytes());
        }
        debug!("{}: sending event notification ({})", self.name(), if on { "on" } else { "off" });
        self.submit_request(handle, frame);
        true
    }

    fn send_event_ack(&self, reply: &EventNotificationReply) {
        let handle = self.base_handle();
        let Some(mut frame) = self.acquire_request_frame(handle) else {
            warn!("{}: no free request frame to ack event {:#X}", self.name(), reply.event.get());
            return;
        };
        let mut req = EventAckRequest::new_zeroed();
        req.function = Function::EventAck as u8;
        req.event = reply.event;
        req.event_context = reply.event_context;
        let bytes = self.request_frame_mut(&mut frame);
        if let Some(dst) = bytes.get_mut(..req.as_bytes().len()) {
            dst.copy_from_slice(req.as_bytes());
        }
        trace!("{}: acking event {:#X}", self.name(), reply.event.get());
        self.submit_request(handle, frame);
    }

    /// Handles one event notification reply; returns the sum of the event handlers' results.
    pub(crate) fn process_event_notification(&self, reply: &[u8]) -> i32 {
        let Ok((evt, _)) = EventNotificationReply::read_from_prefix(reply) else {
            warn!("{}: short event notification reply ({} bytes)", self.name(), reply.len());
            return 0;
        };
        let event = evt.event.get() & 0xFF;
        let data_words = (evt.event_data_length.get() as usize).min(EVENT_LOG_DATA_WORDS);
        let mut data = [0u32; EVENT_LOG_DATA_WORDS];
        for (i, word) in data.iter_mut().enumerate().take(data_words) {
            let at = EVENT_REPLY_DATA_OFFSET + i * 4;
            if let Some(bytes) = reply.get(at..at + 4) {
                *word = LittleEndian::read_u32(bytes);
            }
        }
        info!("{}: event {:#04X} ({}), data length {}",
            self.name(), event, event::describe(event as u8, data[0]), evt.event_data_length.get());

        if event == EventCode::EventChange as u32 {
            self.event_state.store((data[0] & 0x01) as u8, Ordering::Release);
        }
        self.event_log.lock(&*self.platform).record(event, data);

        let handlers = self.drivers().event_handlers();
        let handled: i32 = handlers.iter().map(|handler| handler.on_event(self, reply)).sum();
        if handled != handlers.len() as i32 {
            debug!("{}: event {:#04X} handled by {} of {} driver(s)", self.name(), event, handled, handlers.len());
        }

        if evt.ack_required == EVENT_NOTIFICATION_ACK_REQUIRED {
            self.send_event_ack(&evt);
        }
        handled
    }
}
