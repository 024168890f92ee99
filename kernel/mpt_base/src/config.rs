//! Configuration page requests.
//!
//! [`Adapter::do_config`] posts a config request through the request FIFO and blocks until
//! the base driver's reply handler completes it, its deadline passes, or a reset fails it.
//!
//! Each in-flight request is tracked by a [`PendingConfig`] node on the adapter's config queue.
//! The node's id travels in the last dword of the request frame, which the IOC never reads,
//! so a reply can find its node and a node is completed exactly once: whoever unlinks it.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use alloc::{sync::Arc, vec::Vec};
use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use mpi::msg::{ConfigAction, ConfigPageHeader, ConfigReply, ConfigRequest, Function, CONFIG_PAGETYPE_MASK, CONFIG_REQUEST_SGE_OFFSET};
use mpi::sge;
use mpi::status::{self, IOCSTATUS_MASK, IOCSTATUS_SUCCESS};
use crate::adapter::Adapter;
use crate::error::ConfigError;
use crate::frames::RequestFrame;
use crate::platform::{DmaRegion, SleepMode};
use crate::tunables::MIN_CONFIG_TIMEOUT_SECS;

/// Alignment of config page buffers.
const PAGE_BUFFER_ALIGN: usize = 8;

/// What to ask of a config page.
#[derive(Clone, Copy, Debug)]
pub struct ConfigParams {
    /// The page's header. Filled in from the reply on success.
    pub header: ConfigPageHeader,
    pub action: ConfigAction,
    pub page_address: u32,
    /// Bus address of the page buffer, `page_length` dwords long. Not needed for `PageHeader`.
    pub phys_addr: Option<u64>,
    /// Seconds before the request is given up on. Never less than the minimum.
    pub timeout_secs: u32,
}

/// One config request waiting for its reply.
#[derive(Debug)]
pub struct PendingConfig {
    id: u32,
    /// Milliseconds since boot after which the request times out; 0 when disarmed.
    deadline_ms: AtomicU64,
    done: AtomicBool,
    status: AtomicU16,
    /// The page header from the reply, packed little-endian.
    header: AtomicU32,
}

impl PendingConfig {
    pub(crate) fn new(id: u32, deadline_ms: u64) -> PendingConfig {
        PendingConfig {
            id,
            deadline_ms: AtomicU64::new(deadline_ms),
            done: AtomicBool::new(false),
            status: AtomicU16::new(status::CONFIG_ERROR),
            header: AtomicU32::new(0),
        }
    }

    fn complete(&self, status: u16) {
        self.status.store(status, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn status(&self) -> u16 {
        self.status.load(Ordering::Acquire)
    }

    fn reply_header(&self) -> ConfigPageHeader {
        let [page_version, page_length, page_number, page_type] = self.header.load(Ordering::Acquire).to_le_bytes();
        ConfigPageHeader { page_version, page_length, page_number, page_type }
    }
}

impl Adapter {
    /// Issues one config request and waits for its reply.
    ///
    /// Must not be called from interrupt context.
    pub fn do_config(&self, params: &mut ConfigParams) -> Result<(), ConfigError> {
        if self.platform.in_interrupt() {
            error!("{}: config request for page type {:#X} from interrupt context", self.name(), params.header.page_type);
            return Err(ConfigError::InInterrupt);
        }
        let handle = self.base_handle();
        let mut frame = self.acquire_request_frame(handle).ok_or_else(|| {
            debug!("{}: no free request frame for config request", self.name());
            ConfigError::NoFreeFrame
        })?;

        let id = self.next_config_id.fetch_add(1, Ordering::Relaxed);
        if !self.fill_config_request(&mut frame, params, id) {
            error!("{}: request frame too small for a config request", self.name());
            self.release_request_frame(handle, frame);
            return Err(ConfigError::NoFreeFrame);
        }

        let timeout_ms = params.timeout_secs.max(MIN_CONFIG_TIMEOUT_SECS) as u64 * 1000;
        let pending = Arc::new(PendingConfig::new(id, self.platform.now_ms() + timeout_ms));
        self.lock_queues().config_q.push(Arc::clone(&pending));
        trace!("{}: config action {:?} page type {:#X} number {} (id {})",
            self.name(), params.action, params.header.page_type, params.header.page_number, id);
        self.submit_request(handle, frame);

        while !pending.is_done() {
            self.expire_config_timers();
            if pending.is_done() {
                break;
            }
            SleepMode::CanSleep.pause(&*self.platform);
        }

        match pending.status.load(Ordering::Acquire) {
            IOCSTATUS_SUCCESS => {
                params.header = pending.reply_header();
                Ok(())
            }
            s => {
                debug!("{}: config request {} failed: {}", self.name(), id, status::describe(s));
                Err(ConfigError::IocStatus(s))
            }
        }
    }

    fn fill_config_request(&self, frame: &mut RequestFrame, params: &ConfigParams, id: u32) -> bool {
        let width = self.settings().address_width;
        let bytes = self.request_frame_mut(frame);
        let req_sz = bytes.len();
        if req_sz < core::mem::size_of::<ConfigRequest>() + 4 {
            return false;
        }

        let mut req = ConfigRequest::new_zeroed();
        req.action = params.action as u8;
        req.function = Function::Config as u8;
        req.header = params.header;
        req.header.page_type &= CONFIG_PAGETYPE_MASK;
        req.page_address.set(params.page_address);
        bytes[..core::mem::size_of::<ConfigRequest>()].copy_from_slice(req.as_bytes());

        let (flags_length, addr) = match params.phys_addr {
            Some(phys) => {
                let flags = if params.action.is_write() { width.single_write() } else { width.single_read() };
                (flags.flags_length(params.header.byte_len() as u32), phys)
            }
            None => (width.single_read().flags_length(0), u64::MAX),
        };
        if sge::add_simple(&mut bytes[CONFIG_REQUEST_SGE_OFFSET..], width, flags_length, addr).is_none() {
            return false;
        }
        LittleEndian::write_u32(&mut bytes[req_sz - 4..], id);
        true
    }

    /// Times out every config request whose deadline has passed,
    /// then hard resets the IOC to fail them.
    pub(crate) fn expire_config_timers(&self) {
        let now = self.platform.now_ms();
        let expired: Vec<Arc<PendingConfig>> = {
            let queues = self.lock_queues();
            queues.config_q.iter()
                .filter(|p| {
                    let deadline = p.deadline_ms.load(Ordering::Acquire);
                    deadline != 0 && now >= deadline
                })
                .map(|p| {
                    p.deadline_ms.store(0, Ordering::Release);
                    Arc::clone(p)
                })
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        error!("{}: {} config request(s) timed out, resetting the IOC", self.name(), expired.len());
        if let Err(e) = self.trigger_hard_reset(SleepMode::CanSleep) {
            error!("{}: hard reset after config timeout failed: {:?}", self.name(), e);
        }

        // A reset already under way elsewhere won't have failed these yet.
        // Only the path that unlinks a node may complete it.
        let mut queues = self.lock_queues();
        for p in expired.iter() {
            if let Some(pos) = queues.config_q.iter().position(|q| q.id == p.id) {
                queues.config_q.remove(pos);
                p.complete(status::CONFIG_ERROR);
            }
        }
    }

    /// Completes the config request that `request` carries with `reply`.
    ///
    /// Returns true if the request frame should be freed, which is the case
    /// only when a waiting request was found.
    pub(crate) fn complete_config(&self, request: &RequestFrame, reply: &[u8]) -> bool {
        let frame = self.request_frame(request);
        let Some(id) = frame.len().checked_sub(4).map(|at| LittleEndian::read_u32(&frame[at..])) else {
            return false;
        };
        let parsed = ConfigReply::read_from_prefix(reply).ok().map(|(cfg, _)| cfg);

        let mut queues = self.lock_queues();
        let Some(pos) = queues.config_q.iter().position(|p| p.id == id) else {
            warn!("{}: config reply for unknown request {}", self.name(), id);
            return false;
        };
        let pending = queues.config_q.remove(pos);
        pending.deadline_ms.store(0, Ordering::Release);
        let Some(cfg) = parsed else {
            pending.complete(status::CONFIG_ERROR);
            return true;
        };
        let ioc_status = cfg.ioc_status.get() & IOCSTATUS_MASK;
        if ioc_status == IOCSTATUS_SUCCESS {
            let h = cfg.header;
            pending.header.store(u32::from_le_bytes([h.page_version, h.page_length, h.page_number, h.page_type]), Ordering::Release);
        }
        pending.complete(ioc_status);
        true
    }

    /// Stops every config request's timer, for the start of a hard reset.
    pub(crate) fn disarm_config_timers(&self) {
        for p in self.lock_queues().config_q.iter() {
            p.deadline_ms.store(0, Ordering::Release);
        }
    }

    /// Unlinks and fails every waiting config request.
    pub(crate) fn fail_pending_configs(&self) {
        let failed: Vec<Arc<PendingConfig>> = self.lock_queues().config_q.drain(..).collect();
        for p in failed.iter() {
            p.complete(status::CONFIG_ERROR);
        }
        if !failed.is_empty() {
            debug!("{}: failed {} pending config request(s)", self.name(), failed.len());
        }
    }

    /// The number of config requests waiting for a reply.
    pub fn pending_config_count(&self) -> usize {
        self.lock_queues().config_q.len()
    }

    /// Fetches only the header of a config page, which gives its version and length.
    pub fn read_config_header(&self, page_type: u8, page_number: u8, page_address: u32) -> Result<ConfigPageHeader, ConfigError> {
        let mut params = ConfigParams {
            header: ConfigPageHeader::request(page_type, page_number),
            action: ConfigAction::PageHeader,
            page_address,
            phys_addr: None,
            timeout_secs: self.settings().config_timeout_secs,
        };
        self.do_config(&mut params)?;
        Ok(params.header)
    }

    /// Reads the current value of a config page: first its header, then the page itself.
    pub fn read_config_page(&self, page_type: u8, page_number: u8, page_address: u32) -> Result<(ConfigPageHeader, DmaRegion), ConfigError> {
        let header = self.read_config_header(page_type, page_number, page_address)?;
        if header.page_length == 0 {
            return Err(ConfigError::IocStatus(status::IOCSTATUS_CONFIG_INVALID_PAGE));
        }

        let page = DmaRegion::new(&self.platform, header.byte_len(), PAGE_BUFFER_ALIGN).ok_or(ConfigError::NoMemory)?;
        let mut params = ConfigParams {
            header,
            action: ConfigAction::ReadCurrent,
            page_address,
            phys_addr: Some(page.phys()),
            timeout_secs: self.settings().config_timeout_secs,
        };
        self.do_config(&mut params)?;
        Ok((params.header, page))
    }

    /// Writes a config page previously read with [`Adapter::read_config_page`].
    pub fn write_config_page(&self, header: ConfigPageHeader, page: &DmaRegion, action: ConfigAction, page_address: u32) -> Result<(), ConfigError> {
        let mut params = ConfigParams {
            header,
            action,
            page_address,
            phys_addr: Some(page.phys()),
            timeout_secs: self.settings().config_timeout_secs,
        };
        self.do_config(&mut params)
    }
}
