//! Request and reply frame pools.
//!
//! Each adapter owns three DMA arenas, allocated once on the first successful facts:
//! * request frames, `req_depth` slots of `req_sz` bytes, handed out from a free list;
//! * reply frames, `reply_depth` slots of `reply_sz` bytes that the IOC writes replies into;
//! * sense buffers, one per request frame.
//!
//! Every (re)prime posts all reply frame addresses to the reply FIFO
//! and rebuilds the request free list in index order.
//! The free list and the pending config queue share one lock.

use alloc::{collections::VecDeque, sync::Arc, vec, vec::Vec};
use spin::Once;
use mpi::msg::MsgContext;
use mpi::sge::AddressWidth;
use mpi::sysif::SysIfReg;
use crate::adapter::Adapter;
use crate::config::PendingConfig;
use crate::error::PrimeError;
use crate::platform::{DmaRegion, IrqSafeGuard, IrqSafeMutex, Platform};
use crate::registry::DriverHandle;
use crate::tunables::{FRAME_ALIGN, REQUEST_ARENA_ROUNDING, SENSE_BUFFER_SIZE};

/// Negotiated frame sizes (bytes) and depths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameGeometry {
    pub req_sz: usize,
    pub req_depth: usize,
    pub reply_sz: usize,
    pub reply_depth: usize,
}

/// Exclusive ownership of one request frame.
///
/// Obtained from [`Adapter::acquire_request_frame`] and given up by
/// [`Adapter::submit_request`] or [`Adapter::release_request_frame`].
/// The interrupt path hands a borrowed one to reply handlers.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestFrame {
    idx: u16,
}

impl RequestFrame {
    pub(crate) fn in_flight(idx: u16) -> RequestFrame {
        RequestFrame { idx }
    }

    /// The frame's slot in the request arena.
    pub fn index(&self) -> u16 {
        self.idx
    }
}

pub(crate) struct FrameArenas {
    geometry: FrameGeometry,
    request: DmaRegion,
    reply: DmaRegion,
    sense: DmaRegion,
}

impl FrameArenas {
    fn allocate(platform: &Arc<dyn Platform>, geometry: FrameGeometry, width: AddressWidth) -> Result<FrameArenas, PrimeError> {
        let reply_len = geometry.reply_sz * geometry.reply_depth;
        let request_len = round_up(geometry.req_sz * geometry.req_depth, REQUEST_ARENA_ROUNDING);
        let sense_len = geometry.req_depth * SENSE_BUFFER_SIZE;

        // Dropping a region on the error paths below frees it.
        let reply = DmaRegion::new(platform, reply_len, FRAME_ALIGN).ok_or(PrimeError::NoMemory)?;
        let request = DmaRegion::new(platform, request_len, FRAME_ALIGN).ok_or(PrimeError::NoMemory)?;
        let sense = DmaRegion::new(platform, sense_len, FRAME_ALIGN).ok_or(PrimeError::NoMemory)?;

        match width {
            AddressWidth::Bits64 => {
                // The IOC is told one high address for both request and reply frames.
                if (reply.phys() >> 32) != (request.phys() >> 32)
                    || ((reply.phys() + reply_len as u64 - 1) >> 32) != (reply.phys() >> 32)
                    || ((request.phys() + request_len as u64 - 1) >> 32) != (request.phys() >> 32)
                {
                    return Err(PrimeError::HighAddressMismatch);
                }
            }
            AddressWidth::Bits32 => {
                let top = [&reply, &request, &sense].iter().map(|r| r.phys() + r.len() as u64).max().unwrap_or(0);
                if top > (1u64 << 32) {
                    return Err(PrimeError::AddressTooHigh);
                }
            }
        }

        Ok(FrameArenas { geometry, request, reply, sense })
    }

    fn request_phys(&self, idx: u16) -> u64 {
        self.request.phys() + (idx as usize * self.geometry.req_sz) as u64
    }
}

fn round_up(len: usize, to: usize) -> usize {
    (len + to - 1) / to * to
}

/// The lock-protected part of the frame pools.
pub(crate) struct FrameQueues {
    free: VecDeque<u16>,
    in_free: Vec<bool>,
    /// Config requests waiting for a reply.
    pub config_q: Vec<Arc<PendingConfig>>,
}

impl FrameQueues {
    fn rebuild(&mut self, depth: usize) {
        self.free = (0..depth as u16).collect();
        self.in_free = vec![true; depth];
    }
}

pub(crate) struct FramePools {
    arenas: Once<FrameArenas>,
    queues: IrqSafeMutex<FrameQueues>,
}

impl FramePools {
    pub fn new() -> FramePools {
        FramePools {
            arenas: Once::new(),
            queues: IrqSafeMutex::new(FrameQueues { free: VecDeque::new(), in_free: Vec::new(), config_q: Vec::new() }),
        }
    }

    pub fn arenas(&self) -> Option<&FrameArenas> {
        self.arenas.get()
    }
}

impl Adapter {
    /// Locks the free list and the config queue, holding off interrupts on this CPU.
    pub(crate) fn lock_queues(&self) -> IrqSafeGuard<'_, FrameQueues> {
        self.frames.queues.lock(&*self.platform)
    }

    /// Takes a request frame off the free list and stamps it for `handle`.
    ///
    /// Returns `None` if the adapter is inactive or no frame is free.
    pub fn acquire_request_frame(&self, handle: DriverHandle) -> Option<RequestFrame> {
        if !self.is_active() {
            debug!("{}: acquire_request_frame: adapter not active", self.name());
            return None;
        }
        let idx = {
            let mut queues = self.lock_queues();
            let idx = queues.free.pop_front()?;
            if let Some(flag) = queues.in_free.get_mut(idx as usize) {
                *flag = false;
            }
            idx
        };
        let mut frame = RequestFrame { idx };
        self.stamp(handle, &mut frame);
        Some(frame)
    }

    /// Puts a request frame back on the free list.
    pub fn release_request_frame(&self, handle: DriverHandle, frame: RequestFrame) {
        let mut queues = self.lock_queues();
        match queues.in_free.get_mut(frame.idx as usize) {
            Some(flag) if !*flag => {
                *flag = true;
                queues.free.push_back(frame.idx);
            }
            Some(_) => warn!("{}: driver {} released frame {} twice, ignoring", self.name(), handle.raw(), frame.idx),
            None => warn!("{}: driver {} released unknown frame {}", self.name(), handle.raw(), frame.idx),
        }
    }

    /// Posts a request frame to the IOC. The reply comes back through the interrupt path.
    pub fn submit_request(&self, handle: DriverHandle, mut frame: RequestFrame) {
        self.stamp(handle, &mut frame);
        let Some(arenas) = self.frames.arenas() else {
            error!("{}: submit_request with no request arena", self.name());
            return;
        };
        let phys = arenas.request_phys(frame.idx);
        trace!("{}: posting frame {} ({:#X}) for driver {}", self.name(), frame.idx, phys, handle.raw());
        self.write32(SysIfReg::RequestFifo, phys as u32);
    }

    /// The bytes of a request frame.
    pub fn request_frame<'a>(&'a self, frame: &'a RequestFrame) -> &'a [u8] {
        self.frames.arenas()
            .and_then(|a| a.request.bytes(frame.idx as usize * a.geometry.req_sz, a.geometry.req_sz))
            .unwrap_or(&[])
    }

    /// The bytes of a request frame, for filling in a request.
    pub fn request_frame_mut<'a>(&'a self, frame: &'a mut RequestFrame) -> &'a mut [u8] {
        let Some(arenas) = self.frames.arenas() else { return &mut [] };
        let sz = arenas.geometry.req_sz;
        // The `RequestFrame` token is the only owner of this slot.
        unsafe { arenas.request.bytes_mut(frame.idx as usize * sz, sz) }.unwrap_or(&mut [])
    }

    /// The sense buffer belonging to a request frame.
    pub fn sense_buffer<'a>(&'a self, frame: &'a RequestFrame) -> &'a [u8] {
        self.frames.arenas()
            .and_then(|a| a.sense.bytes(frame.idx as usize * SENSE_BUFFER_SIZE, SENSE_BUFFER_SIZE))
            .unwrap_or(&[])
    }

    /// The bus address of a request frame's sense buffer.
    pub fn sense_buffer_phys(&self, frame: &RequestFrame) -> Option<u64> {
        self.frames.arenas().map(|a| a.sense.phys() + (frame.idx as usize * SENSE_BUFFER_SIZE) as u64)
    }

    /// The bus address of a request frame.
    pub fn request_frame_phys(&self, frame: &RequestFrame) -> Option<u64> {
        self.frames.arenas().map(|a| a.request_phys(frame.idx))
    }

    /// How many request frames are on the free list.
    pub fn free_frame_count(&self) -> usize {
        self.lock_queues().free.len()
    }

    /// The number of request frames, once negotiated.
    pub fn req_depth(&self) -> usize {
        self.frames.arenas().map_or(0, |a| a.geometry.req_depth)
    }

    /// The request frame size in bytes, once negotiated.
    pub fn req_sz(&self) -> usize {
        self.frames.arenas().map_or(0, |a| a.geometry.req_sz)
    }

    fn stamp(&self, handle: DriverHandle, frame: &mut RequestFrame) {
        let ctx = MsgContext { req_idx: frame.idx, cb_idx: handle.raw() };
        if ctx.write(self.request_frame_mut(frame)).is_none() {
            error!("{}: can't stamp request frame {}", self.name(), frame.idx);
        }
    }

    /// Finds the reply frame at bus address `addr` (low 32 bits).
    pub(crate) fn reply_frame(&self, addr: u32) -> Option<&[u8]> {
        let arenas = self.frames.arenas()?;
        let offset = addr.wrapping_sub(arenas.reply.phys() as u32) as usize;
        let sz = arenas.geometry.reply_sz;
        if sz == 0 || offset % sz != 0 {
            return None;
        }
        arenas.reply.bytes(offset, sz)
    }

    /// Upper 32 bits of the request frame and sense buffer bus addresses, as given to IOC init.
    pub(crate) fn arena_high_addrs(&self) -> (u32, u32) {
        self.frames.arenas()
            .map_or((0, 0), |a| ((a.request.phys() >> 32) as u32, (a.sense.phys() >> 32) as u32))
    }

    /// Allocates the frame arenas if needed, posts every reply frame to the IOC,
    /// and rebuilds the request free list.
    pub(crate) fn prime_fifos(&self) -> Result<(), PrimeError> {
        let geometry = self.geometry();
        let arenas = self.frames.arenas.try_call_once(|| {
            let arenas = FrameArenas::allocate(&self.platform, geometry, self.settings().address_width)?;
            debug!("{}: request frames @ {:#X}, reply frames @ {:#X}, sense buffers @ {:#X}",
                self.name(), arenas.request.phys(), arenas.reply.phys(), arenas.sense.phys());
            Ok(arenas)
        }).map_err(|e| {
            error!("{}: couldn't allocate frame arenas: {:?}", self.name(), e);
            e
        })?;
        if arenas.geometry != geometry {
            warn!("{}: frame geometry changed from {:?} to {:?}; keeping the original", self.name(), arenas.geometry, geometry);
        }

        let g = arenas.geometry;
        for i in 0..g.reply_depth {
            let phys = arenas.reply.phys() + (i * g.reply_sz) as u64;
            self.write32(SysIfReg::ReplyFifo, phys as u32);
        }
        self.lock_queues().rebuild(g.req_depth);
        debug!("{}: primed {} reply frames and {} request frames", self.name(), g.reply_depth, g.req_depth);
        Ok(())
    }
}
