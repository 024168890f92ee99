//! The doorbell handshake.
//!
//! Small synchronous requests (facts, init, port enable, firmware upload, task management)
//! are pushed through the doorbell register one dword at a time.
//! When the request expects a doorbell reply, it is read back one half-word at a time.
//!
//! An exchange walks through [`HandshakeState`]s; each step performs exactly one wait.
//! Every wait honors the caller's [`SleepMode`].

use byteorder::{ByteOrder, LittleEndian};
use mpi::msg::{MsgContext, REPLY_MSG_LENGTH};
use mpi::sysif::{self, IntStatus, SysIfReg, DOORBELL_ACTIVE, DOORBELL_DATA_MASK};
use crate::adapter::Adapter;
use crate::error::HandshakeError;
use crate::frames::RequestFrame;
use crate::platform::{poll_until, SleepMode};
use crate::registry::DriverHandle;
use crate::tunables::{HANDSHAKE_REPLY_HWORDS, TASK_MGMT_TIMEOUT_SECS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandshakeState {
    Idle,
    WaitDoorbellInt,
    CheckActive,
    SendWord(usize),
    /// Reading reply half-words; holds how many have arrived.
    WaitReply(usize),
    FinalInt,
    Done,
}

struct Exchange<'a> {
    ioc: &'a Adapter,
    request: &'a [u8],
    /// `None` when the reply comes back through the reply FIFO.
    reply: Option<&'a mut [u16; HANDSHAKE_REPLY_HWORDS]>,
    secs: u32,
    mode: SleepMode,
    state: HandshakeState,
    /// Reply length in half-words, known once the second half-word arrives.
    reply_hwords: usize,
}

impl<'a> Exchange<'a> {
    fn dwords(&self) -> usize {
        (self.request.len() + 3) / 4
    }

    fn request_word(&self, i: usize) -> u32 {
        let mut word = [0u8; 4];
        let start = i * 4;
        let end = (start + 4).min(self.request.len());
        word[..end - start].copy_from_slice(&self.request[start..end]);
        LittleEndian::read_u32(&word)
    }

    fn step(&mut self) -> Result<HandshakeState, HandshakeError> {
        let ioc = self.ioc;
        let next = match self.state {
            HandshakeState::Idle => {
                ioc.write32(SysIfReg::IntStatus, 0);
                ioc.write32(SysIfReg::Doorbell, sysif::handshake_doorbell(self.dwords()));
                HandshakeState::WaitDoorbellInt
            }
            HandshakeState::WaitDoorbellInt => {
                ioc.wait_for_doorbell_int(self.secs, self.mode).ok_or(HandshakeError::DoorbellIntTimeout)?;
                HandshakeState::CheckActive
            }
            HandshakeState::CheckActive => {
                if ioc.read32(SysIfReg::Doorbell) & DOORBELL_ACTIVE == 0 {
                    return Err(HandshakeError::DoorbellNotActive);
                }
                ioc.write32(SysIfReg::IntStatus, 0);
                ioc.wait_for_doorbell_ack(self.secs, self.mode).ok_or(HandshakeError::AckTimeout)?;
                HandshakeState::SendWord(0)
            }
            HandshakeState::SendWord(i) if i == self.dwords() => {
                if self.reply.is_some() { HandshakeState::WaitReply(0) } else { HandshakeState::FinalInt }
            }
            HandshakeState::SendWord(i) => {
                ioc.write32(SysIfReg::Doorbell, self.request_word(i));
                ioc.wait_for_doorbell_ack(self.secs, self.mode).ok_or(HandshakeError::RequestWordAckTimeout)?;
                HandshakeState::SendWord(i + 1)
            }
            HandshakeState::WaitReply(received) => {
                ioc.wait_for_doorbell_int(self.secs, self.mode).ok_or(HandshakeError::ReplyTimeout)?;
                let hword = (ioc.read32(SysIfReg::Doorbell) & DOORBELL_DATA_MASK) as u16;
                if let Some(reply) = self.reply.as_deref_mut() {
                    // Anything beyond the buffer is read and dropped.
                    if let Some(slot) = reply.get_mut(received) {
                        *slot = hword;
                    }
                    if received == 1 {
                        // MsgLength, in dwords, is the byte at offset 2 of every reply.
                        self.reply_hwords = (reply[REPLY_MSG_LENGTH / 2] & 0xFF) as usize * 2;
                    }
                }
                ioc.write32(SysIfReg::IntStatus, 0);
                let received = received + 1;
                if received >= 2 && received >= self.reply_hwords {
                    HandshakeState::FinalInt
                } else {
                    HandshakeState::WaitReply(received)
                }
            }
            HandshakeState::FinalInt => {
                ioc.wait_for_doorbell_int(self.secs, self.mode).ok_or(HandshakeError::FinalIntTimeout)?;
                ioc.write32(SysIfReg::IntStatus, 0);
                HandshakeState::Done
            }
            HandshakeState::Done => HandshakeState::Done,
        };
        self.state = next;
        Ok(next)
    }

    fn run(mut self) -> Result<usize, HandshakeError> {
        loop {
            match self.step() {
                Ok(HandshakeState::Done) => return Ok(self.reply_hwords),
                Ok(_) => { }
                Err(e) => {
                    self.ioc.write32(SysIfReg::IntStatus, 0);
                    warn!("{}: handshake failed in {:?}: {:?}", self.ioc.name(), self.state, e);
                    return Err(e);
                }
            }
        }
    }
}

impl Adapter {
    /// Waits for the IOC to take the last doorbell word (the doorbell status bit clears).
    pub(crate) fn wait_for_doorbell_ack(&self, secs: u32, mode: SleepMode) -> Option<u32> {
        poll_until(&*self.platform, mode, secs, || {
            let status = IntStatus::from_bits_truncate(self.read32(SysIfReg::IntStatus));
            !status.contains(IntStatus::IOP_DOORBELL_STATUS)
        })
    }

    /// Waits for the IOC to raise its doorbell interrupt.
    pub(crate) fn wait_for_doorbell_int(&self, secs: u32, mode: SleepMode) -> Option<u32> {
        poll_until(&*self.platform, mode, secs, || {
            let status = IntStatus::from_bits_truncate(self.read32(SysIfReg::IntStatus));
            status.contains(IntStatus::DOORBELL_INTERRUPT)
        })
    }

    /// Sends `request` through the doorbell and reads the reply into `reply`.
    ///
    /// Replies longer than `reply` are read to the end and truncated.
    /// Returns the reply length in bytes as reported by the IOC.
    pub fn handshake_req_reply_wait(&self, request: &[u8], reply: &mut [u8], secs: u32, mode: SleepMode) -> Result<usize, HandshakeError> {
        let mut hwords = [0u16; HANDSHAKE_REPLY_HWORDS];
        let len = Exchange {
            ioc: self,
            request,
            reply: Some(&mut hwords),
            secs,
            mode,
            state: HandshakeState::Idle,
            reply_hwords: 0,
        }.run()?;

        for (chunk, hword) in reply.chunks_mut(2).zip(hwords.iter()) {
            let bytes = hword.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        trace!("{}: handshake reply of {} bytes", self.name(), len * 2);
        Ok(len * 2)
    }

    /// Sends a request through the doorbell whose reply comes back through the reply FIFO.
    pub(crate) fn handshake_send(&self, request: &[u8], secs: u32, mode: SleepMode) -> Result<(), HandshakeError> {
        Exchange {
            ioc: self,
            request,
            reply: None,
            secs,
            mode,
            state: HandshakeState::Idle,
            reply_hwords: 0,
        }.run().map(|_| ())
    }

    /// Sends the first `len` bytes of a request frame through the doorbell,
    /// bypassing the request FIFO. Used for task management.
    ///
    /// The frame is stamped for `handle`; its reply arrives through the interrupt path.
    /// On failure the frame goes back to the free list.
    pub fn send_handshake_request(&self, handle: DriverHandle, mut frame: RequestFrame, len: usize, mode: SleepMode) -> Result<(), HandshakeError> {
        let ctx = MsgContext { req_idx: frame.index(), cb_idx: handle.raw() };
        let mut request = [0u8; crate::tunables::MAX_REQ_FRAME_SIZE];
        let len = {
            let bytes = self.request_frame_mut(&mut frame);
            let _ = ctx.write(bytes);
            let len = len.min(bytes.len());
            request[..len].copy_from_slice(&bytes[..len]);
            len
        };
        match self.handshake_send(&request[..len], TASK_MGMT_TIMEOUT_SECS, mode) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.release_request_frame(handle, frame);
                Err(e)
            }
        }
    }
}
