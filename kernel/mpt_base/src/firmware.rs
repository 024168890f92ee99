//! Firmware upload, caching and download boot.
//!
//! Some IOCs boot from an image the host supplies instead of from their own flash.
//! On first bring-up such an IOC uploads its running image to the host,
//! which keeps it in a few DMA fragments and writes it back into IOC memory,
//! one dword at a time through the diagnostic RW registers, after every diagnostic reset.

use core::mem::size_of;
use alloc::{sync::Arc, vec, vec::Vec};
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use mpi::fw::{ExtImageHeader, FwHeader};
use mpi::msg::{Function, FwUploadReply, FwUploadRequest, FW_UPLOAD_ITYPE_FW_IOC_MEM, FW_UPLOAD_SGL_OFFSET};
use mpi::sge;
use mpi::status::{IOCSTATUS_MASK, IOCSTATUS_SUCCESS};
use mpi::sysif::{Diagnostic, SysIfReg, DIAG_RW_FLASH_BAD_BIT, DIAG_RW_FLASH_STATUS_ADDR, WRSEQ_FLUSH};
use crate::adapter::Adapter;
use crate::error::{DiagError, FirmwareError};
use crate::platform::{DmaRegion, SleepMode};
use crate::tunables::{FW_FRAGMENT_CAP, FW_FRAGMENT_FLOOR, FW_UPLOAD_TIMEOUT_SECS, MAX_FW_IMAGES};

/// Alignment of each firmware fragment.
const FRAGMENT_ALIGN: usize = 8;
/// `DetailsLength` of the transaction context element of an upload request.
const UPLOAD_TC_DETAILS_LENGTH: u8 = 12;

/// An IOC firmware image held by the host, split across DMA fragments.
#[derive(Debug)]
pub struct CachedFirmware {
    fragments: Vec<DmaRegion>,
    size: usize,
}

impl CachedFirmware {
    /// Allocates room for a `size`-byte image in at most `max_fragments` pieces,
    /// starting with one piece and shrinking the piece size when an allocation fails.
    fn allocate(ioc: &Adapter, size: usize, max_fragments: usize) -> Option<CachedFirmware> {
        let mut fragments = Vec::new();
        let mut remaining = size;
        let mut chunk = size;
        while remaining > 0 {
            if fragments.len() == max_fragments {
                return None;
            }
            match DmaRegion::new(&ioc.platform, chunk.min(remaining), FRAGMENT_ALIGN) {
                Some(region) => {
                    remaining -= region.len();
                    fragments.push(region);
                }
                None => {
                    chunk = if chunk > FW_FRAGMENT_CAP { FW_FRAGMENT_CAP } else { chunk / 2 };
                    if chunk < FW_FRAGMENT_FLOOR {
                        return None;
                    }
                }
            }
        }
        Some(CachedFirmware { fragments, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Copies image bytes starting at `offset` into `buf`; returns how many were copied.
    pub fn copy_out(&self, offset: usize, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut base = 0;
        for frag in self.fragments.iter() {
            let start = offset + copied;
            if copied == buf.len() {
                break;
            }
            if start < base + frag.len() {
                let src = &frag.as_slice()[start - base..];
                let n = src.len().min(buf.len() - copied);
                buf[copied..copied + n].copy_from_slice(&src[..n]);
                copied += n;
            }
            base += frag.len();
        }
        copied
    }

    fn read<T: FromBytes>(&self, offset: usize) -> Option<T> {
        let mut buf = vec![0u8; size_of::<T>()];
        if self.copy_out(offset, &mut buf) != buf.len() {
            return None;
        }
        T::read_from_bytes(&buf).ok()
    }

    /// The dword at `offset`, zero-padded past the end of the image.
    fn word(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.copy_out(offset, &mut buf);
        u32::from_le_bytes(buf)
    }
}

impl Adapter {
    /// Uploads the IOC's running firmware image and caches it.
    ///
    /// If the sibling function already caches an image the new copy is dropped.
    pub(crate) fn upload_firmware(&self, mode: SleepMode) -> Result<(), FirmwareError> {
        let size = self.facts().map_or(0, |f| f.fw_image_size.get()) as usize;
        let width = self.settings().address_width;
        let req_sz = self.geometry().req_sz;
        let max_fragments = req_sz.saturating_sub(FW_UPLOAD_SGL_OFFSET) / width.sge_size();

        let image = CachedFirmware::allocate(self, size, max_fragments).ok_or_else(|| {
            error!("{}: couldn't allocate {} bytes for the firmware image", self.name(), size);
            FirmwareError::NoMemory
        })?;
        debug!("{}: uploading {} byte firmware image in {} fragment(s)", self.name(), size, image.fragment_count());

        let mut req = FwUploadRequest::new_zeroed();
        req.image_type = FW_UPLOAD_ITYPE_FW_IOC_MEM;
        req.function = Function::FwUpload as u8;
        req.tcsge.details_length = UPLOAD_TC_DETAILS_LENGTH;
        req.tcsge.image_size.set(size as u32);

        let mut request = vec![0u8; req_sz];
        request[..FW_UPLOAD_SGL_OFFSET].copy_from_slice(req.as_bytes());
        let mut len = FW_UPLOAD_SGL_OFFSET;
        let last = image.fragments.len().saturating_sub(1);
        for (i, frag) in image.fragments.iter().enumerate() {
            let flags = if i == last { width.single_read() } else { width.simple_read() };
            len += sge::add_simple(&mut request[len..], width, flags.flags_length(frag.len() as u32), frag.phys())
                .ok_or(FirmwareError::NoMemory)?;
        }

        let mut reply = [0u8; size_of::<FwUploadReply>()];
        self.handshake_req_reply_wait(&request[..len], &mut reply, FW_UPLOAD_TIMEOUT_SECS, mode)
            .map_err(FirmwareError::Handshake)?;
        let (reply, _) = FwUploadReply::read_from_prefix(&reply[..]).map_err(|_| FirmwareError::BadStatus(0))?;

        let status = reply.ioc_status.get() & IOCSTATUS_MASK;
        if status != IOCSTATUS_SUCCESS {
            error!("{}: firmware upload failed with IOC status {:#X}", self.name(), status);
            return Err(FirmwareError::BadStatus(status));
        }
        let actual = reply.actual_image_size.get();
        if actual as usize != size {
            error!("{}: firmware upload returned {} bytes, expected {}", self.name(), actual, size);
            return Err(FirmwareError::SizeMismatch { expected: size as u32, actual });
        }

        if self.sibling().map_or(false, |alt| alt.has_cached_firmware()) {
            debug!("{}: sibling already caches the firmware image", self.name());
        } else {
            *self.cached_fw.lock() = Some(image);
        }
        info!("{}: firmware image uploaded ({} bytes)", self.name(), size);
        Ok(())
    }

    /// Drops the cached firmware image.
    pub(crate) fn free_cached_firmware(&self) {
        if self.cached_fw.lock().take().is_some() {
            debug!("{}: freed cached firmware image", self.name());
        }
    }

    /// Writes the cached firmware image (this adapter's or its sibling's) into IOC memory
    /// and lets the IOC boot from it.
    pub(crate) fn downloadboot(&self, mode: SleepMode) -> Result<(), DiagError> {
        let sibling: Option<Arc<Adapter>> = if self.has_cached_firmware() { None } else { self.sibling() };
        let owner: &Adapter = sibling.as_deref().unwrap_or(self);
        let cached = owner.cached_fw.lock();
        let image = cached.as_ref().ok_or(DiagError::NoImage)?;

        let diag = self.unlock_diag(mode)?;
        self.write32(SysIfReg::Diagnostic, diag | (Diagnostic::DISABLE_ARM | Diagnostic::RW_ENABLE).bits());

        let header: FwHeader = image.read(0).ok_or(DiagError::BadImage)?;
        trace!("{}: downloading main image of {} bytes to {:#X}",
            self.name(), header.image_size.get(), header.load_start_address.get());
        self.download_segment(image, 0, header.load_start_address.get(), header.image_size.get());

        let mut next = header.next_image_header_offset.get() as usize;
        let mut images = 1;
        while next != 0 {
            if images == MAX_FW_IMAGES {
                error!("{}: firmware image chain is too long", self.name());
                return Err(DiagError::BadImage);
            }
            let ext: ExtImageHeader = image.read(next).ok_or(DiagError::BadImage)?;
            trace!("{}: downloading extended image of {} bytes to {:#X}",
                self.name(), ext.image_size.get(), ext.load_start_address.get());
            self.download_segment(image, next, ext.load_start_address.get(), ext.image_size.get());
            next = ext.next_image_header_offset.get() as usize;
            images += 1;
        }

        self.write32(SysIfReg::DiagRwAddress, header.iop_reset_reg_addr.get());
        self.write32(SysIfReg::DiagRwData, header.iop_reset_vector_value.get());

        self.write32(SysIfReg::DiagRwAddress, DIAG_RW_FLASH_STATUS_ADDR);
        let flash = self.read32(SysIfReg::DiagRwData) | DIAG_RW_FLASH_BAD_BIT;
        self.write32(SysIfReg::DiagRwAddress, DIAG_RW_FLASH_STATUS_ADDR);
        self.write32(SysIfReg::DiagRwData, flash);

        let diag = self.read32(SysIfReg::Diagnostic)
            & !(Diagnostic::DISABLE_ARM | Diagnostic::RW_ENABLE | Diagnostic::FLASH_BAD_SIG).bits();
        self.write32(SysIfReg::Diagnostic, diag);
        self.write32(SysIfReg::WriteSequence, WRSEQ_FLUSH);
        debug!("{}: downloaded {} firmware image(s)", self.name(), images);
        Ok(())
    }

    fn download_segment(&self, image: &CachedFirmware, offset: usize, load_addr: u32, size: u32) {
        self.write32(SysIfReg::DiagRwAddress, load_addr);
        for i in 0..(size as usize + 3) / 4 {
            self.write32(SysIfReg::DiagRwData, image.word(offset + i * 4));
        }
    }
}
