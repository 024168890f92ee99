//! MPI function codes and the request/reply messages exchanged by the base driver.
//!
//! Every request starts with the same 12-byte header shape: function-specific bytes,
//! `ChainOffset` at byte 2, `Function` at byte 3, `MsgFlags` at byte 7
//! and the 32-bit `MsgContext` at byte 8.
//! Every reply mirrors it, with `MsgLength` (in dwords) at byte 2,
//! `IOCStatus` at byte 14 and `IOCLogInfo` at byte 16.

use core::mem::size_of;
use byteorder::{ByteOrder, LittleEndian};
use num_enum::TryFromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};
use crate::{Le16, Le32};

/// Request and reply function codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Function {
    ScsiIoRequest        = 0x00,
    ScsiTaskMgmt         = 0x01,
    IocInit              = 0x02,
    IocFacts             = 0x03,
    Config               = 0x04,
    PortFacts            = 0x05,
    PortEnable           = 0x06,
    EventNotification    = 0x07,
    EventAck             = 0x08,
    FwDownload           = 0x09,
    TargetCmdBufferPost  = 0x0A,
    TargetAssist         = 0x0B,
    TargetStatusSend     = 0x0C,
    TargetModeAbort      = 0x0D,
    FwUpload             = 0x12,
    LanSend              = 0x20,
    LanReceive           = 0x21,
    LanReset             = 0x22,
    IocMessageUnitReset  = 0x40,
    IoUnitReset          = 0x41,
    Handshake            = 0x42,
}

pub const MSG_CHAIN_OFFSET: usize = 2;
pub const MSG_FUNCTION: usize = 3;
pub const MSG_FLAGS: usize = 7;
pub const MSG_CONTEXT: usize = 8;
pub const REPLY_MSG_LENGTH: usize = 2;
pub const REPLY_IOC_STATUS: usize = 14;
pub const REPLY_IOC_LOG_INFO: usize = 16;

/// Set in a reply's `MsgFlags` when more replies will follow for the same request.
pub const MSGFLAGS_CONTINUATION_REPLY: u8 = 0x80;

/// The driver's view of `MsgContext`: the request frame index and the callback handle
/// that owns the request. The IOC hands it back unchanged in the matching reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgContext {
    pub req_idx: u16,
    pub cb_idx: u8,
}

impl MsgContext {
    /// Reads the context from a request or reply frame, which must be at least 12 bytes.
    pub fn read(frame: &[u8]) -> Option<MsgContext> {
        let ctx = frame.get(MSG_CONTEXT..MSG_CONTEXT + 4)?;
        Some(MsgContext {
            req_idx: LittleEndian::read_u16(&ctx[0..2]),
            cb_idx: ctx[2],
        })
    }

    /// Stamps the context into a request frame, clearing the reserved byte.
    pub fn write(self, frame: &mut [u8]) -> Option<()> {
        let ctx = frame.get_mut(MSG_CONTEXT..MSG_CONTEXT + 4)?;
        LittleEndian::write_u16(&mut ctx[0..2], self.req_idx);
        ctx[2] = self.cb_idx;
        ctx[3] = 0;
        Some(())
    }

    pub fn as_u32(self) -> u32 {
        ((self.cb_idx as u32) << 16) | self.req_idx as u32
    }
}

/// Reads the function code byte of a request or reply.
pub fn function_of(frame: &[u8]) -> Option<u8> {
    frame.get(MSG_FUNCTION).copied()
}

/// Reads the `MsgFlags` byte of a request or reply.
pub fn msg_flags_of(frame: &[u8]) -> Option<u8> {
    frame.get(MSG_FLAGS).copied()
}

/// Reads `IOCStatus` from a reply frame.
pub fn ioc_status_of(reply: &[u8]) -> Option<u16> {
    reply.get(REPLY_IOC_STATUS..REPLY_IOC_STATUS + 2).map(LittleEndian::read_u16)
}

/// Reads `IOCLogInfo` from a reply frame.
pub fn ioc_log_info_of(reply: &[u8]) -> Option<u32> {
    reply.get(REPLY_IOC_LOG_INFO..REPLY_IOC_LOG_INFO + 4).map(LittleEndian::read_u32)
}

/// The layout shared by every reply.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DefaultReply {
    pub function_dependent1: Le16,
    pub msg_length: u8,
    pub function: u8,
    pub function_dependent2: Le16,
    pub function_dependent3: u8,
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub function_dependent4: Le16,
    pub ioc_status: Le16,
    pub ioc_log_info: Le32,
}
const_assert_eq!(size_of::<DefaultReply>(), 20);

/// A request with no payload beyond the common header, used for IOC facts.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IocFactsRequest {
    pub reserved: [u8; 2],
    pub chain_offset: u8,
    pub function: u8,
    pub reserved1: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: Le32,
}
const_assert_eq!(size_of::<IocFactsRequest>(), 12);

/// IOC facts flag: the IOC boots from a host-downloaded image rather than its flash.
pub const IOCFACTS_FLAGS_FW_DOWNLOAD_BOOT: u8 = 0x04;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IocFactsReply {
    pub msg_version: Le16,
    pub msg_length: u8,
    pub function: u8,
    pub header_version: Le16,
    pub ioc_number: u8,
    pub reserved: u8,
    pub msg_context: Le32,
    pub ioc_exceptions: Le16,
    pub ioc_status: Le16,
    pub ioc_log_info: Le32,
    pub max_chain_depth: u8,
    pub who_init: u8,
    pub block_size: u8,
    pub flags: u8,
    pub reply_queue_depth: Le16,
    pub request_frame_size: Le16,
    pub fw_version_legacy: Le16,
    pub product_id: Le16,
    pub current_host_mfa_high_addr: Le32,
    pub global_credits: Le16,
    pub number_of_ports: u8,
    pub event_state: u8,
    pub current_sense_buffer_high_addr: Le32,
    pub cur_reply_frame_size: Le16,
    pub max_devices: u8,
    pub max_buses: u8,
    pub fw_image_size: Le32,
    pub reserved4: Le32,
    pub reserved5: Le32,
    pub fw_version: Le32,
}
const_assert_eq!(size_of::<IocFactsReply>(), 64);

/// Byte offset of `RequestFrameSize` within [`IocFactsReply`].
pub const IOCFACTS_REQUEST_FRAME_SIZE_OFFSET: usize = 26;
/// Byte offset of `FWImageSize` within [`IocFactsReply`].
pub const IOCFACTS_FW_IMAGE_SIZE_OFFSET: usize = 48;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PortFactsRequest {
    pub reserved: [u8; 2],
    pub chain_offset: u8,
    pub function: u8,
    pub reserved1: [u8; 2],
    pub port_number: u8,
    pub msg_flags: u8,
    pub msg_context: Le32,
}
const_assert_eq!(size_of::<PortFactsRequest>(), 12);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PortFactsReply {
    pub reserved: Le16,
    pub msg_length: u8,
    pub function: u8,
    pub reserved1: Le16,
    pub port_number: u8,
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub reserved2: Le16,
    pub ioc_status: Le16,
    pub ioc_log_info: Le32,
    pub reserved3: u8,
    pub port_type: u8,
    pub max_devices: Le16,
    pub port_scsi_id: Le16,
    pub protocol_flags: Le16,
    pub max_posted_cmd_buffers: Le16,
    pub max_persistent_ids: Le16,
    pub max_lan_buckets: Le16,
    pub reserved4: Le16,
    pub reserved5: Le32,
}
const_assert_eq!(size_of::<PortFactsReply>(), 40);

bitflags! {
    /// The protocols a port supports, from port facts.
    pub struct ProtocolFlags: u16 {
        const LOGBUSADDR = 0x01;
        const LAN        = 0x02;
        const TARGET     = 0x04;
        const INITIATOR  = 0x08;
    }
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IocInitRequest {
    pub who_init: u8,
    pub reserved: u8,
    pub chain_offset: u8,
    pub function: u8,
    pub flags: u8,
    pub max_devices: u8,
    pub max_buses: u8,
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub reply_frame_size: Le16,
    pub reserved1: [u8; 2],
    pub host_mfa_high_addr: Le32,
    pub sense_buffer_high_addr: Le32,
}
const_assert_eq!(size_of::<IocInitRequest>(), 24);

/// IOC init flag: the host already holds the firmware image, don't keep an upload copy.
pub const IOCINIT_FLAGS_DISCARD_FW_IMAGE: u8 = 0x01;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PortEnableRequest {
    pub reserved: [u8; 2],
    pub chain_offset: u8,
    pub function: u8,
    pub reserved1: [u8; 2],
    pub port_number: u8,
    pub msg_flags: u8,
    pub msg_context: Le32,
}
const_assert_eq!(size_of::<PortEnableRequest>(), 12);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EventNotificationRequest {
    pub switch: u8,
    pub reserved1: u8,
    pub chain_offset: u8,
    pub function: u8,
    pub reserved2: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: Le32,
}
const_assert_eq!(size_of::<EventNotificationRequest>(), 12);

/// The fixed part of an event notification reply; `event_data_length` dwords of data follow.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EventNotificationReply {
    pub event_data_length: Le16,
    pub msg_length: u8,
    pub function: u8,
    pub reserved1: Le16,
    pub ack_required: u8,
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub reserved2: Le16,
    pub ioc_status: Le16,
    pub ioc_log_info: Le32,
    pub event: Le32,
    pub event_context: Le32,
}
const_assert_eq!(size_of::<EventNotificationReply>(), 28);

/// Byte offset of the first event data dword in an event notification reply.
pub const EVENT_REPLY_DATA_OFFSET: usize = 28;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EventAckRequest {
    pub reserved1: Le16,
    pub chain_offset: u8,
    pub function: u8,
    pub reserved2: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub event: Le32,
    pub event_context: Le32,
}
const_assert_eq!(size_of::<EventAckRequest>(), 20);

/// The header at the start of every configuration page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ConfigPageHeader {
    pub page_version: u8,
    /// Page length in dwords, including this header.
    pub page_length: u8,
    pub page_number: u8,
    pub page_type: u8,
}
const_assert_eq!(size_of::<ConfigPageHeader>(), 4);

impl ConfigPageHeader {
    /// A header naming a page whose version and length are not yet known.
    pub const fn request(page_type: u8, page_number: u8) -> ConfigPageHeader {
        ConfigPageHeader { page_version: 0, page_length: 0, page_number, page_type }
    }

    /// The page size in bytes.
    pub fn byte_len(&self) -> usize {
        self.page_length as usize * 4
    }
}

/// Config request actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConfigAction {
    PageHeader       = 0x00,
    ReadCurrent      = 0x01,
    WriteCurrent     = 0x02,
    Default          = 0x03,
    WriteNvram       = 0x04,
    ReadDefault      = 0x05,
    ReadNvram        = 0x06,
}

impl ConfigAction {
    /// Whether the page buffer flows from host to IOC for this action.
    pub fn is_write(self) -> bool {
        matches!(self, ConfigAction::WriteCurrent | ConfigAction::WriteNvram)
    }
}

pub const CONFIG_PAGETYPE_IO_UNIT:       u8 = 0x00;
pub const CONFIG_PAGETYPE_IOC:           u8 = 0x01;
pub const CONFIG_PAGETYPE_BIOS:          u8 = 0x02;
pub const CONFIG_PAGETYPE_SCSI_PORT:     u8 = 0x03;
pub const CONFIG_PAGETYPE_SCSI_DEVICE:   u8 = 0x04;
pub const CONFIG_PAGETYPE_FC_PORT:       u8 = 0x05;
pub const CONFIG_PAGETYPE_FC_DEVICE:     u8 = 0x06;
pub const CONFIG_PAGETYPE_LAN:           u8 = 0x07;
pub const CONFIG_PAGETYPE_RAID_VOLUME:   u8 = 0x08;
pub const CONFIG_PAGETYPE_MANUFACTURING: u8 = 0x09;
pub const CONFIG_PAGETYPE_RAID_PHYSDISK: u8 = 0x0A;
pub const CONFIG_PAGETYPE_MASK:          u8 = 0x0F;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ConfigRequest {
    pub action: u8,
    pub reserved: u8,
    pub chain_offset: u8,
    pub function: u8,
    pub reserved1: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub reserved2: [u8; 8],
    pub header: ConfigPageHeader,
    pub page_address: Le32,
    /// Room for one simple SGE in either address width.
    pub page_buffer_sge: [u8; 12],
}
const_assert_eq!(size_of::<ConfigRequest>(), 40);

/// Byte offset of the page buffer SGE within a config request.
pub const CONFIG_REQUEST_SGE_OFFSET: usize = 28;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ConfigReply {
    pub action: u8,
    pub reserved: u8,
    pub msg_length: u8,
    pub function: u8,
    pub reserved1: Le16,
    pub reserved2: u8,
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub reserved3: Le16,
    pub ioc_status: Le16,
    pub ioc_log_info: Le32,
    pub header: ConfigPageHeader,
}
const_assert_eq!(size_of::<ConfigReply>(), 24);

/// The transaction context element that starts a firmware upload's SGL.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TransactionSge {
    pub reserved: u8,
    pub context_size: u8,
    pub details_length: u8,
    pub flags: u8,
    pub reserved1: Le32,
    pub image_offset: Le32,
    pub image_size: Le32,
}
const_assert_eq!(size_of::<TransactionSge>(), 16);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FwUploadRequest {
    pub image_type: u8,
    pub reserved: u8,
    pub chain_offset: u8,
    pub function: u8,
    pub reserved1: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub tcsge: TransactionSge,
}
const_assert_eq!(size_of::<FwUploadRequest>(), 28);

/// Byte offset of the first simple SGE of a firmware upload request.
pub const FW_UPLOAD_SGL_OFFSET: usize = size_of::<FwUploadRequest>();

/// Upload the IOC's running firmware image.
pub const FW_UPLOAD_ITYPE_FW_IOC_MEM: u8 = 0x00;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FwUploadReply {
    pub image_type: u8,
    pub reserved: u8,
    pub msg_length: u8,
    pub function: u8,
    pub reserved1: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: Le32,
    pub reserved2: Le16,
    pub ioc_status: Le16,
    pub ioc_log_info: Le32,
    pub actual_image_size: Le32,
}
const_assert_eq!(size_of::<FwUploadReply>(), 24);
