//! IOC status codes and log-info decoding.

use bit_field::BitField;

pub const IOCSTATUS_MASK: u16 = 0x7FFF;
/// Set in `IOCStatus` when `IOCLogInfo` carries something worth decoding.
pub const IOCSTATUS_FLAG_LOG_INFO_AVAILABLE: u16 = 0x8000;

pub const IOCSTATUS_SUCCESS:                u16 = 0x0000;
pub const IOCSTATUS_INVALID_FUNCTION:       u16 = 0x0001;
pub const IOCSTATUS_BUSY:                   u16 = 0x0002;
pub const IOCSTATUS_INVALID_SGL:            u16 = 0x0003;
pub const IOCSTATUS_INTERNAL_ERROR:         u16 = 0x0004;
pub const IOCSTATUS_INSUFFICIENT_RESOURCES: u16 = 0x0006;
pub const IOCSTATUS_INVALID_FIELD:          u16 = 0x0007;
pub const IOCSTATUS_INVALID_STATE:          u16 = 0x0008;
pub const IOCSTATUS_CONFIG_INVALID_ACTION:  u16 = 0x0020;
pub const IOCSTATUS_CONFIG_INVALID_TYPE:    u16 = 0x0021;
pub const IOCSTATUS_CONFIG_INVALID_PAGE:    u16 = 0x0022;
pub const IOCSTATUS_CONFIG_INVALID_DATA:    u16 = 0x0023;
pub const IOCSTATUS_CONFIG_NO_DEFAULTS:     u16 = 0x0024;
pub const IOCSTATUS_CONFIG_CANT_COMMIT:     u16 = 0x0025;

/// Status the host reports for a config request that never got a usable reply
/// (timeout, reset, or a reply without a frame). Never sent by an IOC.
pub const CONFIG_ERROR: u16 = 0x002F;

pub fn describe(status: u16) -> &'static str {
    match status & IOCSTATUS_MASK {
        IOCSTATUS_SUCCESS                => "success",
        IOCSTATUS_INVALID_FUNCTION       => "invalid function",
        IOCSTATUS_BUSY                   => "busy",
        IOCSTATUS_INVALID_SGL            => "invalid SGL",
        IOCSTATUS_INTERNAL_ERROR         => "internal error",
        IOCSTATUS_INSUFFICIENT_RESOURCES => "insufficient resources",
        IOCSTATUS_INVALID_FIELD          => "invalid field",
        IOCSTATUS_INVALID_STATE          => "invalid state",
        IOCSTATUS_CONFIG_INVALID_ACTION  => "config: invalid action",
        IOCSTATUS_CONFIG_INVALID_TYPE    => "config: invalid page type",
        IOCSTATUS_CONFIG_INVALID_PAGE    => "config: invalid page",
        IOCSTATUS_CONFIG_INVALID_DATA    => "config: invalid data",
        IOCSTATUS_CONFIG_NO_DEFAULTS     => "config: no defaults",
        IOCSTATUS_CONFIG_CANT_COMMIT     => "config: can't commit",
        CONFIG_ERROR                     => "config: no reply",
        _                                => "unknown",
    }
}

/// Fibre Channel log-info subclasses, indexed by bits 24..27 of the log info word.
pub const FC_LOG_INFO_SUBCLASSES: [&str; 8] = [
    "FCP Initiator", "FCP Target", "LAN", "MPI Message Layer",
    "FC Link", "Context Manager", "Invalid Field Offset", "State Change Info",
];

pub const FC_LOGINFO_INVALID_FIELD_BYTE_OFFSET: u8 = 6;
pub const FC_LOGINFO_STATE_CHANGE: u8 = 7;
pub const FC_LOGINFO_INVALID_FIELD_MAX_OFFSET: u32 = 0x00FF_FFFF;

/// A decoded Fibre Channel log-info word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FcLogInfo {
    pub subclass: &'static str,
    pub detail: FcLogDetail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FcLogDetail {
    Description(&'static str),
    InvalidFieldOffset(u32),
    StateChange(u32),
}

pub fn decode_fc_log_info(log_info: u32) -> FcLogInfo {
    let subcl = log_info.get_bits(24..27) as u8;
    let detail = match subcl {
        FC_LOGINFO_INVALID_FIELD_BYTE_OFFSET => {
            FcLogDetail::InvalidFieldOffset(log_info & FC_LOGINFO_INVALID_FIELD_MAX_OFFSET)
        }
        FC_LOGINFO_STATE_CHANGE => FcLogDetail::StateChange(log_info & 0x00FF_FFFF),
        _ => FcLogDetail::Description(fc_log_info_description(log_info)),
    };
    FcLogInfo { subclass: FC_LOG_INFO_SUBCLASSES[subcl as usize], detail }
}

fn fc_log_info_description(log_info: u32) -> &'static str {
    match log_info {
        0x2000_0001 => "Received an out of order frame - unsupported",
        0x2000_0002 => "Bad start of frame primative",
        0x2000_0003 => "Bad end of frame primative",
        0x2000_0004 => "Receiver hardware detected overrun",
        0x2000_0005 => "Other errors caught by IOC which require retries",
        0x2000_0006 => "Main processor could not initialize sub-processor",
        0x2100_0001 => "Not sent because we are waiting for a PDISC from the initiator",
        0x2100_0002 => "Not sent because we are not logged in to the remote node",
        0x2100_0003 => "Data Out, Auto Response, not sent due to a LIP",
        0x2100_0004 => "Data In, Auto Response, not sent due to a LIP",
        0x2100_0005 => "Data In, Auto Response, missing data frames",
        0x2100_0006 => "Data Out, No Response, not sent due to a LIP",
        0x2100_0007 => "Auto-response after a write not sent due to a LIP",
        0x2100_0008 => "Data In, No Response, not completed due to a LIP",
        0x2100_0009 => "Data In, No Response, missing data frames",
        0x2100_000A => "Manual Response not sent due to a LIP",
        0x2100_000B => "Not sent because remote node does not support Class 3",
        0x2100_000C => "Not sent because login to remote node not validated",
        0x2100_000E => "Cleared from the outbound queue after a logout",
        0x2100_000F => "Cleared waiting for data after a logout",
        0x2200_0001 => "Transaction Context Sgl Missing",
        0x2200_0002 => "Transaction Context found before an EOB",
        0x2200_0003 => "Transaction Context value has reserved bits set",
        0x2200_0004 => "Invalid SGL Flags",
        0x2400_0001 => "Loop initialization timed out",
        0x2400_0002 => "Another system controller already initialized the loop",
        0x2400_0003 => "Not synchronized to signal or still negotiating (possible cable problem)",
        0x2400_0004 => "CRC check detected error on received frame",
        _ => "unknown",
    }
}

/// A decoded parallel SCSI log-info word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpiLogInfo {
    pub description: &'static str,
    /// The firmware lost track of a message id; the host should reload the firmware
    /// at the next opportunity.
    pub wants_fw_reload: bool,
}

pub fn decode_spi_log_info(log_info: u32) -> SpiLogInfo {
    let (description, wants_fw_reload) = match log_info & 0x00FF_0000 {
        0x0001_0000 => ("bug! MID not found", true),
        0x0002_0000 => ("Parity Error", false),
        0x0003_0000 => ("ASYNC Outbound Overrun", false),
        0x0004_0000 => ("SYNC Offset Error", false),
        0x0005_0000 => ("BM Change", false),
        0x0006_0000 => ("Msg In Overflow", false),
        0x0007_0000 => ("DMA Error", false),
        0x0008_0000 => ("Outbound DMA Overrun", false),
        _ => ("unknown", false),
    };
    SpiLogInfo { description, wants_fw_reload }
}
