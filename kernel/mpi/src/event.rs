//! Asynchronous event codes.

use num_enum::TryFromPrimitive;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum EventCode {
    None                   = 0x00,
    LogData                = 0x01,
    StateChange            = 0x02,
    UnitAttention          = 0x03,
    IocBusReset            = 0x04,
    ExtBusReset            = 0x05,
    Rescan                 = 0x06,
    LinkStatusChange       = 0x07,
    LoopStateChange        = 0x08,
    Logout                 = 0x09,
    /// Firmware turned event reporting on or off; data word 0 holds the new state.
    EventChange            = 0x0A,
    IntegratedRaid         = 0x0B,
    ScsiDeviceStatusChange = 0x0C,
}

pub const EVENT_LINK_STATUS_FAILURE: u32 = 0x0000_0000;
pub const EVENT_LINK_STATUS_ACTIVE:  u32 = 0x0000_0001;
pub const EVENT_LOOP_STATE_CHANGE_LIP: u32 = 0x0001;
pub const EVENT_LOOP_STATE_CHANGE_LPE: u32 = 0x0002;
pub const EVENT_LOOP_STATE_CHANGE_LPB: u32 = 0x0003;

/// `AckRequired` value in an event notification reply that asks for an event ACK.
pub const EVENT_NOTIFICATION_ACK_REQUIRED: u8 = 0x01;

/// A short human-readable description of an event, given its first data word.
pub fn describe(event: u8, data0: u32) -> &'static str {
    let code = match EventCode::try_from(event) {
        Ok(code) => code,
        Err(_) => return "Unknown",
    };
    match code {
        EventCode::None => "None",
        EventCode::LogData => "Log Data",
        EventCode::StateChange => "State Change",
        EventCode::UnitAttention => "Unit Attention",
        EventCode::IocBusReset => "IOC Bus Reset",
        EventCode::ExtBusReset => "External Bus Reset",
        EventCode::Rescan => "Bus Rescan Event",
        EventCode::LinkStatusChange if data0 == EVENT_LINK_STATUS_FAILURE => "Link Status(FAILURE) Change",
        EventCode::LinkStatusChange => "Link Status(ACTIVE) Change",
        EventCode::LoopStateChange if data0 == EVENT_LOOP_STATE_CHANGE_LIP => "Loop State(LIP) Change",
        EventCode::LoopStateChange if data0 == EVENT_LOOP_STATE_CHANGE_LPE => "Loop State(LPE) Change",
        EventCode::LoopStateChange => "Loop State(LPB) Change",
        EventCode::Logout => "Logout",
        EventCode::EventChange if data0 != 0 => "Events(ON) Change",
        EventCode::EventChange => "Events(OFF) Change",
        EventCode::IntegratedRaid => "Integrated Raid",
        EventCode::ScsiDeviceStatusChange => "SCSI Device Status Change",
    }
}
