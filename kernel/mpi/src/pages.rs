//! Configuration page layouts read (and occasionally written) by the base driver.
//!
//! Each page begins with a [`ConfigPageHeader`]. Pages with trailing variable-length arrays
//! are described by their fixed part plus an element type; use [`entries`] to walk the tail.

use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};
use crate::msg::ConfigPageHeader;
use crate::{Le16, Le32};

/// Reads `count` consecutive `T` records starting at byte `offset` of `page`,
/// stopping early at the end of the page.
pub fn entries<T: FromBytes>(page: &[u8], offset: usize, count: usize) -> impl Iterator<Item = T> + '_ {
    (0..count).map_while(move |i| {
        let start = offset + i * size_of::<T>();
        page.get(start..).and_then(|tail| T::read_from_prefix(tail).ok()).map(|(t, _)| t)
    })
}

/// A 64-bit world wide name as two little-endian dwords.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Wwn {
    pub low: Le32,
    pub high: Le32,
}

impl Wwn {
    pub fn get(&self) -> u64 {
        ((self.high.get() as u64) << 32) | self.low.get() as u64
    }
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IoUnitPage2 {
    pub header: ConfigPageHeader,
    pub flags: Le32,
    pub bios_version: Le32,
}
const_assert_eq!(size_of::<IoUnitPage2>(), 12);

pub const IOCPAGE1_REPLY_COALESCING: u32 = 0x0000_0001;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IocPage1 {
    pub header: ConfigPageHeader,
    pub flags: Le32,
    pub coalescing_timeout: Le32,
    pub coalescing_depth: u8,
    pub pci_slot_num: u8,
    pub reserved: [u8; 2],
}
const_assert_eq!(size_of::<IocPage1>(), 16);

/// Byte offset of `CoalescingTimeout` within IOC page 1.
pub const IOCPAGE1_COALESCING_TIMEOUT_OFFSET: usize = 8;

/// The fixed part of IOC page 2; `num_active_volumes` [`RaidVolume`] records follow.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IocPage2 {
    pub header: ConfigPageHeader,
    pub capabilities_flags: Le32,
    pub num_active_volumes: u8,
    pub max_volumes: u8,
    pub num_active_phys_disks: u8,
    pub max_phys_disks: u8,
}
const_assert_eq!(size_of::<IocPage2>(), 12);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RaidVolume {
    pub volume_id: u8,
    pub volume_bus: u8,
    pub volume_ioc: u8,
    pub volume_page_number: u8,
    pub volume_type: u8,
    pub flags: u8,
    pub reserved: Le16,
}
const_assert_eq!(size_of::<RaidVolume>(), 8);

/// The fixed part of IOC page 3; `num_phys_disks` [`PhysDisk`] records follow.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IocPage3 {
    pub header: ConfigPageHeader,
    pub num_phys_disks: u8,
    pub reserved: [u8; 3],
}
const_assert_eq!(size_of::<IocPage3>(), 8);

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PhysDisk {
    pub phys_disk_id: u8,
    pub phys_disk_bus: u8,
    pub phys_disk_ioc: u8,
    pub phys_disk_num: u8,
}

/// The fixed part of IOC page 4; `active_sep` [`SepEntry`] records follow.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IocPage4 {
    pub header: ConfigPageHeader,
    pub active_sep: u8,
    pub max_sep: u8,
    pub reserved: Le16,
}
const_assert_eq!(size_of::<IocPage4>(), 8);

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SepEntry {
    pub sep_target_id: u8,
    pub sep_bus: u8,
    pub reserved: Le16,
}

pub const SCSIPORTPAGE0_CAP_WIDE:                 u32 = 0x2000_0000;
pub const SCSIPORTPAGE0_CAP_MAX_SYNC_OFFSET_MASK: u32 = 0x00FF_0000;
pub const SCSIPORTPAGE0_CAP_MIN_SYNC_PERIOD_MASK: u32 = 0x0000_FF00;
pub const SCSIPORTPAGE0_PHY_SIGNAL_TYPE_MASK:     u32 = 0x0000_0003;
pub const SCSIPORTPAGE0_PHY_SIGNAL_HVD:           u32 = 0x01;
pub const SCSIPORTPAGE0_PHY_SIGNAL_SE:            u32 = 0x02;
pub const SCSIPORTPAGE0_PHY_SIGNAL_LVD:           u32 = 0x03;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ScsiPortPage0 {
    pub header: ConfigPageHeader,
    pub capabilities: Le32,
    pub physical_interface: Le32,
}
const_assert_eq!(size_of::<ScsiPortPage0>(), 12);

pub const SCSIPORTPAGE2_PORT_FLAGS_DV_MASK: u32 = 0x0000_0060;

/// Number of per-target device settings in SCSI port page 2.
pub const SCSIPORTPAGE2_DEVICES: usize = 16;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DeviceSettings {
    pub timeout: u8,
    pub sync_factor: u8,
    pub device_flags: Le16,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ScsiPortPage2 {
    pub header: ConfigPageHeader,
    pub port_flags: Le32,
    pub port_settings: Le32,
    pub device_settings: [DeviceSettings; SCSIPORTPAGE2_DEVICES],
}
const_assert_eq!(size_of::<ScsiPortPage2>(), 76);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FcPortPage0 {
    pub header: ConfigPageHeader,
    pub flags: Le32,
    pub mpi_port_number: u8,
    pub link_type: u8,
    pub port_state: u8,
    pub reserved: u8,
    pub port_identifier: Le32,
    pub wwnn: Wwn,
    pub wwpn: Wwn,
    pub supported_service_class: Le32,
    pub supported_speeds: Le32,
    pub current_speed: Le32,
    pub max_frame_size: Le32,
    pub fabric_wwnn: Wwn,
    pub fabric_wwpn: Wwn,
    pub discovered_port_count: Le32,
    pub max_initiators: Le32,
}
const_assert_eq!(size_of::<FcPortPage0>(), 72);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct LanPage0 {
    pub header: ConfigPageHeader,
    pub tx_rx_modes: Le32,
    pub reserved: Le32,
    pub reserved1: Le32,
}
const_assert_eq!(size_of::<LanPage0>(), 16);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct LanPage1 {
    pub header: ConfigPageHeader,
    pub reserved: Le32,
    pub current_device_state: Le32,
    pub reserved1: Le32,
    pub packet_pre_pad: Le32,
    pub reserved2: Le32,
    pub hardware_address_low: Le32,
    pub hardware_address_high: Le32,
    pub max_wire_speed_low: Le32,
    pub max_wire_speed_high: Le32,
    pub buckets_remaining: Le32,
    pub max_reply_size: Le32,
    pub neg_wire_speed_low: Le32,
    pub neg_wire_speed_high: Le32,
}
const_assert_eq!(size_of::<LanPage1>(), 56);

impl LanPage1 {
    /// The port's 48-bit MAC address, most significant byte first.
    pub fn mac_address(&self) -> [u8; 6] {
        let low = self.hardware_address_low.get().to_le_bytes();
        let high = self.hardware_address_high.get().to_le_bytes();
        [high[1], high[0], low[3], low[2], low[1], low[0]]
    }
}
