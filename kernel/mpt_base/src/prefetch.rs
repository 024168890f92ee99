//! Config pages read once at bring-up and cached for protocol drivers.

use core::mem::size_of;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use zerocopy::FromBytes;
use mpi::msg::{
    ConfigAction, ProtocolFlags, CONFIG_PAGETYPE_FC_PORT, CONFIG_PAGETYPE_IOC, CONFIG_PAGETYPE_IO_UNIT,
    CONFIG_PAGETYPE_LAN, CONFIG_PAGETYPE_SCSI_DEVICE, CONFIG_PAGETYPE_SCSI_PORT,
};
use mpi::pages::{
    self, FcPortPage0, IocPage1, IocPage2, IocPage3, IocPage4, IoUnitPage2, LanPage0, LanPage1, PhysDisk, RaidVolume,
    ScsiPortPage0, ScsiPortPage2, SepEntry, IOCPAGE1_COALESCING_TIMEOUT_OFFSET, IOCPAGE1_REPLY_COALESCING,
    SCSIPORTPAGE0_CAP_MAX_SYNC_OFFSET_MASK, SCSIPORTPAGE0_CAP_MIN_SYNC_PERIOD_MASK, SCSIPORTPAGE0_CAP_WIDE,
    SCSIPORTPAGE0_PHY_SIGNAL_HVD, SCSIPORTPAGE0_PHY_SIGNAL_SE, SCSIPORTPAGE0_PHY_SIGNAL_TYPE_MASK, SCSIPORTPAGE2_DEVICES,
};
use mpi::status::IOCSTATUS_CONFIG_INVALID_DATA;
use mpi::MPI_VERSION_01_02;
use crate::adapter::{Adapter, BusType};
use crate::error::ConfigError;
use crate::platform::DmaRegion;
use crate::tunables::{ASYNC_SYNC_FACTOR, MAX_COALESCING_TIMEOUT, NVRAM_INVALID, ULTRA_SYNC_FACTOR};

/// What FC port page 0 says about one Fibre Channel port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FcPortInfo {
    pub flags: u32,
    pub link_type: u8,
    pub port_state: u8,
    pub port_id: u32,
    pub wwnn: u64,
    pub wwpn: u64,
    pub supported_speeds: u32,
    pub current_speed: u32,
    pub max_frame_size: u32,
    pub fabric_wwnn: u64,
    pub fabric_wwpn: u64,
}

/// The LAN side of a Fibre Channel IOC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LanInfo {
    pub tx_rx_modes: u32,
    pub mac_address: [u8; 6],
    pub max_wire_speed: u64,
    pub max_reply_size: u32,
}

/// Parallel SCSI bus limits and the NVRAM settings of each target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScsiPortInfo {
    pub wide: bool,
    pub max_sync_offset: u8,
    pub min_sync_factor: u8,
    /// Bus signalling, one of the `SCSIPORTPAGE0_PHY_SIGNAL_*` values.
    pub bus_mode: u32,
    pub port_flags: u32,
    /// Per target: timeout, sync factor << 8 and device flags << 16; [`NVRAM_INVALID`] if unknown.
    pub nvram: [u32; SCSIPORTPAGE2_DEVICES],
    pub device_page0_version: u8,
    pub device_page0_length: u8,
    pub device_page1_version: u8,
    pub device_page1_length: u8,
}

/// Integrated RAID layout and enclosure processors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RaidInfo {
    /// Bit `n` set if target id `n` on bus 0 is an active RAID volume.
    pub volume_mask: u32,
    pub phys_disks: Vec<PhysDisk>,
    pub seps: Vec<SepEntry>,
    /// The reply coalescing timeout after any clamp.
    pub coalescing_timeout: u32,
}

fn bad_page() -> ConfigError {
    ConfigError::IocStatus(IOCSTATUS_CONFIG_INVALID_DATA)
}

impl Adapter {
    /// Reads a config page and decodes its fixed part; pages shorter than `T` are zero-extended.
    fn fetch_page<T: FromBytes>(&self, page_type: u8, page_number: u8, page_address: u32) -> Result<(T, DmaRegion), ConfigError> {
        let (_, page) = self.read_config_page(page_type, page_number, page_address)?;
        let mut buf = alloc::vec![0u8; size_of::<T>()];
        let n = buf.len().min(page.len());
        buf[..n].copy_from_slice(&page.as_slice()[..n]);
        let fixed = T::read_from_bytes(&buf).map_err(|_| bad_page())?;
        Ok((fixed, page))
    }

    /// Reads and caches the config pages protocol drivers need. Failures are logged and skipped.
    pub(crate) fn prefetch_config_pages(&self) {
        match self.bus_type() {
            BusType::Fc => {
                for port in 0..self.number_of_ports() {
                    if let Err(e) = self.prefetch_fc_port(port) {
                        warn!("{}: couldn't read FC port {} page 0: {:?}", self.name(), port, e);
                    }
                }
                let lan = (0..self.number_of_ports()).any(|port| {
                    self.port_facts(port)
                        .map_or(false, |p| ProtocolFlags::from_bits_truncate(p.protocol_flags.get()).contains(ProtocolFlags::LAN))
                });
                if lan {
                    if let Err(e) = self.prefetch_lan() {
                        warn!("{}: couldn't read LAN pages: {:?}", self.name(), e);
                    }
                }
            }
            BusType::Scsi => {
                self.prefetch_scsi_port();
                if let Err(e) = self.prefetch_scsi_device_headers() {
                    warn!("{}: couldn't read SCSI device page headers: {:?}", self.name(), e);
                }
                if self.facts().map_or(false, |f| f.msg_version.get() >= MPI_VERSION_01_02) {
                    if let Err(e) = self.prefetch_raid_volumes() {
                        warn!("{}: couldn't read RAID volumes: {:?}", self.name(), e);
                    }
                }
                if let Err(e) = self.prefetch_coalescing() {
                    warn!("{}: couldn't check reply coalescing: {:?}", self.name(), e);
                }
                if let Err(e) = self.prefetch_seps() {
                    warn!("{}: couldn't read IOC page 4: {:?}", self.name(), e);
                }
            }
        }
        match self.fetch_page::<IoUnitPage2>(CONFIG_PAGETYPE_IO_UNIT, 2, 0) {
            Ok((page, _)) => {
                let bios_version = page.bios_version.get();
                self.state.lock().bios_version = bios_version;
                debug!("{}: BIOS version {:#010X}", self.name(), bios_version);
            }
            Err(e) => warn!("{}: couldn't read IO unit page 2: {:?}", self.name(), e),
        }
    }

    fn prefetch_fc_port(&self, port: usize) -> Result<(), ConfigError> {
        let (p0, _) = self.fetch_page::<FcPortPage0>(CONFIG_PAGETYPE_FC_PORT, 0, port as u32)?;
        let info = FcPortInfo {
            flags: p0.flags.get(),
            link_type: p0.link_type,
            port_state: p0.port_state,
            port_id: p0.port_identifier.get(),
            wwnn: p0.wwnn.get(),
            wwpn: p0.wwpn.get(),
            supported_speeds: p0.supported_speeds.get(),
            current_speed: p0.current_speed.get(),
            max_frame_size: p0.max_frame_size.get(),
            fabric_wwnn: p0.fabric_wwnn.get(),
            fabric_wwpn: p0.fabric_wwpn.get(),
        };
        debug!("{}: port {} WWNN {:#018X} WWPN {:#018X}", self.name(), port, info.wwnn, info.wwpn);
        if let Some(slot) = self.state.lock().fc_ports.get_mut(port) {
            *slot = Some(info);
        }
        Ok(())
    }

    fn prefetch_lan(&self) -> Result<(), ConfigError> {
        let (p0, _) = self.fetch_page::<LanPage0>(CONFIG_PAGETYPE_LAN, 0, 0)?;
        let (p1, _) = self.fetch_page::<LanPage1>(CONFIG_PAGETYPE_LAN, 1, 0)?;
        let info = LanInfo {
            tx_rx_modes: p0.tx_rx_modes.get(),
            mac_address: p1.mac_address(),
            max_wire_speed: ((p1.max_wire_speed_high.get() as u64) << 32) | p1.max_wire_speed_low.get() as u64,
            max_reply_size: p1.max_reply_size.get(),
        };
        debug!("{}: LAN MAC {:02X?}", self.name(), info.mac_address);
        self.state.lock().lan = Some(info);
        Ok(())
    }

    fn prefetch_scsi_port(&self) {
        let mut info = ScsiPortInfo { nvram: [NVRAM_INVALID; SCSIPORTPAGE2_DEVICES], ..Default::default() };

        match self.fetch_page::<ScsiPortPage0>(CONFIG_PAGETYPE_SCSI_PORT, 0, 0) {
            Ok((p0, _)) => {
                let cap = p0.capabilities.get();
                info.wide = cap & SCSIPORTPAGE0_CAP_WIDE != 0;
                info.max_sync_offset = ((cap & SCSIPORTPAGE0_CAP_MAX_SYNC_OFFSET_MASK) >> 16) as u8;
                info.min_sync_factor = ((cap & SCSIPORTPAGE0_CAP_MIN_SYNC_PERIOD_MASK) >> 8) as u8;
                info.bus_mode = p0.physical_interface.get() & SCSIPORTPAGE0_PHY_SIGNAL_TYPE_MASK;
                if matches!(info.bus_mode, SCSIPORTPAGE0_PHY_SIGNAL_HVD | SCSIPORTPAGE0_PHY_SIGNAL_SE)
                    && info.min_sync_factor < ULTRA_SYNC_FACTOR
                {
                    info.min_sync_factor = ULTRA_SYNC_FACTOR;
                }
            }
            Err(e) => {
                warn!("{}: couldn't read SCSI port page 0: {:?}", self.name(), e);
                info.wide = false;
                info.max_sync_offset = 0;
                info.min_sync_factor = ASYNC_SYNC_FACTOR;
                info.bus_mode = SCSIPORTPAGE0_PHY_SIGNAL_SE;
            }
        }

        match self.fetch_page::<ScsiPortPage2>(CONFIG_PAGETYPE_SCSI_PORT, 2, 0) {
            Ok((p2, _)) => {
                info.port_flags = p2.port_flags.get();
                for (nvram, dev) in info.nvram.iter_mut().zip(p2.device_settings.iter()) {
                    *nvram = dev.timeout as u32 | (dev.sync_factor as u32) << 8 | (dev.device_flags.get() as u32) << 16;
                }
            }
            Err(e) => warn!("{}: couldn't read SCSI port page 2: {:?}", self.name(), e),
        }

        debug!("{}: SCSI bus: wide {}, offset {}, factor {:#04X}, mode {}",
            self.name(), info.wide, info.max_sync_offset, info.min_sync_factor, info.bus_mode);
        self.state.lock().scsi = info;
    }

    fn prefetch_scsi_device_headers(&self) -> Result<(), ConfigError> {
        let h0 = self.read_config_header(CONFIG_PAGETYPE_SCSI_DEVICE, 0, 0)?;
        let h1 = self.read_config_header(CONFIG_PAGETYPE_SCSI_DEVICE, 1, 0)?;
        let mut state = self.state.lock();
        state.scsi.device_page0_version = h0.page_version;
        state.scsi.device_page0_length = h0.page_length;
        state.scsi.device_page1_version = h1.page_version;
        state.scsi.device_page1_length = h1.page_length;
        Ok(())
    }

    fn prefetch_raid_volumes(&self) -> Result<(), ConfigError> {
        let (p2, page) = self.fetch_page::<IocPage2>(CONFIG_PAGETYPE_IOC, 2, 0)?;
        let mut volume_mask = 0u32;
        for vol in pages::entries::<RaidVolume>(page.as_slice(), size_of::<IocPage2>(), p2.num_active_volumes as usize) {
            if vol.volume_bus == 0 && vol.volume_id < 32 {
                volume_mask |= 1 << vol.volume_id;
            }
        }

        let mut phys_disks = Vec::new();
        if p2.num_active_phys_disks > 0 {
            let (p3, page) = self.fetch_page::<IocPage3>(CONFIG_PAGETYPE_IOC, 3, 0)?;
            phys_disks = pages::entries::<PhysDisk>(page.as_slice(), size_of::<IocPage3>(), p3.num_phys_disks as usize).collect();
        }

        debug!("{}: RAID volume mask {:#X}, {} physical disk(s)", self.name(), volume_mask, phys_disks.len());
        let mut state = self.state.lock();
        state.raid.volume_mask = volume_mask;
        state.raid.phys_disks = phys_disks;
        Ok(())
    }

    /// Clamps the reply coalescing timeout, writing the new value to current settings and NVRAM.
    fn prefetch_coalescing(&self) -> Result<(), ConfigError> {
        let (header, mut page) = self.read_config_page(CONFIG_PAGETYPE_IOC, 1, 0)?;
        let mut buf = [0u8; size_of::<IocPage1>()];
        let n = buf.len().min(page.len());
        buf[..n].copy_from_slice(&page.as_slice()[..n]);
        let p1 = IocPage1::read_from_bytes(&buf[..]).map_err(|_| bad_page())?;

        let mut timeout = p1.coalescing_timeout.get();
        if p1.flags.get() & IOCPAGE1_REPLY_COALESCING != 0 && timeout > MAX_COALESCING_TIMEOUT {
            info!("{}: reducing reply coalescing timeout from {} to {}", self.name(), timeout, MAX_COALESCING_TIMEOUT);
            let field = page.as_mut_slice()
                .get_mut(IOCPAGE1_COALESCING_TIMEOUT_OFFSET..IOCPAGE1_COALESCING_TIMEOUT_OFFSET + 4)
                .ok_or_else(bad_page)?;
            LittleEndian::write_u32(field, MAX_COALESCING_TIMEOUT);
            self.write_config_page(header, &page, ConfigAction::WriteCurrent, 0)?;
            timeout = MAX_COALESCING_TIMEOUT;
            if let Err(e) = self.write_config_page(header, &page, ConfigAction::WriteNvram, 0) {
                warn!("{}: couldn't save the coalescing timeout to NVRAM: {:?}", self.name(), e);
            }
        }
        self.state.lock().raid.coalescing_timeout = timeout;
        Ok(())
    }

    fn prefetch_seps(&self) -> Result<(), ConfigError> {
        let (p4, page) = self.fetch_page::<IocPage4>(CONFIG_PAGETYPE_IOC, 4, 0)?;
        let seps: Vec<SepEntry> = pages::entries::<SepEntry>(page.as_slice(), size_of::<IocPage4>(), p4.active_sep as usize).collect();
        self.state.lock().raid.seps = seps;
        Ok(())
    }
}
