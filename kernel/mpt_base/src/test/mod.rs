//! Tests for the Fusion-MPT base driver, run against a simulated IOC.

extern crate std;


use self::std::vec::Vec;
use self::std::vec;
use core::mem::size_of;
use alloc::sync::Arc;
use spin::Mutex;
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use mpi::event::EventCode;
use mpi::msg::{
    ConfigAction, EventNotificationReply, Function, CONFIG_PAGETYPE_FC_PORT, CONFIG_PAGETYPE_IOC,
    CONFIG_PAGETYPE_IO_UNIT, CONFIG_PAGETYPE_LAN, CONFIG_PAGETYPE_SCSI_DEVICE, CONFIG_PAGETYPE_SCSI_PORT,
    IOCINIT_FLAGS_DISCARD_FW_IMAGE,
};
use mpi::pages::{
    FcPortPage0, IocPage1, IocPage2, IocPage3, IocPage4, IoUnitPage2, LanPage0, LanPage1, PhysDisk, RaidVolume,
    ScsiPortPage0, ScsiPortPage2, SepEntry, IOCPAGE1_REPLY_COALESCING, SCSIPORTPAGE0_CAP_WIDE,
    SCSIPORTPAGE0_PHY_SIGNAL_SE,
};
use mpi::sge::AddressWidth;
use mpi::status::{CONFIG_ERROR, IOCSTATUS_CONFIG_INVALID_PAGE};
use mpi::sysif::{
    Diagnostic, IocState, ReplyDescriptor, SysIfReg, DIAG_RW_FLASH_BAD_BIT, INT_MASK_ALL, LAN_TURBO_FREE_ONLY,
    SYSIF_REGS_SIZE, WRSEQ_DISABLE, WRSEQ_FLUSH, WRSEQ_KEYS,
};
use super::*;
use crate::config::PendingConfig;
use self::sim::{firmware_image, dwords, page_bytes, pci, Harness, SimConfig, SimIoc};

const FC919X: u16 = 0x0628;
const FC929X: u16 = 0x0626;
const C1030: u16 = 0x0030;

/// What a [`Recorder`] saw of one reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Seen {
    NoReply,
    /// A reply frame, by its function code.
    Frame(u8),
    Context(u32),
}

/// A protocol driver that records its replies and events.
struct Recorder {
    free_frames: bool,
    replies: Mutex<Vec<(Option<u16>, Seen)>>,
    events: Mutex<Vec<u32>>,
}

impl Recorder {
    fn new(free_frames: bool) -> Arc<Recorder> {
        Arc::new(Recorder { free_frames, replies: Mutex::new(Vec::new()), events: Mutex::new(Vec::new()) })
    }

    fn replies(&self) -> Vec<(Option<u16>, Seen)> {
        self.replies.lock().clone()
    }
}

impl ReplyHandler for Recorder {
    fn on_reply(&self, _ioc: &Adapter, request: Option<&RequestFrame>, reply: Option<ReplyRef<'_>>) -> bool {
        let seen = match reply {
            None => Seen::NoReply,
            Some(ReplyRef::Frame(f)) => Seen::Frame(f[3]),
            Some(ReplyRef::Context(raw)) => Seen::Context(raw),
        };
        self.replies.lock().push((request.map(RequestFrame::index), seen));
        self.free_frames
    }
}

impl EventHandler for Recorder {
    fn on_event(&self, _ioc: &Adapter, reply: &[u8]) -> i32 {
        let (evt, _) = EventNotificationReply::read_from_prefix(reply).expect("short event reply");
        self.events.lock().push(evt.event.get());
        1
    }
}

fn fc_config() -> SimConfig {
    SimConfig { protocol_flags: 0x0A, ..Default::default() }
}

/// FC port page 0, LAN pages 0 and 1, and IO unit page 2.
fn add_fc_pages(sim: &SimIoc) {
    sim.set_page(CONFIG_PAGETYPE_FC_PORT, 0, 0, page_bytes::<FcPortPage0>(|p| {
        p.flags.set(0x0000_0001);
        p.port_state = 0x04;
        p.port_identifier.set(0x0001_02EF);
        p.wwnn.low.set(0x0000_0001);
        p.wwnn.high.set(0x2000_00A0);
        p.wwpn.low.set(0x0000_0002);
        p.wwpn.high.set(0x2100_00A0);
        p.current_speed.set(2);
        p.max_frame_size.set(2048);
    }));
    sim.set_page(CONFIG_PAGETYPE_LAN, 0, 0, page_bytes::<LanPage0>(|p| p.tx_rx_modes.set(0x0000_0001)));
    sim.set_page(CONFIG_PAGETYPE_LAN, 1, 0, page_bytes::<LanPage1>(|p| {
        p.hardware_address_low.set(0x3344_5566);
        p.hardware_address_high.set(0x0000_1122);
        p.max_wire_speed_low.set(1_000_000_000);
        p.max_reply_size.set(0x200);
    }));
    sim.set_page(CONFIG_PAGETYPE_IO_UNIT, 2, 0, page_bytes::<IoUnitPage2>(|p| p.bios_version.set(0x0105_0300)));
}

fn bring_up_fc() -> (Harness, Arc<SimIoc>, Arc<Adapter>) {
    let h = Harness::new();
    let sim = h.sim(fc_config());
    add_fc_pages(&sim);
    let ioc = h.install(&sim, pci(FC919X, 0));
    (h, sim, ioc)
}

#[test]
fn bringup_reaches_operational() {
    let (h, sim, ioc) = bring_up_fc();

    assert!(ioc.is_active());
    assert_eq!(ioc.ioc_state(), IocState::Operational);
    assert_eq!(ioc.first_who_init(), Some(0));
    assert_eq!(ioc.event_state(), 1);
    assert_eq!(h.fusion.find_first_adapter().map(|a| a.id()), Some(ioc.id()));

    let s = sim.state();
    assert_eq!(s.event_notifications, 1);
    assert_eq!(s.hard_resets, 0);
    assert_eq!(s.port_enables, 1);
    assert_eq!(s.who_init, 4);
    assert_eq!(s.mfa_high, 1);
    drop(s);

    // Every frame but the one carrying the event notification request is free.
    assert_eq!(ioc.req_depth(), 8);
    assert_eq!(ioc.req_sz(), 128);
    assert_eq!(ioc.free_frame_count(), 7);
}

#[test]
fn bringup_prefetches_fc_pages() {
    let (_h, _sim, ioc) = bring_up_fc();

    let port = ioc.fc_port(0).expect("FC port 0 not read");
    assert_eq!(port.wwnn, 0x2000_00A0_0000_0001);
    assert_eq!(port.wwpn, 0x2100_00A0_0000_0002);
    assert_eq!(port.port_id, 0x0001_02EF);
    assert_eq!(port.max_frame_size, 2048);
    assert_eq!(ioc.fc_port(1), None);

    let lan = ioc.lan_info().expect("LAN pages not read");
    assert_eq!(lan.mac_address, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    assert_eq!(lan.max_wire_speed, 1_000_000_000);
    assert_eq!(lan.tx_rx_modes, 1);
    assert_eq!(ioc.bios_version(), 0x0105_0300);
}

#[test]
fn lan_pages_skipped_without_lan_protocol() {
    let h = Harness::new();
    let sim = h.sim(SimConfig::default());
    add_fc_pages(&sim);
    let ioc = h.install(&sim, pci(FC919X, 0));
    assert!(ioc.fc_port(0).is_some());
    assert_eq!(ioc.lan_info(), None);
}

#[test]
fn stuck_doorbell_forces_hard_reset() {
    let h = Harness::new();
    let sim = h.sim(fc_config());
    sim.state().stuck_active = true;
    let ioc = h.install(&sim, pci(FC919X, 0));

    assert!(ioc.is_active());
    let s = sim.state();
    assert_eq!(s.hard_resets, 1);
    assert_eq!(s.mu_resets, 0);
    let mut unlock = vec![WRSEQ_FLUSH];
    unlock.extend_from_slice(&WRSEQ_KEYS);
    assert_eq!(&s.write_sequence[..6], &unlock[..]);
    assert_eq!(s.write_sequence.last(), Some(&WRSEQ_DISABLE));
    assert!(s.diag_writes.iter().any(|d| d & Diagnostic::RESET_ADAPTER.bits() != 0));
}

#[test]
fn ready_ioc_gets_message_unit_reset() {
    let h = Harness::new();
    let sim = h.sim(fc_config());
    h.install(&sim, pci(FC919X, 0));
    assert_eq!(sim.state().mu_resets, 1);

    // First-generation parts are trusted when READY.
    let h = Harness::new();
    let sim = h.sim(fc_config());
    h.install(&sim, pci(0x0624, 0));
    assert_eq!(sim.state().mu_resets, 0);
}

#[test]
fn config_timeout_resets_ioc() {
    let (h, sim, ioc) = bring_up_fc();
    let before = sim.state().config_requests;
    sim.state().drop_config = true;
    let busy_waits = h.platform.busy_waits();

    let result = ioc.read_config_header(CONFIG_PAGETYPE_FC_PORT, 0, 0);
    assert_eq!(result, Err(ConfigError::IocStatus(CONFIG_ERROR)));
    // The wait and the reset it escalated to both slept.
    assert_eq!(h.platform.busy_waits(), busy_waits);

    let s = sim.state();
    assert_eq!(s.hard_resets, 1);
    assert_eq!(s.config_requests, before + 1);
    assert_eq!(s.event_notifications, 2);
    drop(s);
    assert_eq!(ioc.pending_config_count(), 0);
    assert!(ioc.is_active());
    assert_eq!(ioc.ioc_state(), IocState::Operational);
}

#[test]
fn config_reads_and_errors() {
    let (h, _sim, ioc) = bring_up_fc();

    let header = ioc.read_config_header(CONFIG_PAGETYPE_FC_PORT, 0, 0).expect("header read failed");
    assert_eq!(header.page_length as usize, size_of::<FcPortPage0>() / 4);
    assert_eq!(header.page_type, CONFIG_PAGETYPE_FC_PORT);

    let (_, page) = ioc.read_config_page(CONFIG_PAGETYPE_LAN, 1, 0).expect("page read failed");
    let (p1, _) = LanPage1::read_from_prefix(page.as_slice()).expect("short page");
    assert_eq!(p1.hardware_address_low.get(), 0x3344_5566);

    assert_eq!(
        ioc.read_config_header(CONFIG_PAGETYPE_FC_PORT, 1, 0),
        Err(ConfigError::IocStatus(IOCSTATUS_CONFIG_INVALID_PAGE)),
    );

    h.platform.atomic.store(true, core::sync::atomic::Ordering::SeqCst);
    assert_eq!(ioc.read_config_header(CONFIG_PAGETYPE_FC_PORT, 0, 0), Err(ConfigError::InInterrupt));
    h.platform.atomic.store(false, core::sync::atomic::Ordering::SeqCst);

    assert_eq!(ioc.pending_config_count(), 0);
    assert_eq!(ioc.free_frame_count(), 7);
}

#[test]
fn lan_free_only_reply_returns_frame() {
    let (h, sim, ioc) = bring_up_fc();
    let lan = Recorder::new(true);
    let handle = h.fusion.register(lan.clone(), DriverClass::Lan).expect("register failed");
    assert_eq!(h.fusion.drivers().lan_handle(), Some(handle));

    let idx = ioc.acquire_request_frame(handle).expect("no free frame").index();
    assert_eq!(ioc.free_frame_count(), 6);

    sim.inject_reply(LAN_TURBO_FREE_ONLY | idx as u32);
    h.interrupts();
    assert_eq!(ioc.free_frame_count(), 7);
    assert!(lan.replies().is_empty());
}

#[test]
fn bad_replies_are_dropped() {
    let (h, sim, ioc) = bring_up_fc();
    let host = Recorder::new(true);
    h.fusion.register(host.clone(), DriverClass::ScsiHost).expect("register failed");

    sim.inject_reply(ReplyDescriptor::Context { req_idx: 0, cb_idx: 16 }.encode());
    sim.inject_reply(ReplyDescriptor::Context { req_idx: 1, cb_idx: 200 }.encode());
    sim.inject_reply(ReplyDescriptor::Context { req_idx: 2, cb_idx: 0 }.encode());
    sim.inject_reply(ReplyDescriptor::Address(0x44).encode());
    h.interrupts();

    assert!(host.replies().is_empty());
    assert_eq!(ioc.free_frame_count(), 7);
    assert!(ioc.is_active());
}

#[test]
fn turbo_reply_reaches_owner() {
    let (h, _sim, ioc) = bring_up_fc();
    let keep = Recorder::new(false);
    let handle = h.fusion.register(keep.clone(), DriverClass::ScsiHost).expect("register failed");

    let frame = ioc.acquire_request_frame(handle).expect("no free frame");
    let idx = frame.index();
    ioc.submit_request(handle, frame);
    h.interrupts();
    assert_eq!(keep.replies(), vec![(Some(idx), Seen::NoReply)]);
    // The handler kept the frame.
    assert_eq!(ioc.free_frame_count(), 6);

    let free = Recorder::new(true);
    let handle = h.fusion.register(free.clone(), DriverClass::ScsiHost).expect("register failed");
    let frame = ioc.acquire_request_frame(handle).expect("no free frame");
    let idx = frame.index();
    ioc.submit_request(handle, frame);
    h.interrupts();
    assert_eq!(free.replies(), vec![(Some(idx), Seen::NoReply)]);
    assert_eq!(ioc.free_frame_count(), 6);
}

#[test]
fn free_list_is_fifo() {
    let (h, _sim, ioc) = bring_up_fc();
    let handle = h.fusion.base_handle();

    let mut frames: Vec<RequestFrame> = (0..7).map(|_| ioc.acquire_request_frame(handle).expect("no free frame")).collect();
    let mut indexes: Vec<u16> = frames.iter().map(RequestFrame::index).collect();
    indexes.sort_unstable();
    indexes.dedup();
    assert_eq!(indexes.len(), 7);
    assert!(ioc.acquire_request_frame(handle).is_none());

    let third = frames.remove(3);
    let first = frames.remove(1);
    let (third_idx, first_idx) = (third.index(), first.index());
    ioc.release_request_frame(handle, third);
    ioc.release_request_frame(handle, first);
    assert_eq!(ioc.acquire_request_frame(handle).map(|f| f.index()), Some(third_idx));
    assert_eq!(ioc.acquire_request_frame(handle).map(|f| f.index()), Some(first_idx));
}

#[test]
fn double_release_is_ignored() {
    let (h, _sim, ioc) = bring_up_fc();
    let handle = h.fusion.base_handle();
    let frame = ioc.acquire_request_frame(handle).expect("no free frame");
    let idx = frame.index();

    ioc.release_request_frame(handle, frame);
    ioc.release_request_frame(handle, RequestFrame::in_flight(idx));
    assert_eq!(ioc.free_frame_count(), 7);
}

#[test]
fn request_frames_are_stamped() {
    let (h, _sim, ioc) = bring_up_fc();
    let handle = h.fusion.base_handle();
    let frame = ioc.acquire_request_frame(handle).expect("no free frame");
    let ctx = mpi::msg::MsgContext::read(ioc.request_frame(&frame)).expect("frame too short");
    assert_eq!(ctx.req_idx, frame.index());
    assert_eq!(ctx.cb_idx, handle.raw());
    assert!(ioc.request_frame_phys(&frame).is_some());
    assert_eq!(ioc.sense_buffer(&frame).len(), 0x40);
    ioc.release_request_frame(handle, frame);
}

#[test]
fn handshake_ack_timeout_leaves_adapter_inactive() {
    let h = Harness::new();
    let sim = h.sim(fc_config());
    sim.state().stall_ack = true;
    let ioc = h.install(&sim, pci(FC919X, 0));

    assert!(!ioc.is_active());
    assert!(ioc.acquire_request_frame(h.fusion.base_handle()).is_none());
    assert_eq!(sim.state().facts_requests, 0);

    let err = ioc.do_ioc_recovery(RecoveryReason::Recover, SleepMode::CanSleep)
        .expect_err("recovery should fail");
    assert_eq!(err, RecoveryError::Facts(FactsError::Handshake(HandshakeError::AckTimeout)));
    assert_eq!(err.code(), -2);
    assert_eq!(HandshakeError::AckTimeout.code(), -2);
    assert!(!ioc.is_active());
}

#[test]
fn registry_hands_out_decreasing_handles() {
    let h = Harness::new();
    let drivers = h.fusion.drivers();
    assert_eq!(h.fusion.base_handle().raw(), 15);
    assert_eq!(drivers.class_of(h.fusion.base_handle()), Some(DriverClass::Base));

    let mut handles = Vec::new();
    for _ in 0..14 {
        handles.push(h.fusion.register(Recorder::new(true), DriverClass::ScsiHost).expect("register failed"));
    }
    let raw: Vec<u8> = handles.iter().map(|h| h.raw()).collect();
    assert_eq!(raw, (1..=14).rev().collect::<Vec<u8>>());
    assert_eq!(drivers.last_assigned().map(DriverHandle::raw), Some(1));
    assert_eq!(
        h.fusion.register(Recorder::new(true), DriverClass::ScsiHost).err(),
        Some(RegistryError::TableFull),
    );

    h.fusion.deregister(handles[3]);
    h.fusion.deregister(handles[3]);
    assert_eq!(drivers.registered_count(), 14);
    assert_eq!(drivers.class_of(handles[3]), None);
    let again = h.fusion.register(Recorder::new(true), DriverClass::Lan).expect("register failed");
    assert_eq!(again, handles[3]);
    assert_eq!(drivers.lan_handle(), Some(again));

    let bogus = DriverHandle::from_raw(200).expect("nonzero");
    assert_eq!(h.fusion.register_event_handler(bogus, Recorder::new(true)), Err(RegistryError::InvalidHandle));
    assert_eq!(DriverHandle::from_raw(0), None);
}

#[test]
fn event_notification_sent_once() {
    let (_h, sim, ioc) = bring_up_fc();
    ioc.do_ioc_recovery(RecoveryReason::Bringup, SleepMode::CanSleep).expect("second bring-up failed");

    assert_eq!(sim.state().event_notifications, 1);
    assert_eq!(ioc.event_state(), 1);
    assert!(ioc.is_active());
}

#[test]
fn events_reach_handlers_and_log() {
    let h = Harness::new();
    let sim = h.sim(fc_config());
    let settings = AdapterSettings { event_log_size: 4, ..Default::default() };
    let ioc = h.install_with(&sim, pci(FC919X, 0), settings);

    let rec = Recorder::new(true);
    let handle = h.fusion.register(rec.clone(), DriverClass::ScsiHost).expect("register failed");
    h.fusion.register_event_handler(handle, rec.clone()).expect("event handler");

    sim.raise_event(EventCode::LinkStatusChange as u32, &[1, 2, 3], true);
    h.interrupts();

    assert_eq!(*rec.events.lock(), vec![EventCode::LinkStatusChange as u32]);
    assert_eq!(sim.state().event_acks, 1);
    // The ack's frame came back; the event notification frame is still held.
    assert_eq!(ioc.free_frame_count(), 7);

    let log = ioc.event_log_snapshot();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].event, EventCode::EventChange as u32);
    assert_eq!(log[0].data, [1, 0]);
    assert_eq!(log[1].event, EventCode::LinkStatusChange as u32);
    assert_eq!(log[1].data, [1, 2]);

    h.fusion.deregister_event_handler(handle);
    sim.raise_event(EventCode::Rescan as u32, &[], false);
    h.interrupts();
    assert_eq!(rec.events.lock().len(), 1);
    assert_eq!(sim.state().event_acks, 1);
}

fn scsi_pages(sim: &SimIoc) {
    sim.set_page(CONFIG_PAGETYPE_SCSI_PORT, 0, 0, page_bytes::<ScsiPortPage0>(|p| {
        p.capabilities.set(SCSIPORTPAGE0_CAP_WIDE | 0x3F << 16 | 0x08 << 8);
        p.physical_interface.set(SCSIPORTPAGE0_PHY_SIGNAL_SE);
    }));
    sim.set_page(CONFIG_PAGETYPE_SCSI_PORT, 2, 0, page_bytes::<ScsiPortPage2>(|p| {
        p.port_flags.set(0x20);
        p.device_settings[0].timeout = 10;
        p.device_settings[0].sync_factor = 0x0A;
        p.device_settings[0].device_flags.set(0x0001);
    }));
    sim.set_page(CONFIG_PAGETYPE_SCSI_DEVICE, 0, 0, vec![0; 12]);
    sim.set_page(CONFIG_PAGETYPE_SCSI_DEVICE, 1, 0, vec![0; 8]);

    let mut page2 = page_bytes::<IocPage2>(|p| {
        p.num_active_volumes = 1;
        p.num_active_phys_disks = 1;
    });
    page2.extend_from_slice(page_bytes::<RaidVolume>(|v| v.volume_id = 3).as_slice());
    sim.set_page(CONFIG_PAGETYPE_IOC, 2, 0, page2);

    let mut page3 = page_bytes::<IocPage3>(|p| p.num_phys_disks = 1);
    page3.extend_from_slice(PhysDisk { phys_disk_id: 5, phys_disk_bus: 0, phys_disk_ioc: 0, phys_disk_num: 0 }.as_bytes());
    sim.set_page(CONFIG_PAGETYPE_IOC, 3, 0, page3);

    sim.set_page(CONFIG_PAGETYPE_IOC, 1, 0, page_bytes::<IocPage1>(|p| {
        p.flags.set(IOCPAGE1_REPLY_COALESCING);
        p.coalescing_timeout.set(0x40);
    }));

    let mut page4 = page_bytes::<IocPage4>(|p| p.active_sep = 1);
    page4.extend_from_slice(page_bytes::<SepEntry>(|e| e.sep_target_id = 7).as_slice());
    sim.set_page(CONFIG_PAGETYPE_IOC, 4, 0, page4);

    sim.set_page(CONFIG_PAGETYPE_IO_UNIT, 2, 0, page_bytes::<IoUnitPage2>(|p| p.bios_version.set(0x0104_0000)));
}

#[test]
fn scsi_bringup_prefetches_port_and_raid() {
    let h = Harness::new();
    let sim = h.sim(SimConfig { port_type: 0x30, ..Default::default() });
    scsi_pages(&sim);
    let ioc = h.install(&sim, pci(C1030, 0));
    assert!(ioc.is_active());

    let scsi = ioc.scsi_port();
    assert!(scsi.wide);
    assert_eq!(scsi.max_sync_offset, 0x3F);
    assert_eq!(scsi.min_sync_factor, 0x0C);
    assert_eq!(scsi.bus_mode, SCSIPORTPAGE0_PHY_SIGNAL_SE);
    assert_eq!(scsi.port_flags, 0x20);
    assert_eq!(scsi.nvram[0], 10 | 0x0A << 8 | 1 << 16);
    assert_eq!(scsi.nvram[1], 0);
    assert_eq!((scsi.device_page0_version, scsi.device_page0_length), (1, 3));
    assert_eq!((scsi.device_page1_version, scsi.device_page1_length), (1, 2));

    let raid = ioc.raid_info();
    assert_eq!(raid.volume_mask, 1 << 3);
    assert_eq!(raid.phys_disks.len(), 1);
    assert_eq!(raid.phys_disks[0].phys_disk_id, 5);
    assert_eq!(raid.seps.len(), 1);
    assert_eq!(raid.seps[0].sep_target_id, 7);
    assert_eq!(raid.coalescing_timeout, 0x10);
    assert_eq!(ioc.bios_version(), 0x0104_0000);

    let s = sim.state();
    let writes: Vec<(u8, ConfigAction)> = s.config_writes.iter().map(|w| (w.page_number, w.action)).collect();
    assert_eq!(writes, vec![(1, ConfigAction::WriteCurrent), (1, ConfigAction::WriteNvram)]);
    assert!(s.config_writes.iter().all(|w| w.page_type == CONFIG_PAGETYPE_IOC && w.data[8..12] == [0x10, 0, 0, 0]));
}

#[test]
fn scsi_port_defaults_without_page0() {
    let h = Harness::new();
    let sim = h.sim(SimConfig { port_type: 0x30, ..Default::default() });
    let ioc = h.install(&sim, pci(C1030, 0));

    let scsi = ioc.scsi_port();
    assert!(!scsi.wide);
    assert_eq!(scsi.min_sync_factor, 0xFF);
    assert_eq!(scsi.bus_mode, SCSIPORTPAGE0_PHY_SIGNAL_SE);
    assert_eq!(scsi.nvram[0], 0xFFFF_FFFF);
}

#[test]
fn firmware_is_cached_and_downloaded() {
    let h = Harness::new();
    let image = firmware_image();
    let sim = h.sim(SimConfig { download_boot: true, image: image.clone(), ..fc_config() });
    let ioc = h.install(&sim, pci(FC919X, 0));

    assert!(ioc.is_active());
    assert!(ioc.has_cached_firmware());
    assert_eq!(sim.state().uploads, 1);
    assert_eq!(sim.state().init_flags, vec![0]);

    ioc.trigger_hard_reset(SleepMode::CanSleep).expect("hard reset failed");
    assert!(ioc.is_active());
    assert_eq!(ioc.ioc_state(), IocState::Operational);

    let s = sim.state();
    assert_eq!(s.hard_resets, 1);
    assert_eq!(s.uploads, 1);
    assert_eq!(s.segments, vec![
        (0x2000_0000, dwords(&image[..0x100])),
        (0x2100_0000, dwords(&image[0x100..0x180])),
        (0x3F00_0004, vec![0x40]),
    ]);
    assert_eq!(s.flash_word, DIAG_RW_FLASH_BAD_BIT);
    assert_eq!(s.init_flags, vec![0, IOCINIT_FLAGS_DISCARD_FW_IMAGE]);
}

#[test]
fn hard_reset_notifies_reset_handlers() {
    struct Phases(Mutex<Vec<ResetPhase>>);
    impl ResetHandler for Phases {
        fn on_reset(&self, _ioc: &Adapter, phase: ResetPhase) -> i32 {
            self.0.lock().push(phase);
            1
        }
    }

    let (h, sim, ioc) = bring_up_fc();
    let phases = Arc::new(Phases(Mutex::new(Vec::new())));
    let handle = h.fusion.register(Recorder::new(true), DriverClass::ScsiHost).expect("register failed");
    h.fusion.register_reset_handler(handle, phases.clone()).expect("reset handler");

    ioc.trigger_hard_reset(SleepMode::NoSleep).expect("hard reset failed");
    assert_eq!(*phases.0.lock(), vec![ResetPhase::Setup, ResetPhase::Pre, ResetPhase::Post]);
    assert_eq!(sim.state().hard_resets, 1);
    assert!(ioc.is_active());
    assert_eq!(ioc.free_frame_count(), 7);
}

#[test]
fn task_management_goes_through_doorbell() {
    let (h, sim, ioc) = bring_up_fc();
    let rec = Recorder::new(true);
    let handle = h.fusion.register(rec.clone(), DriverClass::ScsiHost).expect("register failed");

    let mut frame = ioc.acquire_request_frame(handle).expect("no free frame");
    let idx = frame.index();
    ioc.request_frame_mut(&mut frame)[3] = Function::ScsiTaskMgmt as u8;
    ioc.send_handshake_request(handle, frame, 52, SleepMode::CanSleep).expect("handshake failed");
    h.interrupts();

    assert_eq!(sim.state().task_mgmt, 1);
    assert_eq!(rec.replies(), vec![(Some(idx), Seen::NoReply)]);
    assert_eq!(ioc.free_frame_count(), 7);
}

#[test]
fn dual_function_siblings_are_bound() {
    let h = Harness::new();
    let sim0 = h.sim(fc_config());
    let sim1 = h.sim(fc_config());
    let ioc0 = h.install(&sim0, pci(FC929X, 0));
    let ioc1 = h.install(&sim1, pci(FC929X, 1));

    assert_eq!(ioc0.alt_id(), Some(ioc1.id()));
    assert_eq!(ioc1.alt_id(), Some(ioc0.id()));
    assert_eq!(ioc1.sibling().map(|a| a.id()), Some(ioc0.id()));
    assert_eq!(h.fusion.find_next_adapter(&ioc0).map(|a| a.id()), Some(ioc1.id()));

    h.fusion.remove_adapter(ioc1.id()).expect("remove failed");
    assert_eq!(ioc0.alt_id(), None);
    assert!(h.fusion.verify_adapter(ioc1.id()).is_none());
    assert_eq!(h.fusion.find_next_adapter(&ioc0).map(|a| a.id()), None);
}

#[test]
fn remove_resets_and_detaches() {
    let (h, sim, ioc) = bring_up_fc();
    let mu_before = sim.state().mu_resets;

    h.fusion.remove_adapter(ioc.id()).expect("remove failed");
    assert_eq!(sim.state().mu_resets, mu_before + 1);
    assert!(!ioc.is_active());
    assert!(h.fusion.find_first_adapter().is_none());
    assert_eq!(h.fusion.remove_adapter(ioc.id()), Err(AttachError::NoSuchAdapter));
}

#[test]
fn unknown_chip_is_refused() {
    let h = Harness::new();
    let sim = h.sim(fc_config());
    let regs: Arc<dyn RegisterAccess> = sim;
    let platform: Arc<dyn Platform> = h.platform.clone();
    let result = h.fusion.install_adapter(pci(0x0050, 0), regs, platform, AdapterSettings::default());
    assert_eq!(result.err(), Some(AttachError::UnknownChip(0x0050)));
}

#[test]
fn subsystem_start_and_stop() {
    let first = fusion_init().expect("fusion_init failed");
    let second = fusion_init().expect("fusion_init failed");
    assert!(Arc::ptr_eq(&first, &second));
    assert!(fusion().is_some());
    assert_eq!(first.drivers().registered_count(), 1);

    fusion_exit();
    assert!(fusion().is_none());
    assert_eq!(first.drivers().registered_count(), 0);
}

#[test]
fn register_mapping_needs_the_chosen_bar() {
    use crate::regs::{map_registers, PciBars};

    let no_bars = PciBars::default();
    assert!(unsafe { map_registers(RegisterAccessMode::Mmio, no_bars) }.is_err());
    assert!(unsafe { map_registers(RegisterAccessMode::PortIo, no_bars) }.is_err());

    // Only the memory BAR is present, so port I/O still has nothing to map.
    let mem_only = PciBars { mem: Some(0x1000), io: None };
    assert!(unsafe { map_registers(RegisterAccessMode::PortIo, mem_only) }.is_err());
}

#[test]
fn mmio_registers_follow_the_block_layout() {
    use crate::regs::MmioRegisters;

    let mut block = [0u32; SYSIF_REGS_SIZE as usize / 4];
    block[0x44 / 4] = 0x0000_1234;
    let regs = unsafe { MmioRegisters::new(block.as_mut_ptr() as usize) }.expect("null base");

    regs.write32(SysIfReg::IntMask, INT_MASK_ALL);
    regs.write32(SysIfReg::HostIndex, 7);
    regs.write32(SysIfReg::DiagRwAddress, 0x2000_0000);
    assert_eq!(regs.read32(SysIfReg::ReplyFifo), 0x0000_1234);
    assert_eq!(regs.read32(SysIfReg::IntMask), INT_MASK_ALL);
    drop(regs);

    assert_eq!(block[0x34 / 4], INT_MASK_ALL);
    assert_eq!(block[0x50 / 4], 7);
    assert_eq!(block[0x14 / 4], 0x2000_0000);
    assert!(unsafe { MmioRegisters::new(0) }.is_none());
}

#[test]
fn queue_lock_holds_off_interrupts() {
    let (h, sim, ioc) = bring_up_fc();
    let handle = h.fusion.register(Recorder::new(true), DriverClass::Lan).expect("register failed");
    let holds = h.platform.interrupt_holds();
    let idx = ioc.acquire_request_frame(handle).expect("no free frame").index();
    assert!(h.platform.interrupt_holds() > holds);
    assert!(h.platform.interrupts_enabled());

    sim.inject_reply(LAN_TURBO_FREE_ONLY | idx as u32);
    let queues = ioc.lock_queues();
    assert!(!h.platform.interrupts_enabled());
    // The free-only reply needs this lock; it must wait until the lock is dropped.
    h.interrupts();
    drop(queues);
    assert!(h.platform.interrupts_enabled());
    assert_eq!(ioc.free_frame_count(), 6);

    h.interrupts();
    assert_eq!(ioc.free_frame_count(), 7);

    let holds = h.platform.interrupt_holds();
    ioc.event_log_snapshot();
    assert!(h.platform.interrupt_holds() > holds);
    assert!(h.platform.interrupts_enabled());
}

#[test]
fn lan_free_only_reply_ignored_while_inactive() {
    let (h, sim, ioc) = bring_up_fc();
    let handle = h.fusion.register(Recorder::new(true), DriverClass::Lan).expect("register failed");
    let idx = ioc.acquire_request_frame(handle).expect("no free frame").index();
    assert_eq!(ioc.free_frame_count(), 6);

    ioc.mask_interrupts();
    sim.inject_reply(LAN_TURBO_FREE_ONLY | idx as u32);
    assert!(ioc.handle_interrupt());
    assert_eq!(ioc.free_frame_count(), 6);
}

#[test]
fn expiry_leaves_unlinked_config_to_its_owner() {
    /// Takes one request off the config queue at reset setup, as its reply path would.
    struct Unlink(Arc<PendingConfig>);
    impl ResetHandler for Unlink {
        fn on_reset(&self, ioc: &Adapter, phase: ResetPhase) -> i32 {
            if phase == ResetPhase::Setup {
                ioc.lock_queues().config_q.retain(|p| !Arc::ptr_eq(p, &self.0));
            }
            1
        }
    }

    let (h, sim, ioc) = bring_up_fc();
    assert!(h.platform.now_ms() > 1);
    let taken = Arc::new(PendingConfig::new(0xBEEF, 1));
    let stuck = Arc::new(PendingConfig::new(0xBEF0, 1));
    ioc.lock_queues().config_q.push(taken.clone());
    ioc.lock_queues().config_q.push(stuck.clone());
    let handle = h.fusion.register(Recorder::new(true), DriverClass::ScsiHost).expect("register failed");
    h.fusion.register_reset_handler(handle, Arc::new(Unlink(taken.clone()))).expect("reset handler");

    ioc.expire_config_timers();
    assert_eq!(sim.state().hard_resets, 1);
    assert!(!taken.is_done());
    assert!(stuck.is_done());
    assert_eq!(stuck.status(), CONFIG_ERROR);
    assert_eq!(ioc.pending_config_count(), 0);
    assert!(ioc.is_active());
}

#[test]
fn inactive_sibling_is_left_alone_by_hard_reset() {
    let h = Harness::new();
    let sim0 = h.sim(fc_config());
    let sim1 = h.sim(fc_config());
    let ioc0 = h.install(&sim0, pci(FC929X, 0));
    let ioc1 = h.install(&sim1, pci(FC929X, 1));
    let (facts, inits) = (sim1.state().facts_requests, sim1.state().init_flags.len());

    ioc1.mask_interrupts();
    ioc0.trigger_hard_reset(SleepMode::CanSleep).expect("hard reset failed");
    assert!(ioc0.is_active());
    assert!(!ioc1.is_active());
    assert_eq!(sim1.state().facts_requests, facts);
    assert_eq!(sim1.state().init_flags.len(), inits);
}

#[test]
fn failed_sibling_stays_masked_after_hard_reset() {
    let h = Harness::new();
    let sim0 = h.sim(fc_config());
    let sim1 = h.sim(fc_config());
    let ioc0 = h.install(&sim0, pci(FC929X, 0));
    let ioc1 = h.install(&sim1, pci(FC929X, 1));
    assert!(ioc1.is_active());

    sim1.state().stall_ack = true;
    ioc0.trigger_hard_reset(SleepMode::CanSleep).expect("hard reset failed");
    assert!(ioc0.is_active());
    assert!(!ioc1.is_active());
    assert_eq!(sim1.state().int_mask, INT_MASK_ALL);
}

#[test]
fn sibling_uploads_firmware_after_shared_hard_reset() {
    let h = Harness::new();
    let sim0 = h.sim(fc_config());
    let sim1 = h.sim(SimConfig { download_boot: true, image: firmware_image(), ..fc_config() });
    let ioc0 = h.install(&sim0, pci(FC929X, 0));
    let ioc1 = h.install(&sim1, pci(FC929X, 1));
    assert_eq!(sim1.state().uploads, 1);

    sim0.state().stuck_active = true;
    ioc0.do_ioc_recovery(RecoveryReason::Bringup, SleepMode::CanSleep).expect("bring-up failed");
    assert_eq!(sim0.state().hard_resets, 1);
    assert_eq!(sim0.state().uploads, 0);
    assert_eq!(sim1.state().uploads, 2);
    assert!(ioc1.is_active());
    assert!(ioc1.has_cached_firmware());
}

#[test]
fn event_change_keeps_only_the_enable_bit() {
    struct Quiet;
    impl EventHandler for Quiet {
        fn on_event(&self, _ioc: &Adapter, _reply: &[u8]) -> i32 {
            0
        }
    }

    let (h, sim, ioc) = bring_up_fc();
    assert_eq!(ioc.event_state(), 1);
    sim.raise_event(EventCode::EventChange as u32, &[0x2], false);
    h.interrupts();
    assert_eq!(ioc.event_state(), 0);
    sim.raise_event(EventCode::EventChange as u32, &[0xFF], false);
    h.interrupts();
    assert_eq!(ioc.event_state(), 1);

    let rec = Recorder::new(true);
    let first = h.fusion.register(rec.clone(), DriverClass::ScsiHost).expect("register failed");
    let second = h.fusion.register(Recorder::new(true), DriverClass::ScsiHost).expect("register failed");
    h.fusion.register_event_handler(first, rec.clone()).expect("event handler");
    h.fusion.register_event_handler(second, Arc::new(Quiet)).expect("event handler");

    let mut reply = EventNotificationReply::new_zeroed();
    reply.function = Function::EventNotification as u8;
    reply.event.set(EventCode::Rescan as u32);
    assert_eq!(ioc.process_event_notification(reply.as_bytes()), 1);
    assert_eq!(*rec.events.lock(), vec![EventCode::Rescan as u32]);
}

#[test]
fn frame_arena_failures_release_partial_allocations() {
    let h = Harness::new();
    let sim = h.sim(fc_config());
    h.platform.limit_allocations(1);
    let ioc = h.install(&sim, pci(FC919X, 0));
    assert!(!ioc.is_active());
    assert_eq!(h.platform.mem.live_regions(), 0);
    assert_eq!(
        ioc.do_ioc_recovery(RecoveryReason::Bringup, SleepMode::CanSleep),
        Err(RecoveryError::Prime(PrimeError::NoMemory)),
    );

    let h = Harness::new();
    let sim = h.sim(fc_config());
    let settings = AdapterSettings { address_width: AddressWidth::Bits32, ..Default::default() };
    let ioc = h.install_with(&sim, pci(FC919X, 0), settings);
    assert!(!ioc.is_active());
    assert_eq!(h.platform.mem.live_regions(), 0);
    assert_eq!(
        ioc.do_ioc_recovery(RecoveryReason::Bringup, SleepMode::CanSleep),
        Err(RecoveryError::Prime(PrimeError::AddressTooHigh)),
    );
}

#[test]
fn frame_arenas_must_share_one_high_address() {
    let h = Harness::new();
    let sim = h.sim(fc_config());
    // Request frames would start below 4 GiB and end above it.
    h.platform.set_next_phys(0xFFFF_FC00);
    let ioc = h.install(&sim, pci(FC919X, 0));
    assert!(!ioc.is_active());
    assert_eq!(h.platform.mem.live_regions(), 0);

    h.platform.set_next_phys(0xFFFF_FC00);
    assert_eq!(
        ioc.do_ioc_recovery(RecoveryReason::Bringup, SleepMode::CanSleep),
        Err(RecoveryError::Prime(PrimeError::HighAddressMismatch)),
    );

    h.platform.set_next_phys(0x2_0000_0000);
    ioc.do_ioc_recovery(RecoveryReason::Bringup, SleepMode::CanSleep).expect("bring-up failed");
    assert!(ioc.is_active());
    assert_eq!(ioc.arena_high_addrs(), (2, 2));
}

#[test]
fn firmware_fragments_shrink_until_they_fit() {
    let h = Harness::new();
    let mut image = firmware_image();
    image.resize(0x2000, 0xA5);
    let sim = h.sim(SimConfig { download_boot: true, image, ..fc_config() });
    h.platform.max_alloc.store(0x1000, core::sync::atomic::Ordering::SeqCst);
    let ioc = h.install(&sim, pci(FC919X, 0));

    assert!(ioc.is_active());
    assert!(ioc.has_cached_firmware());
    assert_eq!(sim.state().upload_fragments, vec![0x1000, 0x1000]);
}

#[test]
fn firmware_fragments_are_released_when_short() {
    // Too many fragments for one upload request.
    let h = Harness::new();
    let sim = h.sim(SimConfig { download_boot: true, image: vec![0; 0x1_0000], ..fc_config() });
    h.platform.max_alloc.store(0x1000, core::sync::atomic::Ordering::SeqCst);
    let ioc = h.install(&sim, pci(FC919X, 0));
    assert!(!ioc.is_active());
    assert!(!ioc.has_cached_firmware());
    assert_eq!(sim.state().uploads, 0);
    // Only the three frame arenas remain.
    assert_eq!(h.platform.mem.live_regions(), 3);
    assert_eq!(
        ioc.do_ioc_recovery(RecoveryReason::Bringup, SleepMode::CanSleep),
        Err(RecoveryError::Upload(FirmwareError::NoMemory)),
    );
    assert_eq!(h.platform.mem.live_regions(), 3);

    // Fragments may not shrink below 4 KiB.
    let h = Harness::new();
    let mut image = firmware_image();
    image.resize(0x2000, 0);
    let sim = h.sim(SimConfig { download_boot: true, image, ..fc_config() });
    h.platform.limit_allocations(3);
    let ioc = h.install(&sim, pci(FC919X, 0));
    assert!(!ioc.is_active());
    assert_eq!(sim.state().uploads, 0);
    assert_eq!(h.platform.mem.live_regions(), 3);
}
