//! The Message Passing Interface (MPI) spoken by Fusion-MPT I/O controllers.
//!
//! Fusion-MPT controllers (the FC9xx Fibre Channel family and the C103x parallel SCSI family)
//! run their own firmware and exchange fixed-layout messages with the host,
//! either through the doorbell handshake or through posted request/reply FIFOs.
//! This crate describes that contract and nothing else:
//! * [`sysif`]: the system interface register block, doorbell states, diagnostic bits,
//!   and the encoding of values read from the reply FIFO.
//! * [`msg`]: function codes and the request/reply messages used by the base driver.
//! * [`sge`]: scatter-gather element encoders.
//! * [`pages`]: configuration page layouts.
//! * [`fw`]: firmware image headers, as uploaded from and downloaded to the IOC.
//! * [`event`]: asynchronous event codes and their descriptions.
//! * [`status`]: IOC status codes and log-info decoding.
//!
//! All multi-byte fields are little-endian on the wire.
//! Message structs use `zerocopy` byte-order-aware integers so they can be read from
//! and written to DMA memory or handshake buffers without any manual swapping.

#![no_std]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate byteorder;
extern crate num_enum;
extern crate zerocopy;

pub mod sysif;
pub mod msg;
pub mod sge;
pub mod pages;
pub mod fw;
pub mod event;
pub mod status;


use zerocopy::byteorder::{LittleEndian, U16, U32};

/// A little-endian `u16` wire field.
pub type Le16 = U16<LittleEndian>;
/// A little-endian `u32` wire field.
pub type Le32 = U32<LittleEndian>;

/// MPI version 1.2, the version implemented by this crate's message layouts.
/// IOCs reporting an older message version encode their firmware version
/// in the legacy 16-bit format and do not support IOC page 2/3 RAID reporting.
pub const MPI_VERSION_01_02: u16 = 0x0102;
