//! Firmware image layout.
//!
//! An uploaded IOC image starts with a [`FwHeader`] describing the main image.
//! Its `next_image_header_offset` links to zero or more extension images,
//! each starting with an [`ExtImageHeader`]; offsets are relative to the start of the whole image.

use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};
use crate::{Le16, Le32};

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FwHeader {
    pub arm_branch_instruction0: Le32,
    pub signature0: Le32,
    pub signature1: Le32,
    pub signature2: Le32,
    pub arm_branch_instruction1: Le32,
    pub arm_branch_instruction2: Le32,
    pub reserved: Le32,
    pub checksum: Le32,
    pub vendor_id: Le16,
    pub product_id: Le16,
    pub fw_version: Le32,
    pub seq_code_version: Le32,
    pub image_size: Le32,
    pub next_image_header_offset: Le32,
    pub load_start_address: Le32,
    pub iop_reset_vector_value: Le32,
    pub iop_reset_reg_addr: Le32,
    pub version_name_what: Le32,
    pub version_name: [u8; 32],
    pub vendor_name_what: Le32,
    pub vendor_name: [u8; 32],
}
const_assert_eq!(size_of::<FwHeader>(), 136);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ExtImageHeader {
    pub image_type: u8,
    pub reserved: u8,
    pub reserved1: Le16,
    pub checksum: Le32,
    pub image_size: Le32,
    pub next_image_header_offset: Le32,
    pub load_start_address: Le32,
    pub reserved2: Le32,
}
const_assert_eq!(size_of::<ExtImageHeader>(), 24);
