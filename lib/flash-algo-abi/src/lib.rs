// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! flash-algo-abi
//!
//! This crate documents the interface between the debug/programming host and
//! the flash routine it injects into target RAM.
//!
//! The host loads the routine image at its link address, finds the
//! [`ProgramHeader`] at the start of the image, fills in a [`FlashDescriptor`]
//! elsewhere in RAM, points the header's `descriptor` field at it, and starts
//! the target at the header's `entry`. The routine performs the requested
//! actions and parks the CPU at a breakpoint; the host then reads the
//! descriptor back to learn the [`ResultCode`] and which actions (if any)
//! were left unfinished.
//!
//! Everything in here is shared-memory layout read by a 32-bit Cortex-M
//! target on one side and the host's debug probe on the other, so all
//! pointers are carried as `u32` and every struct is `repr(C)` with an
//! explicitly documented size.

#![cfg_attr(target_os = "none", no_std)]

use bitflags::bitflags;
use num_derive::FromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

bitflags! {
    /// Actions the host may request in `FlashDescriptor::flags`, plus the
    /// completion marker the routine sets when it halts.
    ///
    /// The set is a *request* set: bit order does not control execution
    /// order. The routine performs requested actions in a fixed priority
    /// order (init, erase-block, erase-range, blank-check, program, verify)
    /// and clears each bit as its action completes, so a descriptor read
    /// back after a failed run shows the unfinished work by its still-set
    /// bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Actions: u32 {
        const INIT = 1 << 0;
        const ERASE_BLOCK = 1 << 1;
        const ERASE_RANGE = 1 << 2;
        const BLANK_CHECK_RANGE = 1 << 3;
        const PROGRAM_RANGE = 1 << 4;
        const VERIFY_RANGE = 1 << 5;
        /// FlexNVM partitioning. Accepted for ABI compatibility; FTFA parts
        /// have no FlexNVM and this build ignores the bit.
        const PARTITION_FLEXNVM = 1 << 7;
        /// Timing calibration loop; ignored by this build.
        const TIMING_LOOP = 1 << 8;
        /// Set exactly once, by the routine, just before it parks at the
        /// breakpoint. Never requested by the host.
        const COMPLETE = 1 << 31;
    }
}

bitflags! {
    /// Capability bits advertised in `ProgramHeader::capabilities`.
    ///
    /// The action-shaped bits share positions with [`Actions`]. The host
    /// must not request an action whose capability bit is absent; the
    /// routine trusts the host and does not re-check.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Capabilities: u32 {
        const ERASE_BLOCK = 1 << 1;
        const ERASE_RANGE = 1 << 2;
        const BLANK_CHECK_RANGE = 1 << 3;
        const PROGRAM_RANGE = 1 << 4;
        const VERIFY_RANGE = 1 << 5;
        const UNLOCK_FLASH = 1 << 6;
        const PARTITION_FLEXNVM = 1 << 7;
        const TIMING = 1 << 8;
        /// DSC program memory overlays data RAM (other-architecture builds).
        const DSC_OVERLAY = 1 << 11;
        /// The descriptor lives at a fixed address rather than being
        /// pointed to by the header.
        const DATA_FIXED = 1 << 12;
        /// The image may be loaded at an address other than its link
        /// address.
        const RELOCATABLE = 1 << 31;
    }
}

/// Result taxonomy reported in `FlashDescriptor::error_code`.
///
/// The numeric values are consumed by the host and are stable; codes that
/// this routine never produces (e.g. `ClockDivider`, which is reported by
/// ColdFire builds) are still part of the shared numbering.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    Ok = 0,
    /// Flash is still secured/locked.
    FlashLocked = 1,
    IllegalParams = 2,
    /// Programming failed for an unspecified reason.
    ProgramFailed = 3,
    WriteProtected = 4,
    VerifyFailed = 5,
    /// Erase or blank check failed.
    EraseFailed = 6,
    /// The routine trapped (hard fault, illegal instruction, unexpected
    /// interrupt).
    Trap = 7,
    /// Command rejected by the controller (FSTAT.ACCERR).
    AccessError = 8,
    /// Command hit a protected region (FSTAT.FPVIOL).
    ProtectionViolation = 9,
    /// Command completed with a margin/verify fault (FSTAT.MGSTAT0).
    MarginFault = 10,
    /// Flash clock divider not configured (ColdFire builds only).
    ClockDivider = 11,
    /// Refused to program a security value that would permanently disable
    /// mass erase.
    IllegalSecurity = 12,
    Unknown = 13,
}

impl From<ResultCode> for u16 {
    fn from(code: ResultCode) -> u16 {
        code as u16
    }
}

/// Conventional value the host seeds into `error_code` before starting the
/// routine, so a stale `Ok` can never be mistaken for a fresh result.
pub const RESULT_SENTINEL: u16 = 0xAA55;

/// Describes one batch of requested flash work, and carries its result.
///
/// Allocated and populated by the host in target RAM before entry; `flags`
/// and `error_code` are written back by the routine. 28 bytes.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlashDescriptor {
    /// Requested [`Actions`], consumed in place; [`Actions::COMPLETE`] is
    /// ORed in when the routine halts.
    pub flags: u32,
    /// Address of the flash controller register block.
    pub controller: u32,
    /// Target clock rate hint in kHz. Not used by FTFA builds (the flash
    /// clock is fixed); carried for hosts that share one descriptor layout
    /// across chip families.
    pub frequency: u32,
    /// [`ResultCode`] as `u16`, written exactly once when the routine
    /// halts. The host seeds [`RESULT_SENTINEL`] here.
    pub error_code: u16,
    /// Erase sector size in bytes. Must be a power of two.
    pub sector_size: u16,
    /// Start of the byte range operated on. Need not be sector-aligned.
    pub address: u32,
    /// Length in bytes of the range.
    pub data_size: u32,
    /// Address of the program/verify payload (`data_size` bytes). Only
    /// meaningful when `PROGRAM_RANGE` or `VERIFY_RANGE` is requested.
    pub data_address: u32,
}

impl FlashDescriptor {
    pub fn actions(&self) -> Actions {
        Actions::from_bits_retain(self.flags)
    }
}

/// Fixed-layout header at the start of the loaded image. 24 bytes.
///
/// The host locates this structure at the image's load address to discover
/// the entry point and capabilities, and writes the descriptor pointer here
/// before each run.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ProgramHeader {
    /// Address the image was linked for.
    pub load_address: u32,
    /// Address of the entry routine.
    pub entry: u32,
    /// [`Capabilities`] as `u32`.
    pub capabilities: u32,
    pub reserved: [u32; 2],
    /// Address of the [`FlashDescriptor`]; zero until the host sets it.
    pub descriptor: u32,
}

impl ProgramHeader {
    /// Parses a header out of the front of a loaded image, for host-side
    /// use. Copies rather than borrows, since the image buffer carries no
    /// alignment guarantee.
    pub fn read_from_image(image: &[u8]) -> Option<Self> {
        Self::read_from_prefix(image).ok().map(|(header, _)| header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};
    use num_traits::FromPrimitive;

    #[test]
    fn descriptor_layout_is_wire_exact() {
        assert_eq!(size_of::<FlashDescriptor>(), 28);
        assert_eq!(offset_of!(FlashDescriptor, flags), 0);
        assert_eq!(offset_of!(FlashDescriptor, controller), 4);
        assert_eq!(offset_of!(FlashDescriptor, frequency), 8);
        assert_eq!(offset_of!(FlashDescriptor, error_code), 12);
        assert_eq!(offset_of!(FlashDescriptor, sector_size), 14);
        assert_eq!(offset_of!(FlashDescriptor, address), 16);
        assert_eq!(offset_of!(FlashDescriptor, data_size), 20);
        assert_eq!(offset_of!(FlashDescriptor, data_address), 24);
    }

    #[test]
    fn header_layout_is_wire_exact() {
        assert_eq!(size_of::<ProgramHeader>(), 24);
        assert_eq!(offset_of!(ProgramHeader, entry), 4);
        assert_eq!(offset_of!(ProgramHeader, capabilities), 8);
        assert_eq!(offset_of!(ProgramHeader, descriptor), 20);
    }

    #[test]
    fn action_bits_match_the_host_contract() {
        assert_eq!(Actions::INIT.bits(), 1 << 0);
        assert_eq!(Actions::ERASE_BLOCK.bits(), 1 << 1);
        assert_eq!(Actions::ERASE_RANGE.bits(), 1 << 2);
        assert_eq!(Actions::BLANK_CHECK_RANGE.bits(), 1 << 3);
        assert_eq!(Actions::PROGRAM_RANGE.bits(), 1 << 4);
        assert_eq!(Actions::VERIFY_RANGE.bits(), 1 << 5);
        assert_eq!(Actions::PARTITION_FLEXNVM.bits(), 1 << 7);
        assert_eq!(Actions::TIMING_LOOP.bits(), 1 << 8);
        assert_eq!(Actions::COMPLETE.bits(), 1 << 31);
    }

    #[test]
    fn result_codes_decode_from_raw() {
        assert_eq!(ResultCode::from_u16(0), Some(ResultCode::Ok));
        assert_eq!(ResultCode::from_u16(6), Some(ResultCode::EraseFailed));
        assert_eq!(ResultCode::from_u16(10), Some(ResultCode::MarginFault));
        assert_eq!(
            ResultCode::from_u16(12),
            Some(ResultCode::IllegalSecurity)
        );
        assert_eq!(ResultCode::from_u16(13), Some(ResultCode::Unknown));
        assert_eq!(ResultCode::from_u16(RESULT_SENTINEL), None);
    }

    #[test]
    fn header_parses_from_an_image_prefix() {
        let mut image = [0u8; 64];
        image[0..4].copy_from_slice(&0x2000_0000u32.to_le_bytes());
        image[4..8].copy_from_slice(&0x2000_00c1u32.to_le_bytes());
        image[8..12].copy_from_slice(
            &(Capabilities::ERASE_RANGE | Capabilities::PROGRAM_RANGE)
                .bits()
                .to_le_bytes(),
        );
        let header = ProgramHeader::read_from_image(&image).unwrap();
        assert_eq!(header.load_address, 0x2000_0000);
        assert_eq!(header.entry, 0x2000_00c1);
        assert_eq!(header.descriptor, 0);
    }

    #[test]
    fn header_is_read_from_the_load_address_not_the_vector_table() {
        // Shape of the image the linker actually produces: the header in
        // the first 24 bytes, padding, then the vector table (initial SP
        // and reset vector) at offset 0x100. The parse must yield the
        // header fields, never the vector words.
        let mut image = vec![0u8; 0x140];
        image[0..4].copy_from_slice(&0x2000_0000u32.to_le_bytes());
        image[4..8].copy_from_slice(&0x2000_0139u32.to_le_bytes());
        image[8..12]
            .copy_from_slice(&Capabilities::ERASE_BLOCK.bits().to_le_bytes());
        image[0x100..0x104].copy_from_slice(&0x2000_1000u32.to_le_bytes());
        image[0x104..0x108].copy_from_slice(&0x2000_0139u32.to_le_bytes());

        let header = ProgramHeader::read_from_image(&image).unwrap();
        assert_eq!(header.load_address, 0x2000_0000);
        assert_eq!(header.entry, 0x2000_0139);
        assert_eq!(
            header.capabilities,
            Capabilities::ERASE_BLOCK.bits()
        );
        assert_eq!(header.descriptor, 0);
    }
}
