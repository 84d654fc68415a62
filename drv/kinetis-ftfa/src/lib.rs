// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A raw driver for the Kinetis FTFA flash controller (MKL-family parts).
//!
//! The FTFA speaks a staged-command protocol: the caller loads an opcode and
//! operands into the FCCOB registers, launches the command by writing the
//! CCIF flag back to FSTAT, and busy-waits for CCIF to read as set again.
//! Error conditions latch into FSTAT and must be cleared (write-one-to-clear)
//! before the next launch.
//!
//! The driver is written against the [`FtfaRegisters`] trait rather than a
//! fixed register block, so the same command engine can be driven against a
//! simulated controller on the host. On hardware, [`RegisterBlock`] is the
//! implementation: a `repr(C)` overlay the caller places at the controller's
//! base address.
//!
//! See the [`Ftfa`] type for the command API.

#![cfg_attr(target_os = "none", no_std)]

use vcell::VolatileCell;

/// FSTAT flag bits.
pub mod fstat {
    /// Command complete interrupt flag. Reads as 1 when the controller is
    /// idle; written as 1 to launch a staged command.
    pub const CCIF: u8 = 0x80;
    /// Read collision error (write 1 to clear).
    pub const RDCOLLERR: u8 = 0x40;
    /// Access error: malformed command or illegal address (write 1 to
    /// clear).
    pub const ACCERR: u8 = 0x20;
    /// Flash protection violation (write 1 to clear).
    pub const FPVIOL: u8 = 0x10;
    /// Margin check / command completion status fault.
    pub const MGSTAT0: u8 = 0x01;
}

/// FCNFG flag bits. The driver leaves FCNFG alone, but the bit layout is
/// part of the silicon contract and hosts inspect it through the debug port.
pub mod fcnfg {
    pub const CCIE: u8 = 0x80;
    pub const RDCOLLIE: u8 = 0x40;
    pub const ERSAREQ: u8 = 0x20;
    pub const ERSSUSP: u8 = 0x10;
    pub const SWAP: u8 = 0x08;
    pub const PFLSH: u8 = 0x04;
    pub const RAMRDY: u8 = 0x02;
    pub const EEERDY: u8 = 0x01;
}

/// Layout of the nonvolatile security configuration, and the FSEC field
/// encodings the security interlock interprets.
///
/// The masks are `u32` because the interlock inspects the whole flash word
/// holding FSEC; FSEC is the least significant byte of the word at
/// [`security::FSEC_WORD_ADDRESS`].
pub mod security {
    /// Start of the flash configuration field.
    pub const NV_SECURITY_ADDRESS: u32 = 0x0000_0400;
    /// Byte address of the FSEC register image within the configuration
    /// field.
    pub const FSEC_ADDRESS: u32 = NV_SECURITY_ADDRESS + 0x0C;
    /// Program-word-aligned address of the word containing FSEC.
    pub const FSEC_WORD_ADDRESS: u32 = FSEC_ADDRESS & !3;

    pub const FSEC_KEY_MASK: u32 = 0xC0;
    pub const FSEC_KEY_ENABLE: u32 = 0x80;
    pub const FSEC_KEY_DISABLE: u32 = 0xC0;
    /// Mass erase enable field.
    pub const FSEC_MEEN_MASK: u32 = 0x30;
    pub const FSEC_MEEN_ENABLE: u32 = 0x30;
    /// The one encoding that permanently disables mass erase. Programming
    /// this value bricks recovery; see [`is_permanently_secured`].
    pub const FSEC_MEEN_DISABLE: u32 = 0x20;
    pub const FSEC_FSLACC_MASK: u32 = 0x0C;
    pub const FSEC_SEC_MASK: u32 = 0x03;
    pub const FSEC_UNSEC: u32 = 0x02;
    pub const FSEC_SEC: u32 = 0x03;

    /// Checks whether `word`, if programmed at [`FSEC_WORD_ADDRESS`], would
    /// permanently disable mass erase and therefore any possibility of
    /// recovering a secured device.
    pub fn is_permanently_secured(word: u32) -> bool {
        word & FSEC_MEEN_MASK == FSEC_MEEN_DISABLE
    }
}

/// Commands understood by the FTFA. Values are the FCCOB0 opcodes from the
/// reference manual; only a subset is staged by this driver, but the full
/// table is silicon contract.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FlashCmd {
    Read1Section = 0x01,
    ProgramCheck = 0x02,
    ReadResource = 0x03,
    ProgramLongword = 0x06,
    EraseSector = 0x09,
    Read1AllBlocks = 0x40,
    ReadOnce = 0x41,
    ProgramOnce = 0x43,
    EraseAllBlocks = 0x44,
    VerifyBackdoorKey = 0x45,
}

/// Read margin level selector for check commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Margin {
    /// 'User' margin: the level a normal read uses, plus guard band.
    User = 0x01,
    /// 'Factory' margin: the tightest level, used during production test.
    Factory = 0x02,
}

/// Failure classifications the controller can report for a completed
/// command, in the order the driver checks them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashError {
    /// FSTAT.FPVIOL: the command touched a protected region.
    ProtectionViolation,
    /// FSTAT.ACCERR: the command or its operands were rejected.
    AccessError,
    /// FSTAT.MGSTAT0: the command ran but its result failed the margin
    /// check. For `ProgramCheck` this is how a mismatch is reported.
    MarginFault,
}

/// Register access seam between the command engine and the controller.
///
/// [`RegisterBlock`] implements this over real MMIO; test harnesses
/// implement it over a simulated controller.
pub trait FtfaRegisters {
    fn read_fstat(&self) -> u8;
    /// FSTAT writes are write-one-to-clear for the error flags and launch
    /// the staged command when [`fstat::CCIF`] is written.
    fn write_fstat(&mut self, bits: u8);
    fn write_fccob0_3(&mut self, value: u32);
    fn write_fccob4_7(&mut self, value: u32);
    fn write_fccob8_b(&mut self, value: u32);
    fn write_fprot(&mut self, value: u32);
    fn write_feprot(&mut self, value: u8);
    fn write_fdprot(&mut self, value: u8);
}

/// FTFA register file, overlaid at the controller base address.
#[repr(C)]
pub struct RegisterBlock {
    pub fstat: VolatileCell<u8>,
    pub fcnfg: VolatileCell<u8>,
    pub fsec: VolatileCell<u8>,
    pub fopt: VolatileCell<u8>,
    pub fccob0_3: VolatileCell<u32>,
    pub fccob4_7: VolatileCell<u32>,
    pub fccob8_b: VolatileCell<u32>,
    pub fprot0_3: VolatileCell<u32>,
    pub feprot: VolatileCell<u8>,
    pub fdprot: VolatileCell<u8>,
}

impl RegisterBlock {
    /// Overlays the register file at `base`.
    ///
    /// # Safety
    /// `base` must be the FTFA controller base address for the lifetime of
    /// the returned reference, and nothing else may be driving the
    /// controller.
    pub unsafe fn from_base(base: u32) -> &'static mut Self {
        &mut *(base as *mut Self)
    }
}

impl FtfaRegisters for RegisterBlock {
    fn read_fstat(&self) -> u8 {
        self.fstat.get()
    }
    fn write_fstat(&mut self, bits: u8) {
        self.fstat.set(bits);
    }
    fn write_fccob0_3(&mut self, value: u32) {
        self.fccob0_3.set(value);
    }
    fn write_fccob4_7(&mut self, value: u32) {
        self.fccob4_7.set(value);
    }
    fn write_fccob8_b(&mut self, value: u32) {
        self.fccob8_b.set(value);
    }
    fn write_fprot(&mut self, value: u32) {
        self.fprot0_3.set(value);
    }
    fn write_feprot(&mut self, value: u8) {
        self.feprot.set(value);
    }
    fn write_fdprot(&mut self, value: u8) {
        self.fdprot.set(value);
    }
}

/// Flash driver handle. Wraps a register view and provides one encapsulated
/// operation per hardware command the programming routine needs.
///
/// Every operation stages its FCCOB words and then runs the same
/// transaction: clear stale errors, launch, busy-poll CCIF, classify. The
/// busy-poll is deliberately unbounded -- this driver runs with interrupts
/// off and no scheduler, so there is nothing to yield to, and the host
/// supervising the routine applies its own timeout and reset.
pub struct Ftfa<'a, R: FtfaRegisters> {
    regs: &'a mut R,
}

impl<'a, R: FtfaRegisters> Ftfa<'a, R> {
    pub fn new(regs: &'a mut R) -> Self {
        Self { regs }
    }

    /// Removes write protection from all program flash, data flash, and
    /// EEPROM regions. Protection registers only loosen until reset, so
    /// this cannot fail.
    pub fn unprotect_all(&mut self) {
        self.regs.write_fprot(0xFFFF_FFFF);
        self.regs.write_feprot(0xFF);
        self.regs.write_fdprot(0xFF);
    }

    /// Erases every flash block on the device.
    pub fn erase_all_blocks(&mut self) -> Result<(), FlashError> {
        self.stage(FlashCmd::EraseAllBlocks, 0);
        self.execute()
    }

    /// Erases the sector containing `address`. `address` must be
    /// sector-aligned or the controller reports an access error.
    pub fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        self.stage(FlashCmd::EraseSector, address);
        self.execute()
    }

    /// Programs the longword at `address` (must be 4-aligned and already
    /// erased) with `word`.
    pub fn program_longword(
        &mut self,
        address: u32,
        word: u32,
    ) -> Result<(), FlashError> {
        self.stage(FlashCmd::ProgramLongword, address);
        self.regs.write_fccob4_7(word);
        self.execute()
    }

    /// Checks that the longword at `address` reads back as `expected` at
    /// the given margin level. A mismatch completes the command with
    /// [`FlashError::MarginFault`].
    pub fn program_check(
        &mut self,
        address: u32,
        expected: u32,
        margin: Margin,
    ) -> Result<(), FlashError> {
        self.stage(FlashCmd::ProgramCheck, address);
        self.regs.write_fccob4_7((margin as u32) << 24);
        self.regs.write_fccob8_b(expected);
        self.execute()
    }

    /// Loads FCCOB0-3 with the opcode and 24-bit command address.
    fn stage(&mut self, cmd: FlashCmd, address: u32) {
        self.regs.write_fccob0_3(((cmd as u32) << 24) | address);
    }

    /// Launches the staged command and waits synchronously for completion.
    fn execute(&mut self) -> Result<(), FlashError> {
        // Clear errors latched by a previous command; launching with either
        // flag set is itself an access error.
        self.regs.write_fstat(fstat::ACCERR | fstat::FPVIOL);

        // Launch.
        self.regs.write_fstat(fstat::CCIF);

        // Wait for command complete. A wedged controller hangs here until
        // the host's timeout fires.
        while self.regs.read_fstat() & fstat::CCIF == 0 {}

        let status = self.regs.read_fstat();
        if status & fstat::FPVIOL != 0 {
            return Err(FlashError::ProtectionViolation);
        }
        if status & fstat::ACCERR != 0 {
            return Err(FlashError::AccessError);
        }
        if status & fstat::MGSTAT0 != 0 {
            return Err(FlashError::MarginFault);
        }
        Ok(())
    }
}

/// Miscellaneous Control Module overlay; the routine only touches the
/// platform control register to defeat flash caching.
#[repr(C)]
pub struct Mcm {
    _reserved: [u32; 3],
    pub placr: VolatileCell<u32>,
}

/// MCM base address on MKL parts.
pub const MCM_BASE: u32 = 0xF000_3000;

/// PLACR bits.
pub mod placr {
    /// Clear flash controller cache.
    pub const CFCC: u32 = 1 << 10;
    /// Disable flash controller data caching.
    pub const DFCDA: u32 = 1 << 11;
    /// Disable flash controller cache.
    pub const DFCC: u32 = 1 << 13;
    /// Disable flash controller speculation.
    pub const DFCS: u32 = 1 << 15;
}

impl Mcm {
    /// Overlays the MCM at `base`.
    ///
    /// # Safety
    /// `base` must be the MCM base address for the lifetime of the
    /// returned reference.
    pub unsafe fn from_base(base: u32) -> &'static mut Self {
        &mut *(base as *mut Self)
    }

    /// Disables controller-side caching and speculation so that direct
    /// reads through the blank-check and verify paths observe true flash
    /// state rather than stale lines.
    pub fn disable_flash_cache(&mut self) {
        self.placr.set(placr::DFCC | placr::DFCS);
    }
}
