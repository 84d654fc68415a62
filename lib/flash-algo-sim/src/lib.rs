// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register-level simulation of the FTFA flash controller, for exercising
//! the programming engine on the host.
//!
//! [`SimFtfa`] models the pieces of the controller the routine depends on:
//! the FCCOB staging registers, command launch via the CCIF write, the
//! write-one-to-clear error flags, and the erase/program/program-check
//! commands acting on a byte array that stands in for the flash. Programming
//! honors NOR semantics (bits only clear), so a program over unerased flash
//! fails the controller's internal verify the way real silicon does.
//!
//! Command completion is deliberately not instantaneous: `poll_latency`
//! controls how many FSTAT reads report busy before CCIF comes back, so
//! tests exercise the engine's busy-poll rather than a degenerate
//! single-read path.

use drv_kinetis_ftfa::{fstat, FtfaRegisters};
use flash_algo_core::Target;
use std::cell::Cell;

/// One launched command transaction, decoded from the FCCOB registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transaction {
    EraseAllBlocks,
    EraseSector { address: u32 },
    ProgramLongword { address: u32, word: u32 },
    ProgramCheck { address: u32, expected: u32, margin: u8 },
    Unknown { opcode: u8 },
}

pub struct SimFtfa {
    flash: Vec<u8>,
    sector_size: u32,
    /// Forces FPVIOL on erase/program commands, as if protection had not
    /// been lifted.
    pub write_protected: bool,
    /// Latched FSTAT error flags (ACCERR/FPVIOL/MGSTAT0).
    errors: u8,
    fccob: [u32; 3],
    /// FSTAT reads left to report busy for the in-flight command.
    busy: Cell<u32>,
    /// Busy polls each command takes to complete.
    pub poll_latency: u32,
    /// Every command launched, in order.
    pub transactions: Vec<Transaction>,
    /// Last values written to the protection registers, if any.
    pub fprot: Option<u32>,
    pub feprot: Option<u8>,
    pub fdprot: Option<u8>,
    pub cache_disabled: bool,
}

impl SimFtfa {
    /// 128 KiB of erased flash in 1 KiB sectors, matching an MKL25 part.
    pub fn new() -> Self {
        Self::with_size(128 * 1024, 1024)
    }

    pub fn with_size(flash_size: usize, sector_size: u32) -> Self {
        Self {
            flash: vec![0xFF; flash_size],
            sector_size,
            write_protected: false,
            errors: 0,
            fccob: [0; 3],
            busy: Cell::new(0),
            poll_latency: 3,
            transactions: Vec::new(),
            fprot: None,
            feprot: None,
            fdprot: None,
            cache_disabled: false,
        }
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Host-side backdoor for seeding flash content, bypassing the
    /// controller.
    pub fn load(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.flash[start..start + data.len()].copy_from_slice(data);
    }

    fn in_range(&self, address: u32, len: u32) -> bool {
        (address as usize)
            .checked_add(len as usize)
            .is_some_and(|end| end <= self.flash.len())
    }

    fn read_word(&self, address: u32) -> u32 {
        let i = address as usize;
        u32::from_le_bytes(self.flash[i..i + 4].try_into().unwrap())
    }

    fn launch(&mut self) {
        self.busy.set(self.poll_latency);
        // MGSTAT0 is read-only and reflects the most recent command; the
        // controller clears it itself on launch.
        self.errors &= !fstat::MGSTAT0;

        let opcode = (self.fccob[0] >> 24) as u8;
        let address = self.fccob[0] & 0x00FF_FFFF;
        match opcode {
            0x44 => {
                self.transactions.push(Transaction::EraseAllBlocks);
                if self.write_protected {
                    self.errors |= fstat::FPVIOL;
                    return;
                }
                self.flash.fill(0xFF);
            }
            0x09 => {
                self.transactions
                    .push(Transaction::EraseSector { address });
                if address % self.sector_size != 0
                    || !self.in_range(address, self.sector_size)
                {
                    self.errors |= fstat::ACCERR;
                    return;
                }
                if self.write_protected {
                    self.errors |= fstat::FPVIOL;
                    return;
                }
                let start = address as usize;
                self.flash[start..start + self.sector_size as usize]
                    .fill(0xFF);
            }
            0x06 => {
                let word = self.fccob[1];
                self.transactions
                    .push(Transaction::ProgramLongword { address, word });
                if address % 4 != 0 || !self.in_range(address, 4) {
                    self.errors |= fstat::ACCERR;
                    return;
                }
                if self.write_protected {
                    self.errors |= fstat::FPVIOL;
                    return;
                }
                // NOR programming can only clear bits. The controller's
                // back-to-back verify reports MGSTAT0 if the result does
                // not match the requested word.
                let stored = self.read_word(address) & word;
                let i = address as usize;
                self.flash[i..i + 4].copy_from_slice(&stored.to_le_bytes());
                if stored != word {
                    self.errors |= fstat::MGSTAT0;
                }
            }
            0x02 => {
                let margin = (self.fccob[1] >> 24) as u8;
                let expected = self.fccob[2];
                self.transactions.push(Transaction::ProgramCheck {
                    address,
                    expected,
                    margin,
                });
                if address % 4 != 0 || !self.in_range(address, 4) {
                    self.errors |= fstat::ACCERR;
                    return;
                }
                if self.read_word(address) != expected {
                    self.errors |= fstat::MGSTAT0;
                }
            }
            opcode => {
                self.transactions.push(Transaction::Unknown { opcode });
                self.errors |= fstat::ACCERR;
            }
        }
    }
}

impl Default for SimFtfa {
    fn default() -> Self {
        Self::new()
    }
}

impl FtfaRegisters for SimFtfa {
    fn read_fstat(&self) -> u8 {
        let busy = self.busy.get();
        if busy > 0 {
            self.busy.set(busy - 1);
            return self.errors;
        }
        self.errors | fstat::CCIF
    }

    fn write_fstat(&mut self, bits: u8) {
        // Write-one-to-clear for the error flags.
        self.errors &= !(bits & (fstat::ACCERR | fstat::FPVIOL));
        if bits & fstat::CCIF != 0 {
            self.launch();
        }
    }

    fn write_fccob0_3(&mut self, value: u32) {
        self.fccob[0] = value;
    }
    fn write_fccob4_7(&mut self, value: u32) {
        self.fccob[1] = value;
    }
    fn write_fccob8_b(&mut self, value: u32) {
        self.fccob[2] = value;
    }
    fn write_fprot(&mut self, value: u32) {
        self.fprot = Some(value);
        if value == 0xFFFF_FFFF {
            self.write_protected = false;
        }
    }
    fn write_feprot(&mut self, value: u8) {
        self.feprot = Some(value);
    }
    fn write_fdprot(&mut self, value: u8) {
        self.fdprot = Some(value);
    }
}

impl Target for SimFtfa {
    type Regs = Self;

    fn regs(&mut self) -> &mut Self {
        self
    }

    fn read_flash_word(&self, address: u32) -> u32 {
        self.read_word(address)
    }

    fn disable_flash_cache(&mut self) {
        self.cache_disabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_kinetis_ftfa::{Ftfa, Margin};

    #[test]
    fn commands_take_multiple_polls_to_complete() {
        let mut sim = SimFtfa::new();
        sim.poll_latency = 5;
        Ftfa::new(&mut sim).erase_sector(0x400).unwrap();
        // The driver returned, so the poll loop rode out the busy reads.
        assert_eq!(sim.transactions, vec![Transaction::EraseSector {
            address: 0x400
        }]);
    }

    #[test]
    fn programming_is_and_only() {
        let mut sim = SimFtfa::new();
        let mut ftfa = Ftfa::new(&mut sim);
        ftfa.program_longword(0x100, 0x1234_5678).unwrap();
        // Second program over the same word cannot set bits back.
        assert!(ftfa.program_longword(0x100, 0xFFFF_FFFF).is_err());
        assert_eq!(sim.read_flash_word(0x100), 0x1234_5678);
    }

    #[test]
    fn misaligned_sector_erase_is_an_access_error() {
        let mut sim = SimFtfa::new();
        let result = Ftfa::new(&mut sim).erase_sector(0x401);
        assert_eq!(result, Err(drv_kinetis_ftfa::FlashError::AccessError));
    }

    #[test]
    fn protection_violation_reports_fpviol() {
        let mut sim = SimFtfa::new();
        sim.write_protected = true;
        let result = Ftfa::new(&mut sim).program_longword(0x100, 0);
        assert_eq!(
            result,
            Err(drv_kinetis_ftfa::FlashError::ProtectionViolation)
        );
    }

    #[test]
    fn program_check_compares_stored_content() {
        let mut sim = SimFtfa::new();
        sim.load(0x200, &0xCAFE_F00Du32.to_le_bytes());
        let mut ftfa = Ftfa::new(&mut sim);
        ftfa.program_check(0x200, 0xCAFE_F00D, Margin::User).unwrap();
        assert!(ftfa.program_check(0x200, 0xCAFE_F00E, Margin::User).is_err());
        assert_eq!(
            sim.transactions[1],
            Transaction::ProgramCheck {
                address: 0x200,
                expected: 0xCAFE_F00E,
                margin: 0x01,
            }
        );
    }
}
