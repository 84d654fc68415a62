// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash-operation command engine.
//!
//! This crate turns a host-supplied request set (erase block, erase range,
//! blank-check range, program range, verify range) into the ordered
//! sequence of FTFA command transactions that carries it out. It contains
//! no policy of its own: which operations run, over which addresses, with
//! which payload, is entirely the caller's descriptor; what the engine owns
//! is the execution order, the sector rounding, the security interlock, and
//! the failure classification.
//!
//! The engine is written against the [`Target`] trait so the same code runs
//! over memory-mapped hardware in the injected routine and over a simulated
//! controller in host tests. It is fully synchronous: the only suspension
//! anywhere is the command busy-poll inside the driver.
//!
//! Failure handling is all-or-nothing. The first fault aborts the run with
//! its classification; partially completed work is left in place, and the
//! still-set request bits tell the host what never finished.

#![cfg_attr(target_os = "none", no_std)]

use drv_kinetis_ftfa::{security, FlashError, Ftfa, FtfaRegisters, Margin};
use flash_algo_abi::{Actions, FlashDescriptor, ResultCode};

/// What the engine needs from the machine it runs on: the controller's
/// registers, direct (memory-bus) reads of flash, and the cache-control
/// knob used at init.
///
/// Direct reads are separate from the register view because blank check
/// does not go through the command interface at all -- it reads the flash
/// as ordinary memory, which is why init must defeat controller-side
/// caching first.
pub trait Target {
    type Regs: FtfaRegisters;

    fn regs(&mut self) -> &mut Self::Regs;

    /// Reads the 32-bit word at `address` over the memory bus.
    fn read_flash_word(&self, address: u32) -> u32;

    /// Disables controller-side caching/speculation so later direct reads
    /// observe true flash state.
    fn disable_flash_cache(&mut self);
}

/// A resolved, borrow-checked view of one descriptor's worth of work.
///
/// The injected routine builds this from the raw [`FlashDescriptor`]; host
/// tests build it directly. `actions` is consumed in place: the engine
/// clears each bit as its action completes, and never sets one, so after a
/// run (successful or not) the remaining bits are exactly the unfinished
/// work.
pub struct Operation<'a> {
    pub actions: Actions,
    /// Erase granularity in bytes. Must be a power of two.
    pub sector_size: u32,
    /// Start of the byte range. Need not be sector-aligned; erase rounds
    /// outward to sector boundaries.
    pub address: u32,
    /// Length of the byte range in bytes.
    pub data_size: u32,
    /// Program/verify payload, `data_size` bytes, little-endian words.
    /// Empty when neither program nor verify is requested.
    pub payload: &'a [u8],
}

/// Engine failure classification. Exactly one fault ends a run; there is no
/// retry or rollback anywhere.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fault {
    /// The controller reported a command failure.
    Command(FlashError),
    /// Refused to program a security word that would permanently disable
    /// mass erase. Detected before the word reaches the controller.
    IllegalSecurity,
    /// Blank check found a word that is not erased.
    NotBlank { address: u32 },
}

impl From<FlashError> for Fault {
    fn from(e: FlashError) -> Self {
        Fault::Command(e)
    }
}

impl Fault {
    /// The host-visible classification for this fault.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Fault::Command(FlashError::ProtectionViolation) => {
                ResultCode::ProtectionViolation
            }
            Fault::Command(FlashError::AccessError) => ResultCode::AccessError,
            Fault::Command(FlashError::MarginFault) => ResultCode::MarginFault,
            Fault::IllegalSecurity => ResultCode::IllegalSecurity,
            Fault::NotBlank { .. } => ResultCode::EraseFailed,
        }
    }
}

/// Writes the final result into the descriptor and marks it complete.
///
/// This is the only place the engine's outcome leaves the routine: the host
/// polls for [`Actions::COMPLETE`] and then reads `error_code` and the
/// residual action bits. Called exactly once per run, success or failure.
pub fn report(
    descriptor: &mut FlashDescriptor,
    actions: Actions,
    result: ResultCode,
) {
    descriptor.flags = (actions | Actions::COMPLETE).bits();
    descriptor.error_code = result.into();
}

/// The command engine. Holds the target for the duration of one run.
pub struct Engine<'a, T: Target> {
    target: &'a mut T,
}

impl<'a, T: Target> Engine<'a, T> {
    pub fn new(target: &'a mut T) -> Self {
        Self { target }
    }

    /// Performs every requested action in fixed priority order: init,
    /// erase block, erase range, blank check, program, verify. Request
    /// bits outside that set (FlexNVM partitioning, timing loop) are not
    /// supported by FTFA parts and are left untouched.
    ///
    /// Each step is a no-op when its bit is clear, so the same descriptor
    /// layout drives any subset of actions.
    pub fn run(&mut self, op: &mut Operation<'_>) -> Result<(), Fault> {
        self.init(op);
        self.erase_block(op)?;
        self.erase_range(op)?;
        self.blank_check_range(op)?;
        self.program_range(op)?;
        self.verify_range(op)?;
        Ok(())
    }

    /// Lifts all write protection and defeats flash caching. Cannot fail;
    /// clears its bit unconditionally.
    fn init(&mut self, op: &mut Operation<'_>) {
        if !op.actions.contains(Actions::INIT) {
            return;
        }
        Ftfa::new(self.target.regs()).unprotect_all();
        self.target.disable_flash_cache();
        op.actions.remove(Actions::INIT);
    }

    /// Mass erase: one command, no address operand.
    fn erase_block(&mut self, op: &mut Operation<'_>) -> Result<(), Fault> {
        if !op.actions.contains(Actions::ERASE_BLOCK) {
            return Ok(());
        }
        Ftfa::new(self.target.regs()).erase_all_blocks()?;
        op.actions.remove(Actions::ERASE_BLOCK);
        Ok(())
    }

    /// Erases every sector overlapping `[address, address + data_size)`.
    ///
    /// The span is rounded outward to sector boundaries, so bytes outside
    /// the nominal range but inside its first or last sector are erased
    /// too; that is inherent to sector granularity, not an error. An empty
    /// range erases nothing but still counts as done.
    fn erase_range(&mut self, op: &mut Operation<'_>) -> Result<(), Fault> {
        if !op.actions.contains(Actions::ERASE_RANGE) {
            return Ok(());
        }
        if op.data_size != 0 {
            let mask = op.sector_size - 1;
            // Round start down and the inclusive end up to sector
            // boundaries.
            let mut address = op.address & !mask;
            let end = (op.address + op.data_size - 1) | mask;

            let mut ftfa = Ftfa::new(self.target.regs());
            while address <= end {
                ftfa.erase_sector(address)?;
                address = match address.checked_add(op.sector_size) {
                    Some(next) => next,
                    None => break,
                };
            }
        }
        op.actions.remove(Actions::ERASE_RANGE);
        Ok(())
    }

    /// Confirms the range reads as erased (all ones), one direct 32-bit
    /// read per word, `ceil(data_size / 4)` words. Aborts on the first
    /// mismatch with no partial-result accumulation.
    fn blank_check_range(
        &mut self,
        op: &mut Operation<'_>,
    ) -> Result<(), Fault> {
        if !op.actions.contains(Actions::BLANK_CHECK_RANGE) {
            return Ok(());
        }
        let words = op.data_size.div_ceil(4);
        for i in 0..words {
            let address = op.address + 4 * i;
            if self.target.read_flash_word(address) != 0xFFFF_FFFF {
                return Err(Fault::NotBlank { address });
            }
        }
        op.actions.remove(Actions::BLANK_CHECK_RANGE);
        Ok(())
    }

    /// Programs `data_size / 4` longwords from the payload. A length that
    /// is not a multiple of four silently drops the remainder bytes; the
    /// host is expected to pad.
    ///
    /// Each word destined for the security configuration word is screened
    /// first: a value whose MEEN field reads "disable" would permanently
    /// remove the ability to mass-erase the device, so it is rejected
    /// before any command is staged for it.
    fn program_range(&mut self, op: &mut Operation<'_>) -> Result<(), Fault> {
        if !op.actions.contains(Actions::PROGRAM_RANGE) {
            return Ok(());
        }
        let words = (op.data_size / 4) as usize;
        let mut address = op.address;
        let mut ftfa = Ftfa::new(self.target.regs());
        for chunk in op.payload.chunks_exact(4).take(words) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            if address == security::FSEC_WORD_ADDRESS
                && security::is_permanently_secured(word)
            {
                return Err(Fault::IllegalSecurity);
            }
            ftfa.program_longword(address, word)?;
            address += 4;
        }
        op.actions.remove(Actions::PROGRAM_RANGE);
        Ok(())
    }

    /// Verifies `data_size / 4` longwords against the payload using the
    /// controller's program-check command at user margin. A mismatch
    /// surfaces as the command's margin fault.
    fn verify_range(&mut self, op: &mut Operation<'_>) -> Result<(), Fault> {
        if !op.actions.contains(Actions::VERIFY_RANGE) {
            return Ok(());
        }
        let words = (op.data_size / 4) as usize;
        let mut address = op.address;
        let mut ftfa = Ftfa::new(self.target.regs());
        for chunk in op.payload.chunks_exact(4).take(words) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            ftfa.program_check(address, word, Margin::User)?;
            address += 4;
        }
        op.actions.remove(Actions::VERIFY_RANGE);
        Ok(())
    }
}
