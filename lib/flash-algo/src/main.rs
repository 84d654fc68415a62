// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash programming routine injected into MKL target RAM.
//!
//! A debug host loads this image, fills in a `FlashDescriptor`, points the
//! image header at it, and starts the core. We run the command engine over
//! the requested actions and then park at a breakpoint; the host reads the
//! descriptor back for the result. There is no runtime here -- no
//! interrupts, no console, nothing else executing -- so every ending
//! (success, command failure, even a stray exception) funnels into
//! [`halt`], and the breakpoint is the only way out.

#![no_std]
#![no_main]

use core::cell::UnsafeCell;
use core::panic::PanicInfo;
use cortex_m_rt::{entry, exception, ExceptionFrame};
use drv_kinetis_ftfa::{Mcm, RegisterBlock, MCM_BASE};
use flash_algo_abi::{Actions, Capabilities, FlashDescriptor, ResultCode};
use flash_algo_core::{report, Engine, Operation, Target};

/// COP watchdog control; a zero write disables it until reset. The write
/// must happen before the engine runs, since nothing here services a
/// watchdog.
const SIM_COPC: *mut u32 = 0x4004_8100 as *mut u32;
const COP_DISABLE: u32 = 0;

extern "C" {
    /// Start of the loaded image; defined in memory.x.
    static __load_address: u32;
    /// cortex-m-rt's reset handler; the host starts the core here.
    fn Reset() -> !;
}

/// In-memory twin of `flash_algo_abi::ProgramHeader`, with the pointers as
/// pointers so the link-time fields resolve by relocation. Identical layout
/// on the 32-bit target.
#[repr(C)]
pub struct Header {
    load_address: *const u32,
    entry: unsafe extern "C" fn() -> !,
    capabilities: u32,
    reserved: [u32; 2],
    /// Written by the host before each run; null until then.
    descriptor: *mut FlashDescriptor,
}

pub struct HeaderWrapper {
    header: UnsafeCell<Header>,
}

// Single-threaded target, and the host only writes the descriptor pointer
// while the core is halted.
unsafe impl Sync for HeaderWrapper {}

impl HeaderWrapper {
    /// # Safety
    /// Caller must be the only software running; the descriptor, if
    /// non-null, must point at a live `FlashDescriptor` in RAM.
    unsafe fn descriptor(&self) -> Option<&'static mut FlashDescriptor> {
        let descriptor = (*self.header.get()).descriptor;
        if descriptor.is_null() {
            None
        } else {
            Some(&mut *descriptor)
        }
    }
}

const CAPABILITIES: Capabilities = Capabilities::ERASE_BLOCK
    .union(Capabilities::ERASE_RANGE)
    .union(Capabilities::BLANK_CHECK_RANGE)
    .union(Capabilities::PROGRAM_RANGE)
    .union(Capabilities::VERIFY_RANGE)
    .union(Capabilities::PARTITION_FLEXNVM);

/// The load-time header. The linker script places this section at the
/// very front of the image, ahead of the vector table, so the host finds
/// it at the load address to discover the entry point and hand over the
/// descriptor.
#[no_mangle]
#[used]
#[link_section = ".flash_algo_header"]
pub static HEADER: HeaderWrapper = HeaderWrapper {
    header: UnsafeCell::new(Header {
        load_address: unsafe { &__load_address },
        entry: Reset,
        capabilities: CAPABILITIES.bits(),
        reserved: [0; 2],
        descriptor: core::ptr::null_mut(),
    }),
};

/// The machine as the engine sees it: the FTFA register file named by the
/// descriptor, direct bus reads of flash, and the MCM cache knob.
struct HwTarget {
    regs: &'static mut RegisterBlock,
    mcm: &'static mut Mcm,
}

impl Target for HwTarget {
    type Regs = RegisterBlock;

    fn regs(&mut self) -> &mut RegisterBlock {
        self.regs
    }

    fn read_flash_word(&self, address: u32) -> u32 {
        // Volatile: flash content changes under us as commands execute,
        // and init has already defeated controller-side caching.
        unsafe { (address as *const u32).read_volatile() }
    }

    fn disable_flash_cache(&mut self) {
        self.mcm.disable_flash_cache();
    }
}

#[entry]
fn main() -> ! {
    // Disable the watchdog before anything slow happens.
    unsafe { SIM_COPC.write_volatile(COP_DISABLE) };

    // Safety: the host owns the descriptor layout; we are the only code
    // running.
    let Some(descriptor) = (unsafe { HEADER.descriptor() }) else {
        // Started without work. Nowhere to report, so just park.
        breakpoint();
    };

    let mut target = HwTarget {
        // Safety: the descriptor names the controller's fixed base
        // address, valid for the whole run.
        regs: unsafe { RegisterBlock::from_base(descriptor.controller) },
        mcm: unsafe { Mcm::from_base(MCM_BASE) },
    };

    let actions = descriptor.actions();
    let payload = if actions
        .intersects(Actions::PROGRAM_RANGE | Actions::VERIFY_RANGE)
    {
        // Safety: the host guarantees data_address names data_size
        // readable bytes whenever program/verify is requested.
        unsafe {
            core::slice::from_raw_parts(
                descriptor.data_address as *const u8,
                descriptor.data_size as usize,
            )
        }
    } else {
        &[]
    };

    let mut op = Operation {
        actions,
        sector_size: u32::from(descriptor.sector_size),
        address: descriptor.address,
        data_size: descriptor.data_size,
        payload,
    };

    let result = match Engine::new(&mut target).run(&mut op) {
        Ok(()) => ResultCode::Ok,
        Err(fault) => fault.result_code(),
    };
    halt(descriptor, op.actions, result);
}

/// Records the outcome in the descriptor and parks. The only exit.
fn halt(
    descriptor: &mut FlashDescriptor,
    actions: Actions,
    result: ResultCode,
) -> ! {
    report(descriptor, actions, result);
    breakpoint();
}

/// Any unexpected exception ends the run with a trap classification, so a
/// wild pointer in the descriptor shows up as `Trap` instead of a silent
/// hang.
fn trap() -> ! {
    if let Some(descriptor) = (unsafe { HEADER.descriptor() }) {
        let actions = descriptor.actions();
        report(descriptor, actions, ResultCode::Trap);
    }
    breakpoint();
}

fn breakpoint() -> ! {
    loop {
        cortex_m::asm::bkpt();
    }
}

#[exception]
unsafe fn HardFault(_frame: &ExceptionFrame) -> ! {
    trap();
}

#[exception]
unsafe fn DefaultHandler(_irqn: i16) -> ! {
    trap();
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    trap();
}
