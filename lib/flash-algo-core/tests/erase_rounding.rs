// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property tests for the range operations over arbitrary geometries.

use flash_algo_abi::Actions;
use flash_algo_core::{Engine, Fault, Operation};
use flash_algo_sim::{SimFtfa, Transaction};
use proptest::prelude::*;

const FLASH_SIZE: u32 = 0x2_0000;

proptest! {
    /// Erase-range issues exactly one sector-erase per sector of the span
    /// `[address, address + len - 1]` rounded outward to sector
    /// boundaries, in ascending address order, for any power-of-two sector
    /// size and any (mis)alignment.
    #[test]
    fn erase_range_covers_exactly_the_rounded_span(
        sector_shift in 8u32..=12,
        address in 0..FLASH_SIZE,
        len in 1u32..0x4000,
    ) {
        prop_assume!(address + len <= FLASH_SIZE);
        let sector_size = 1u32 << sector_shift;
        let mut sim = SimFtfa::with_size(FLASH_SIZE as usize, sector_size);
        let mut op = Operation {
            actions: Actions::ERASE_RANGE,
            sector_size,
            address,
            data_size: len,
            payload: &[],
        };
        Engine::new(&mut sim).run(&mut op).unwrap();
        prop_assert_eq!(op.actions, Actions::empty());

        let mask = sector_size - 1;
        let first = address & !mask;
        let last = (address + len - 1) | mask;
        let expected: Vec<Transaction> = (first..=last)
            .step_by(sector_size as usize)
            .map(|address| Transaction::EraseSector { address })
            .collect();
        prop_assert_eq!(
            expected.len() as u32,
            (last - first + 1) / sector_size
        );
        prop_assert_eq!(sim.transactions, expected);
    }

    /// Blank check accepts any fully erased region and pinpoints the word
    /// containing a single programmed byte anywhere in the region.
    #[test]
    fn blank_check_finds_any_single_blemish(
        address in (0..FLASH_SIZE / 2).prop_map(|a| a & !3),
        len in 4u32..0x1000,
        blemish_offset in 0u32..0x1000,
        blemish in 0u8..0xFF,
    ) {
        prop_assume!(address + len <= FLASH_SIZE);
        prop_assume!(blemish_offset < len);

        // Erased region: passes.
        let mut sim = SimFtfa::new();
        let mut op = Operation {
            actions: Actions::BLANK_CHECK_RANGE,
            sector_size: 1024,
            address,
            data_size: len,
            payload: &[],
        };
        Engine::new(&mut sim).run(&mut op).unwrap();
        prop_assert_eq!(op.actions, Actions::empty());

        // One non-FF byte: fails with the address of its enclosing word,
        // leaving the bit set.
        let mut sim = SimFtfa::new();
        sim.load(address + blemish_offset, &[blemish]);
        let mut op = Operation {
            actions: Actions::BLANK_CHECK_RANGE,
            sector_size: 1024,
            address,
            data_size: len,
            payload: &[],
        };
        let result = Engine::new(&mut sim).run(&mut op);
        prop_assert_eq!(
            result,
            Err(Fault::NotBlank {
                address: (address + blemish_offset) & !3
            })
        );
        prop_assert_eq!(op.actions, Actions::BLANK_CHECK_RANGE);
    }
}
