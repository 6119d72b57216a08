// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Synthesize the self-relocating copy-and-jump stub.
// Author: Lukas Bower

//! The relocation stub.
//!
//! A short routine placed at the tail of the staging region. Invoked with
//! `x0` = final boot-args address, `x1` = copy source, `x2` = copy
//! destination, `x3` = remaining byte count, it moves the staged bytes to
//! the kernel's true base 16 bytes at a time, cleans and invalidates the
//! caches for each unit so freshly written code is observable to
//! instruction fetch, then branches to the kernel entry with `x0` intact.
//!
//! The four arguments arrive in registers at call time, so the same code
//! works for any staging region without re-synthesis; only the entry
//! address is baked in. A zero byte count copies nothing and still takes
//! the final branch.

use crate::asm;

/// Bytes moved (and cache-maintained) per loop iteration.
pub const COPY_UNIT: u64 = 16;

/// Scratch register pair used by the copy loop.
const SCRATCH_LO: u32 = 4;
const SCRATCH_HI: u32 = 5;
/// Register holding the entry address for the final branch.
const ENTRY_REG: u32 = 16;

/// A synthesized relocation stub bound to one entry address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationStub {
    entry: u64,
    words: Vec<u32>,
}

impl RelocationStub {
    /// Synthesize the stub for a kernel entry address.
    #[must_use]
    pub fn synthesize(entry: u64) -> Self {
        let mut words = Vec::with_capacity(13);
        // loop: while x3 != 0, move one unit and maintain caches.
        words.push(asm::cbz(3, 8));
        words.push(asm::ldp_post(SCRATCH_LO, SCRATCH_HI, 1, COPY_UNIT as i32));
        words.push(asm::stp_offset(SCRATCH_LO, SCRATCH_HI, 2, 0));
        words.push(asm::dc_cvau(2));
        words.push(asm::ic_ivau(2));
        words.push(asm::add_imm(2, 2, COPY_UNIT as u32));
        words.push(asm::sub_imm(3, 3, COPY_UNIT as u32));
        words.push(asm::b(-7));
        // done: x0 still carries the boot-args address.
        words.extend_from_slice(&asm::mov_imm64(ENTRY_REG, entry));
        words.push(asm::br(ENTRY_REG));
        Self { entry, words }
    }

    /// Entry address the stub branches to.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Instruction words.
    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Little-endian code bytes ready to write to the target.
    #[must_use]
    pub fn code(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect()
    }

    /// Code size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        (self.words.len() * 4) as u64
    }

    /// True when the stub has no instructions (never, in practice).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_is_thirteen_words() {
        let stub = RelocationStub::synthesize(0x8_0300_0800);
        assert_eq!(stub.words().len(), 13);
        assert_eq!(stub.len(), 52);
        assert_eq!(stub.code().len(), 52);
    }

    #[test]
    fn empty_count_skips_straight_to_branch() {
        let stub = RelocationStub::synthesize(0x8_0300_0800);
        // First word tests x3 against zero and, when taken, lands on the
        // entry-address sequence that ends in `br`.
        assert_eq!(stub.words()[0], asm::cbz(3, 8));
        assert_eq!(stub.words()[8], asm::movz(16, 0x0800, 0));
        assert_eq!(stub.words()[12], asm::br(16));
    }

    #[test]
    fn loop_maintains_caches_per_unit() {
        let stub = RelocationStub::synthesize(0);
        assert_eq!(stub.words()[3], asm::dc_cvau(2));
        assert_eq!(stub.words()[4], asm::ic_ivau(2));
        assert_eq!(stub.words()[7], asm::b(-7));
    }

    #[test]
    fn only_entry_differs_between_stubs() {
        let a = RelocationStub::synthesize(0x1000);
        let b = RelocationStub::synthesize(0x2000);
        assert_eq!(a.words()[..8], b.words()[..8]);
        assert_eq!(a.words()[12], b.words()[12]);
        assert_ne!(a.words()[8], b.words()[8]);
    }
}
