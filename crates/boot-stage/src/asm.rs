// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Hand encoders for the few AArch64 instructions the stub needs.
// Author: Lukas Bower

//! Minimal AArch64 instruction encoders.
//!
//! The relocation stub needs eleven instruction forms; a full assembler is
//! an external collaborator, so these encode exactly those forms and
//! nothing else. Registers are plain numbers 0–30; branch offsets are in
//! words relative to the instruction itself.

/// `cbz xT, offset` — compare and branch if zero (64-bit).
#[must_use]
pub fn cbz(rt: u32, offset_words: i32) -> u32 {
    0xb400_0000 | imm19(offset_words) << 5 | rt
}

/// `ldp xT1, xT2, [xN], #imm` — load pair, post-indexed.
#[must_use]
pub fn ldp_post(rt1: u32, rt2: u32, rn: u32, imm_bytes: i32) -> u32 {
    0xa8c0_0000 | imm7(imm_bytes) << 15 | rt2 << 10 | rn << 5 | rt1
}

/// `stp xT1, xT2, [xN, #imm]` — store pair, signed offset.
#[must_use]
pub fn stp_offset(rt1: u32, rt2: u32, rn: u32, imm_bytes: i32) -> u32 {
    0xa900_0000 | imm7(imm_bytes) << 15 | rt2 << 10 | rn << 5 | rt1
}

/// `dc cvau, xT` — clean data cache by VA to point of unification.
#[must_use]
pub fn dc_cvau(rt: u32) -> u32 {
    0xd50b_7b20 | rt
}

/// `ic ivau, xT` — invalidate instruction cache by VA to point of
/// unification.
#[must_use]
pub fn ic_ivau(rt: u32) -> u32 {
    0xd50b_7520 | rt
}

/// `add xD, xN, #imm` — add immediate (64-bit).
#[must_use]
pub fn add_imm(rd: u32, rn: u32, imm: u32) -> u32 {
    debug_assert!(imm < 0x1000);
    0x9100_0000 | imm << 10 | rn << 5 | rd
}

/// `sub xD, xN, #imm` — subtract immediate (64-bit).
#[must_use]
pub fn sub_imm(rd: u32, rn: u32, imm: u32) -> u32 {
    debug_assert!(imm < 0x1000);
    0xd100_0000 | imm << 10 | rn << 5 | rd
}

/// `b offset` — unconditional branch.
#[must_use]
pub fn b(offset_words: i32) -> u32 {
    0x1400_0000 | (offset_words as u32 & 0x03ff_ffff)
}

/// `movz xD, #imm16, lsl #(16 * hw)`.
#[must_use]
pub fn movz(rd: u32, imm16: u16, hw: u32) -> u32 {
    debug_assert!(hw < 4);
    0xd280_0000 | hw << 21 | u32::from(imm16) << 5 | rd
}

/// `movk xD, #imm16, lsl #(16 * hw)`.
#[must_use]
pub fn movk(rd: u32, imm16: u16, hw: u32) -> u32 {
    debug_assert!(hw < 4);
    0xf280_0000 | hw << 21 | u32::from(imm16) << 5 | rd
}

/// `br xN` — branch to register.
#[must_use]
pub fn br(rn: u32) -> u32 {
    0xd61f_0000 | rn << 5
}

/// Materialize a 64-bit constant into `xD` with `movz` + three `movk`.
///
/// Always four words, so stub offsets stay fixed regardless of the value.
#[must_use]
pub fn mov_imm64(rd: u32, value: u64) -> [u32; 4] {
    [
        movz(rd, value as u16, 0),
        movk(rd, (value >> 16) as u16, 1),
        movk(rd, (value >> 32) as u16, 2),
        movk(rd, (value >> 48) as u16, 3),
    ]
}

fn imm19(offset_words: i32) -> u32 {
    offset_words as u32 & 0x7_ffff
}

fn imm7(imm_bytes: i32) -> u32 {
    debug_assert_eq!(imm_bytes % 8, 0);
    (imm_bytes / 8) as u32 & 0x7f
}

#[cfg(test)]
mod tests {
    use super::*;

    // Expected words cross-checked against reference assembler output.
    #[test]
    fn known_encodings() {
        assert_eq!(ldp_post(29, 30, 31, 16), 0xa8c1_7bfd); // ldp x29, x30, [sp], #16
        assert_eq!(stp_offset(0, 1, 31, 0), 0xa900_07e0); // stp x0, x1, [sp]
        assert_eq!(dc_cvau(0), 0xd50b_7b20);
        assert_eq!(ic_ivau(0), 0xd50b_7520);
        assert_eq!(add_imm(2, 2, 16), 0x9100_4042);
        assert_eq!(sub_imm(3, 3, 16), 0xd100_4063);
        assert_eq!(br(16), 0xd61f_0200);
        assert_eq!(movz(0, 0xffff, 0), 0xd29f_ffe0);
    }

    #[test]
    fn branch_offsets_are_masked_words() {
        assert_eq!(b(-7), 0x1400_0000 | 0x03ff_fff9);
        assert_eq!(cbz(3, 8), 0xb400_0000 | 8 << 5 | 3);
    }

    #[test]
    fn mov_imm64_spans_all_quarters() {
        let words = mov_imm64(16, 0x8042_0001_c000_3210);
        assert_eq!(words[0], movz(16, 0x3210, 0));
        assert_eq!(words[1], movk(16, 0xc000, 1));
        assert_eq!(words[2], movk(16, 0x0001, 2));
        assert_eq!(words[3], movk(16, 0x8042, 3));
    }
}
