// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Plan the staging-region layout for image, firmware, and boot args.
// Author: Lukas Bower

//! Staging-region layout planner.
//!
//! Pure arithmetic: segments are laid out in the fixed order
//! image → firmware → boot-args, each starting on an `align` boundary.
//! A zero-length firmware blob keeps its segment (at zero size) so the
//! boot-args offset is always well defined.

/// Size reserved for the serialized boot-argument block.
pub const BOOTARGS_SIZE: u64 = 0x4000;

/// Default segment alignment (one 16 KiB page).
pub const DEFAULT_ALIGN: u64 = 0x4000;

/// One segment of the staging region, relative to its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Offset from the region base.
    pub offset: u64,
    /// Aligned segment length in bytes.
    pub len: u64,
}

/// Non-overlapping placement of the three staging segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Kernel image segment, always at offset 0.
    pub image: Segment,
    /// Firmware blob segment; zero-length when no firmware is staged.
    pub firmware: Segment,
    /// Boot-argument segment.
    pub bootargs: Segment,
    /// Total region size in bytes.
    pub total_size: u64,
}

/// Round `value` up to the next multiple of `align`.
#[must_use]
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Plan the staging region for an image of `image_len` bytes plus an
/// optional firmware blob of `firmware_len` bytes.
#[must_use]
pub fn plan(image_len: u64, firmware_len: u64, align: u64) -> Layout {
    let mut offset = 0;
    let image = Segment {
        offset,
        len: align_up(image_len, align),
    };
    offset += image.len;
    let firmware = Segment {
        offset,
        len: align_up(firmware_len, align),
    };
    offset += firmware.len;
    let bootargs = Segment {
        offset,
        len: align_up(BOOTARGS_SIZE, align),
    };
    offset += bootargs.len;
    Layout {
        image,
        firmware,
        bootargs,
        total_size: offset,
    }
}
