// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Seam for the external payload-image reader.
// Author: Lukas Bower

//! Payload image seam.
//!
//! Mach-O container parsing lives in an external reader; the boot flow only
//! needs a flattened image plus the virtual-address facts required to
//! rebase the entry point. [`FlatPayload`] covers raw pre-flattened images
//! (test payloads, already-extracted kernels); a Mach-O reader implements
//! [`BootPayload`] out of tree.

/// Image facts the relocation flow needs from a payload reader.
pub trait BootPayload {
    /// The flattened image bytes, laid out for loading at one base.
    fn flat_image(&self) -> &[u8];

    /// Load-time virtual entry address.
    fn entry(&self) -> u64;

    /// Preferred minimum virtual address of the image.
    fn virt_min(&self) -> u64;

    /// Absolute entry address once the image is rebased to `base`.
    fn rebased_entry(&self, base: u64) -> u64 {
        self.entry().wrapping_sub(self.virt_min()).wrapping_add(base)
    }
}

/// A raw, pre-flattened payload.
#[derive(Debug, Clone)]
pub struct FlatPayload {
    image: Vec<u8>,
    entry_offset: u64,
}

impl FlatPayload {
    /// Wrap raw image bytes whose entry point sits `entry_offset` bytes in.
    #[must_use]
    pub fn new(image: Vec<u8>, entry_offset: u64) -> Self {
        Self {
            image,
            entry_offset,
        }
    }
}

impl BootPayload for FlatPayload {
    fn flat_image(&self) -> &[u8] {
        &self.image
    }

    fn entry(&self) -> u64 {
        self.entry_offset
    }

    fn virt_min(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_payload_rebases_from_zero() {
        let payload = FlatPayload::new(vec![0u8; 64], 0x800);
        assert_eq!(payload.rebased_entry(0x8_0300_0000), 0x8_0300_0800);
    }

    struct HighImage;

    impl BootPayload for HighImage {
        fn flat_image(&self) -> &[u8] {
            &[]
        }

        fn entry(&self) -> u64 {
            0xffff_fe00_0000_1000
        }

        fn virt_min(&self) -> u64 {
            0xffff_fe00_0000_0000
        }
    }

    #[test]
    fn rebased_entry_subtracts_virt_min() {
        assert_eq!(HighImage.rebased_entry(0x8_0300_0000), 0x8_0300_1000);
    }
}
