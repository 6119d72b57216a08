// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Boot-argument record, builder rules, and fixed-layout codec.
// Author: Lukas Bower

//! The boot-argument block handed to the incoming kernel.
//!
//! The record has a fixed little-endian layout the kernel's early boot code
//! expects. The builder never mutates the live template in place: callers
//! fetch a copy, [`apply_boot_policy`] derives the new record, and the
//! result is serialized into the staging region's boot-args segment.

use core::fmt;

/// Fixed size of the command-line field.
pub const CMDLINE_SIZE: usize = 608;

/// Size of the serialized record.
pub const ENCODED_SIZE: usize = 0x2e0;

/// Virtual-base correction for the alternate kernel address-space variant:
/// `0xfffffff007004000 - 0xfffffe0007004000`.
pub const ALTERNATE_VIRT_SLIDE: u64 = 0x1F0_0000_0000;

/// Errors surfaced by the boot-argument codec and builder.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BootArgsError {
    /// The template blob is shorter than [`ENCODED_SIZE`].
    #[error("boot-argument block truncated: {0} bytes")]
    Truncated(usize),
    /// The command line exceeds the fixed field size.
    #[error("command line is {0} bytes, limit is {}", CMDLINE_SIZE - 1)]
    CmdlineTooLong(usize),
}

/// Video configuration carried inside the boot arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoArgs {
    /// Framebuffer base address.
    pub base: u64,
    /// Display flag: 0 enables the console display, 1 suppresses it.
    pub display: u64,
    /// Bytes per framebuffer row.
    pub stride: u64,
    /// Width in pixels.
    pub width: u64,
    /// Height in pixels.
    pub height: u64,
    /// Bits per pixel.
    pub depth: u64,
}

/// The boot-argument record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootArgs {
    /// Record revision.
    pub revision: u16,
    /// Record version.
    pub version: u16,
    /// Kernel virtual base address.
    pub virt_base: u64,
    /// Physical load base address.
    pub phys_base: u64,
    /// Usable memory size.
    pub mem_size: u64,
    /// First address past everything the loader wrote.
    pub top_of_kernel_data: u64,
    /// Video configuration.
    pub video: VideoArgs,
    /// Platform machine type.
    pub machine_type: u32,
    /// Device-tree virtual address.
    pub devtree: u64,
    /// Device-tree size in bytes.
    pub devtree_size: u32,
    /// Kernel command line.
    pub cmdline: String,
    /// Boot flags.
    pub boot_flags: u64,
    /// Actual physical memory size.
    pub mem_size_actual: u64,
}

impl BootArgs {
    /// Serialize to the fixed layout.
    pub fn encode(&self) -> Result<Vec<u8>, BootArgsError> {
        if self.cmdline.len() >= CMDLINE_SIZE {
            return Err(BootArgsError::CmdlineTooLong(self.cmdline.len()));
        }
        let mut out = vec![0u8; ENCODED_SIZE];
        out[0x00..0x02].copy_from_slice(&self.revision.to_le_bytes());
        out[0x02..0x04].copy_from_slice(&self.version.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.virt_base.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.phys_base.to_le_bytes());
        out[0x18..0x20].copy_from_slice(&self.mem_size.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&self.top_of_kernel_data.to_le_bytes());
        out[0x28..0x30].copy_from_slice(&self.video.base.to_le_bytes());
        out[0x30..0x38].copy_from_slice(&self.video.display.to_le_bytes());
        out[0x38..0x40].copy_from_slice(&self.video.stride.to_le_bytes());
        out[0x40..0x48].copy_from_slice(&self.video.width.to_le_bytes());
        out[0x48..0x50].copy_from_slice(&self.video.height.to_le_bytes());
        out[0x50..0x58].copy_from_slice(&self.video.depth.to_le_bytes());
        out[0x58..0x5c].copy_from_slice(&self.machine_type.to_le_bytes());
        out[0x60..0x68].copy_from_slice(&self.devtree.to_le_bytes());
        out[0x68..0x6c].copy_from_slice(&self.devtree_size.to_le_bytes());
        out[0x6c..0x6c + self.cmdline.len()].copy_from_slice(self.cmdline.as_bytes());
        out[0x2d0..0x2d8].copy_from_slice(&self.boot_flags.to_le_bytes());
        out[0x2d8..0x2e0].copy_from_slice(&self.mem_size_actual.to_le_bytes());
        Ok(out)
    }

    /// Decode a record from the fixed layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, BootArgsError> {
        if bytes.len() < ENCODED_SIZE {
            return Err(BootArgsError::Truncated(bytes.len()));
        }
        let cmdline_field = &bytes[0x6c..0x6c + CMDLINE_SIZE];
        let cmdline_len = cmdline_field
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(CMDLINE_SIZE);
        Ok(Self {
            revision: le_u16(&bytes[0x00..0x02]),
            version: le_u16(&bytes[0x02..0x04]),
            virt_base: le_u64(&bytes[0x08..0x10]),
            phys_base: le_u64(&bytes[0x10..0x18]),
            mem_size: le_u64(&bytes[0x18..0x20]),
            top_of_kernel_data: le_u64(&bytes[0x20..0x28]),
            video: VideoArgs {
                base: le_u64(&bytes[0x28..0x30]),
                display: le_u64(&bytes[0x30..0x38]),
                stride: le_u64(&bytes[0x38..0x40]),
                width: le_u64(&bytes[0x40..0x48]),
                height: le_u64(&bytes[0x48..0x50]),
                depth: le_u64(&bytes[0x50..0x58]),
            },
            machine_type: le_u32(&bytes[0x58..0x5c]),
            devtree: le_u64(&bytes[0x60..0x68]),
            devtree_size: le_u32(&bytes[0x68..0x6c]),
            cmdline: String::from_utf8_lossy(&cmdline_field[..cmdline_len]).into_owned(),
            boot_flags: le_u64(&bytes[0x2d0..0x2d8]),
            mem_size_actual: le_u64(&bytes[0x2d8..0x2e0]),
        })
    }
}

/// Virtual-base correction applied by [`apply_boot_policy`].
///
/// The alternate kernel variant maps its virtual address space
/// [`ALTERNATE_VIRT_SLIDE`] higher. Applying the slide to the wrong variant
/// silently corrupts addressing, so the choice is an explicit input rather
/// than a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtSlide {
    /// Shift `virt_base` and `devtree` up for the alternate variant.
    Alternate,
    /// Leave the template's virtual addresses alone.
    None,
}

impl fmt::Display for VirtSlide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alternate => write!(f, "alternate"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Derive the boot arguments for a staged image from the live template.
///
/// `region_top` is `region_base + total_size`, the first address past
/// everything the loader wrote. With `firmware_relocated` the top of kernel
/// data lands exactly there; otherwise unlocated firmware may still sit in
/// higher memory, so the field only ever moves up.
pub fn apply_boot_policy(
    template: &BootArgs,
    region_top: u64,
    firmware_relocated: bool,
    tokens: &[String],
    slide: VirtSlide,
) -> BootArgs {
    let mut args = template.clone();
    args.top_of_kernel_data = if firmware_relocated {
        region_top
    } else {
        args.top_of_kernel_data.max(region_top)
    };
    if !tokens.is_empty() {
        let cmdline = tokens.join(" ");
        args.video.display = if tokens.iter().any(|token| token == "-v") {
            0
        } else {
            1
        };
        log::info!("setting boot arguments to {cmdline:?}");
        args.cmdline = cmdline;
    }
    if slide == VirtSlide::Alternate {
        args.virt_base = args.virt_base.wrapping_add(ALTERNATE_VIRT_SLIDE);
        args.devtree = args.devtree.wrapping_add(ALTERNATE_VIRT_SLIDE);
    }
    args
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}
