// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Boot image relocation, patching, and handoff over the debug-proxy link.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Relocation and handoff of a second-stage kernel image.
//!
//! The flow is strictly top-to-bottom: [`layout`] plans a staging region,
//! [`patch`] rewrites device-tree references and arms secondary cores,
//! [`bootargs`] derives and serializes the boot-argument block, [`stub`]
//! synthesizes the self-relocating copy-and-jump routine, and [`handoff`]
//! transfers control through one of two mutually exclusive proxy
//! mechanisms. [`chainload`] strings the stages together.

pub mod asm;
pub mod bootargs;
pub mod chainload;
pub mod handoff;
pub mod layout;
pub mod patch;
pub mod payload;
pub mod stub;
pub mod target;

pub use bootargs::{BootArgs, VirtSlide};
pub use chainload::{chainload, ChainloadError, ChainloadOptions, ChainloadReport};
pub use handoff::{HandoffMode, StubArgs};
pub use layout::{plan, Layout, Segment, BOOTARGS_SIZE, DEFAULT_ALIGN};
pub use payload::{BootPayload, FlatPayload};
pub use stub::RelocationStub;
pub use target::TargetContext;
