// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Orchestrate the relocation and handoff sequence.
// Author: Lukas Bower

//! The chainload sequence.
//!
//! Planner → patcher → boot-argument builder → stub synthesizer → handoff
//! executor, in that order, against a single exclusively-owned staging
//! region. The full-OS path (`xnu`) additionally stages the SEP firmware,
//! patches the device tree, and arms secondary cores; the bare-payload
//! path reserves the boot-args segment but leaves firmware at `(0, 0)`.

use core::fmt;

use adt_model::AdtError;
use relay_proxy::{ProxyError, ProxyPort};

use crate::bootargs::{apply_boot_policy, BootArgsError, VirtSlide};
use crate::handoff::{self, HandoffMode, StubArgs};
use crate::layout::{plan, Layout, DEFAULT_ALIGN};
use crate::patch::{self, MEMORY_MAP_PATH};
use crate::payload::BootPayload;
use crate::stub::RelocationStub;
use crate::target::TargetContext;

/// Errors surfaced by the chainload sequence.
#[derive(Debug, thiserror::Error)]
pub enum ChainloadError<E: fmt::Display> {
    /// A proxy round-trip failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError<E>),
    /// Device-tree lookup or decoding failed.
    #[error("device tree: {0}")]
    Adt(#[from] AdtError),
    /// Boot-argument encoding or decoding failed.
    #[error("boot arguments: {0}")]
    BootArgs(#[from] BootArgsError),
}

/// Caller choices for one boot attempt.
#[derive(Debug, Clone)]
pub struct ChainloadOptions {
    /// Full operating-system bring-up: stage firmware, patch the device
    /// tree, arm secondary cores.
    pub xnu: bool,
    /// Handoff mechanism.
    pub mode: HandoffMode,
    /// Kernel command-line tokens; empty keeps the template's line.
    pub boot_args: Vec<String>,
    /// Virtual-base correction variant.
    pub virt_slide: VirtSlide,
    /// Segment alignment.
    pub align: u64,
}

impl Default for ChainloadOptions {
    fn default() -> Self {
        Self {
            xnu: false,
            mode: HandoffMode::Reload,
            boot_args: Vec::new(),
            virt_slide: VirtSlide::Alternate,
            align: DEFAULT_ALIGN,
        }
    }
}

/// What the sequence did, for operator output.
#[derive(Debug, Clone, Copy)]
pub struct ChainloadReport {
    /// Staging region base address.
    pub region_base: u64,
    /// Planned layout inside the region.
    pub layout: Layout,
    /// Address of the relocation stub.
    pub stub_addr: u64,
    /// Absolute kernel entry address after relocation.
    pub entry: u64,
}

/// Relocate `payload` onto the target and hand control to it.
pub fn chainload<P: ProxyPort>(
    ctx: &mut TargetContext<P>,
    payload: &dyn BootPayload,
    options: &ChainloadOptions,
) -> Result<ChainloadReport, ChainloadError<P::Error>> {
    let image = payload.flat_image();
    let kernel_base = ctx.kernel_base();
    let entry = payload.rebased_entry(kernel_base);

    let mut adt = if options.xnu {
        Some(ctx.fetch_adt()?)
    } else {
        None
    };
    let (sepfw_src, sepfw_len) = match &adt {
        Some(adt) => adt.require(MEMORY_MAP_PATH)?.reg_tuple("SEPFW")?,
        None => (0, 0),
    };

    let layout = plan(image.len() as u64, sepfw_len, options.align);
    let stub = RelocationStub::synthesize(entry);
    log::info!("total region size: {:#x} bytes", layout.total_size);
    // The stub occupies the tail of the region, past the boot-args
    // segment the planner accounted for.
    let region = ctx.malloc(layout.total_size + stub.len())?;
    let stub_addr = region + layout.total_size;

    log::info!("loading kernel image ({:#x} bytes) to {region:#x}", image.len());
    ctx.upload_image(region, image)?;

    if let Some(adt) = adt.as_mut() {
        log::info!("staging SEPFW ({sepfw_len:#x} bytes)");
        ctx.proxy()
            .copy_mem(region + layout.firmware.offset, sepfw_src, sepfw_len)?;
        patch::patch_for_kernel(
            adt,
            ctx.proxy(),
            &layout,
            region,
            kernel_base + layout.firmware.offset,
            sepfw_len,
            entry,
        )?;
    }

    log::info!("setting up boot arguments");
    let template = ctx.bootargs_template()?;
    let args = apply_boot_policy(
        &template,
        kernel_base + layout.total_size,
        options.xnu,
        &options.boot_args,
        options.virt_slide,
    );
    ctx.proxy()
        .write_mem(region + layout.bootargs.offset, &args.encode()?)?;

    log::info!("copying stub, entry point {entry:#x}");
    ctx.stage_stub(stub_addr, &stub)?;

    let stub_args = StubArgs::for_relocation(&layout, region, kernel_base);
    handoff::execute(ctx.proxy(), stub_addr, stub_args, options.mode)?;

    Ok(ChainloadReport {
        region_base: region,
        layout,
        stub_addr,
        entry,
    })
}
