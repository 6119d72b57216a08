// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for chainloading a kernel over the debug-proxy link.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for chainloading a second-stage kernel image.

use std::fs;
use std::path::PathBuf;

use adt_model::Adt;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::LevelFilter;

use boot_stage::bootargs::BootArgs;
use boot_stage::target::DEFAULT_HEAP_SIZE;
use boot_stage::{
    chainload, ChainloadOptions, FlatPayload, HandoffMode, TargetContext, VirtSlide,
};
use relay_proxy::MockPort;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TransportKind {
    Mock,
}

/// Chainload command-line arguments.
#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Relocate and boot a kernel image", long_about = None)]
struct Cli {
    /// Full operating-system bring-up: stage firmware, patch the device
    /// tree, arm secondary cores.
    #[arg(short = 'x', long)]
    xnu: bool,

    /// Hand off with a direct rebooting call instead of a proxy reload.
    #[arg(short = 'c', long)]
    call: bool,

    /// Leave the template's virtual addresses alone (skip the alternate
    /// address-space correction).
    #[arg(long)]
    no_virt_slide: bool,

    /// Entry-point offset into the payload image, decimal or 0x-hex.
    #[arg(long, value_name = "OFFSET", default_value = "0", value_parser = parse_u64)]
    entry_offset: u64,

    /// Select the link backend.
    #[arg(long, value_enum, default_value_t = TransportKind::Mock)]
    transport: TransportKind,

    /// Enable debug logging.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,

    /// Payload image file.
    payload: PathBuf,

    /// Kernel command-line tokens.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    boot_args: Vec<String>,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn parse_u64(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| format!("invalid number '{value}': {err}"))
}

/// A mock target seeded well enough for both boot paths to run offline.
fn build_mock_port() -> Result<MockPort> {
    let mut port = MockPort::new();
    let template = BootArgs {
        revision: 2,
        version: 2,
        virt_base: 0xffff_fe00_0700_4000,
        phys_base: relay_proxy::mock::MOCK_KERNEL_BASE,
        mem_size: 0x2_0000_0000,
        mem_size_actual: 0x2_0000_0000,
        ..BootArgs::default()
    };
    port.seed_bootargs(&template.encode().context("encode mock template")?);

    let mut adt = Adt::new();
    let map = adt.root_mut().add_child("chosen").add_child("memory-map");
    map.set_reg_tuple("SEPFW", (0, 0));
    map.set_reg_tuple("BootArgs", (relay_proxy::mock::MOCK_BOOTARGS_ADDR, 0x4000));
    let cpus = adt.root_mut().add_child("cpus");
    for i in 0..2u64 {
        cpus.add_child(&format!("cpu{i}"))
            .set_reg_tuple("cpu-impl-reg", (0x2_1005_0000 + i * 8, 8));
    }
    port.seed_adt(&adt.encode());
    Ok(port)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let image = fs::read(&cli.payload)
        .with_context(|| format!("read payload {}", cli.payload.display()))?;
    let payload = FlatPayload::new(image, cli.entry_offset);

    let options = ChainloadOptions {
        xnu: cli.xnu,
        mode: if cli.call {
            HandoffMode::Call { reboot: true }
        } else {
            HandoffMode::Reload
        },
        boot_args: cli.boot_args.clone(),
        virt_slide: if cli.no_virt_slide {
            VirtSlide::None
        } else {
            VirtSlide::Alternate
        },
        ..ChainloadOptions::default()
    };

    let report = match cli.transport {
        TransportKind::Mock => {
            let port = build_mock_port()?;
            let mut ctx =
                TargetContext::bootstrap(port, DEFAULT_HEAP_SIZE).context("bring up proxy link")?;
            chainload(&mut ctx, &payload, &options).context("chainload")?
        }
    };

    println!("staging region: {:#x}", report.region_base);
    println!(
        "  image    +{:#x} ({:#x} bytes)",
        report.layout.image.offset, report.layout.image.len
    );
    println!(
        "  firmware +{:#x} ({:#x} bytes)",
        report.layout.firmware.offset, report.layout.firmware.len
    );
    println!(
        "  bootargs +{:#x} ({:#x} bytes)",
        report.layout.bootargs.offset, report.layout.bootargs.len
    );
    println!("stub: {:#x}", report.stub_addr);
    println!("entry: {:#x}", report.entry);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_u64_accepts_both_radices() {
        assert_eq!(parse_u64("2048").unwrap(), 2048);
        assert_eq!(parse_u64("0x800").unwrap(), 0x800);
        assert!(parse_u64("800h").is_err());
    }

    #[test]
    fn payload_file_boots_through_the_mock() {
        use std::io::Write as _;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xA5; 0x40]).unwrap();
        let image = fs::read(file.path()).unwrap();
        let payload = FlatPayload::new(image, 0x10);

        let port = build_mock_port().unwrap();
        let mut ctx = TargetContext::bootstrap(port, DEFAULT_HEAP_SIZE).unwrap();
        let report = chainload(&mut ctx, &payload, &ChainloadOptions::default()).unwrap();
        assert_eq!(report.entry, relay_proxy::mock::MOCK_KERNEL_BASE + 0x10);
        assert_eq!(ctx.into_port().mem_at(report.region_base, 4), vec![0xA5; 4]);
    }

    #[test]
    fn mock_target_supports_the_full_os_path() {
        let port = build_mock_port().unwrap();
        let mut ctx = TargetContext::bootstrap(port, DEFAULT_HEAP_SIZE).unwrap();
        let payload = FlatPayload::new(vec![0u8; 0x100], 0);
        let options = ChainloadOptions {
            xnu: true,
            ..ChainloadOptions::default()
        };
        let report = chainload(&mut ctx, &payload, &options).unwrap();
        assert_eq!(report.entry, relay_proxy::mock::MOCK_KERNEL_BASE);
        assert!(ctx.into_port().committed_adt().is_some());
    }
}
