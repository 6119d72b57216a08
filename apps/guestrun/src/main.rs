// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for running a guest payload under the hypervisor.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the guest-session runner.

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::LevelFilter;

use boot_stage::target::DEFAULT_HEAP_SIZE;
use boot_stage::TargetContext;
use guestrun::{parse_number, run_batch, Hypervisor, LinkHv, Shell};
use relay_proxy::MockPort;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TransportKind {
    Mock,
}

/// Guest-session runner command-line arguments.
#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Run a guest payload under the hypervisor", long_about = None)]
struct Cli {
    /// Symbol blob handed to the engine alongside the payload.
    #[arg(short = 's', long, value_name = "FILE")]
    symbols: Option<PathBuf>,

    /// Startup script of shell commands; repeatable, run in order.
    #[arg(short = 'm', long = "script", value_name = "FILE")]
    scripts: Vec<PathBuf>,

    /// One-shot shell command; repeatable, run after the scripts.
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    commands: Vec<String>,

    /// Drop into the interactive shell instead of starting the guest.
    #[arg(short = 'S', long)]
    shell: bool,

    /// Ramdisk image staged for the guest.
    #[arg(long, value_name = "FILE")]
    ramdisk: Option<PathBuf>,

    /// Raw trust cache staged for the guest (header applied on upload).
    #[arg(long, value_name = "FILE")]
    trustcache: Option<PathBuf>,

    /// Proxy-heap reservation in bytes, decimal or 0x-hex.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_HEAP_SIZE, value_parser = parse_heap_size)]
    heap_size: u64,

    /// Select the link backend.
    #[arg(long, value_enum, default_value_t = TransportKind::Mock)]
    transport: TransportKind,

    /// Enable debug logging.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,

    /// Guest payload image file.
    payload: PathBuf,

    /// Guest kernel command-line tokens.
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

fn parse_heap_size(value: &str) -> Result<u64, String> {
    parse_number(value).map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let image = fs::read(&cli.payload)
        .with_context(|| format!("read payload {}", cli.payload.display()))?;
    let symbols = cli
        .symbols
        .as_ref()
        .map(|path| fs::read(path).with_context(|| format!("read symbols {}", path.display())))
        .transpose()?;
    let ramdisk = cli
        .ramdisk
        .as_ref()
        .map(|path| fs::read(path).with_context(|| format!("read ramdisk {}", path.display())))
        .transpose()?;
    let trustcache = cli
        .trustcache
        .as_ref()
        .map(|path| fs::read(path).with_context(|| format!("read trust cache {}", path.display())))
        .transpose()?;

    match cli.transport {
        TransportKind::Mock => {
            let ctx = TargetContext::bootstrap(MockPort::new(), cli.heap_size)
                .context("bring up proxy link")?;
            run_session(LinkHv::new(ctx), &cli, &image, symbols.as_deref(), ramdisk, trustcache)
        }
    }
}

fn run_session<H: Hypervisor>(
    mut hv: H,
    cli: &Cli,
    image: &[u8],
    symbols: Option<&[u8]>,
    ramdisk: Option<Vec<u8>>,
    trustcache: Option<Vec<u8>>,
) -> Result<()> {
    hv.init().context("initialize guest session")?;
    if !cli.boot_args.is_empty() {
        hv.set_boot_args(&cli.boot_args.join(" "))?;
    }
    if let Some(ramdisk) = ramdisk {
        hv.set_ramdisk(&ramdisk)?;
    }
    if let Some(cache) = trustcache {
        hv.set_trustcache(&cache)?;
    }
    hv.load_payload(image, symbols)?;

    let stdout = io::stdout();
    let mut shell = Shell::new(hv, stdout.lock());
    let escalate = run_batch(&mut shell, &cli.scripts, &cli.commands);

    if escalate || cli.shell {
        shell.write_line("entering guest shell; 'help' lists commands, 'quit' exits")?;
        shell.repl()
    } else {
        let (mut hv, _writer) = shell.into_parts();
        hv.start()
    }
}
