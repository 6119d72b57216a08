// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Guest-session shell, hypervisor seam, and batch script runner.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Guest-session tooling over the debug-proxy link.
//!
//! The hypervisor engine proper lives elsewhere; this crate stages the guest
//! payload, ramdisk, and trust cache into target memory, then drives the
//! session through scripts, one-shot commands, and an interactive shell.
//! Script and command errors never abort the batch: each failure is logged
//! in full and forces the session into shell mode instead of starting the
//! guest unattended.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use boot_stage::TargetContext;
use relay_proxy::ProxyPort;

/// Fixed trust-cache blob header: one cache, payload at offset 8.
pub const TRUSTCACHE_HEADER: [u8; 8] = [0x01, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00];

/// Prefix a raw trust cache with the header the guest loader expects.
#[must_use]
pub fn trustcache_blob(cache: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(TRUSTCACHE_HEADER.len() + cache.len());
    blob.extend_from_slice(&TRUSTCACHE_HEADER);
    blob.extend_from_slice(cache);
    blob
}

/// Hypervisor engine seam.
///
/// The shell drives a guest session through this trait; the emulation behind
/// [`Hypervisor::start`] belongs to the engine, not to this crate.
pub trait Hypervisor {
    /// Probe the engine and prepare a fresh session.
    fn init(&mut self) -> Result<()>;

    /// Replace the guest's kernel command line.
    fn set_boot_args(&mut self, text: &str) -> Result<()>;

    /// Stage a ramdisk image.
    fn set_ramdisk(&mut self, bytes: &[u8]) -> Result<()>;

    /// Stage a raw trust cache (header applied by the engine).
    fn set_trustcache(&mut self, cache: &[u8]) -> Result<()>;

    /// Stage the guest payload and optional symbol blob.
    fn load_payload(&mut self, image: &[u8], symbols: Option<&[u8]>) -> Result<()>;

    /// Run the guest. Does not return until the session ends.
    fn start(&mut self) -> Result<()>;

    /// Read guest memory.
    fn peek(&mut self, addr: u64, len: u64) -> Result<Vec<u8>>;

    /// Session variables exposed to the shell's `vars` command.
    fn vars(&self) -> Vec<(String, String)>;
}

#[derive(Debug, Clone, Copy)]
struct StagedBlob {
    addr: u64,
    len: u64,
}

/// Hypervisor session staged over the debug-proxy link.
///
/// Blobs land in proxy-heap allocations; the engine behind the link picks
/// them up from the addresses reported by [`Hypervisor::vars`].
pub struct LinkHv<P: ProxyPort> {
    ctx: TargetContext<P>,
    boot_args: String,
    payload: Option<StagedBlob>,
    symbols: Option<StagedBlob>,
    ramdisk: Option<StagedBlob>,
    trustcache: Option<StagedBlob>,
}

impl<P: ProxyPort> LinkHv<P> {
    /// Wrap a bootstrapped target context.
    pub fn new(ctx: TargetContext<P>) -> Self {
        Self {
            ctx,
            boot_args: String::new(),
            payload: None,
            symbols: None,
            ramdisk: None,
            trustcache: None,
        }
    }

    /// Consume the session and return the link backend.
    pub fn into_port(self) -> P {
        self.ctx.into_port()
    }
}

impl<P: ProxyPort> LinkHv<P>
where
    P::Error: fmt::Debug + Send + Sync + 'static,
{
    fn stage(&mut self, what: &str, bytes: &[u8]) -> Result<StagedBlob> {
        let len = bytes.len() as u64;
        let addr = self
            .ctx
            .malloc(len.max(1))
            .with_context(|| format!("allocate {what} region"))?;
        self.ctx
            .upload_image(addr, bytes)
            .with_context(|| format!("upload {what}"))?;
        log::info!("staged {what} at {addr:#x} ({len:#x} bytes)");
        Ok(StagedBlob { addr, len })
    }
}

impl<P: ProxyPort> Hypervisor for LinkHv<P>
where
    P::Error: fmt::Debug + Send + Sync + 'static,
{
    fn init(&mut self) -> Result<()> {
        self.ctx.proxy().noop().context("probe proxy link")?;
        log::debug!("guest session ready, kernel base {:#x}", self.ctx.kernel_base());
        Ok(())
    }

    fn set_boot_args(&mut self, text: &str) -> Result<()> {
        log::info!("guest boot arguments: {text:?}");
        self.boot_args = text.to_owned();
        Ok(())
    }

    fn set_ramdisk(&mut self, bytes: &[u8]) -> Result<()> {
        self.ramdisk = Some(self.stage("ramdisk", bytes)?);
        Ok(())
    }

    fn set_trustcache(&mut self, cache: &[u8]) -> Result<()> {
        self.trustcache = Some(self.stage("trust cache", &trustcache_blob(cache))?);
        Ok(())
    }

    fn load_payload(&mut self, image: &[u8], symbols: Option<&[u8]>) -> Result<()> {
        self.payload = Some(self.stage("payload", image)?);
        if let Some(symbols) = symbols {
            self.symbols = Some(self.stage("symbols", symbols)?);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let Some(payload) = self.payload else {
            bail!("no payload loaded");
        };
        log::info!("starting guest at {:#x}", payload.addr);
        self.ctx
            .proxy()
            .call(payload.addr, [0, 0, 0, 0], false)
            .context("start guest")?;
        Ok(())
    }

    fn peek(&mut self, addr: u64, len: u64) -> Result<Vec<u8>> {
        Ok(self.ctx.proxy().read_mem(addr, len)?)
    }

    fn vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("kernel-base".to_owned(), format!("{:#x}", self.ctx.kernel_base())),
            ("boot-args".to_owned(), format!("{:?}", self.boot_args)),
        ];
        for (name, blob) in [
            ("payload", self.payload),
            ("symbols", self.symbols),
            ("ramdisk", self.ramdisk),
            ("trustcache", self.trustcache),
        ] {
            if let Some(blob) = blob {
                vars.push((
                    name.to_owned(),
                    format!("{:#x} ({:#x} bytes)", blob.addr, blob.len),
                ));
            }
        }
        vars
    }
}

/// Result of executing a single shell command.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// Continue reading commands.
    Continue,
    /// Exit the shell loop.
    Quit,
}

/// Shell driver parsing guest-session commands and invoking the hypervisor.
pub struct Shell<H: Hypervisor, W: Write> {
    hv: H,
    writer: W,
}

impl<H: Hypervisor, W: Write> Shell<H, W> {
    /// Create a new shell given a hypervisor session and output writer.
    pub fn new(hv: H, writer: W) -> Self {
        Self { hv, writer }
    }

    /// Write a line directly to the shell output.
    pub fn write_line(&mut self, message: &str) -> Result<()> {
        writeln!(self.writer, "{message}")?;
        Ok(())
    }

    /// Execute commands from a buffered reader until EOF or `quit`.
    pub fn run_script<R: BufRead>(&mut self, reader: R) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if self.execute(trimmed)? == CommandStatus::Quit {
                break;
            }
        }
        Ok(())
    }

    /// Run an interactive REPL against stdin.
    pub fn repl(&mut self) -> Result<()> {
        let stdin = io::stdin();
        let mut reader = stdin.lock();
        let mut line = String::new();
        loop {
            write!(self.writer, "guest> ")?;
            self.writer.flush()?;
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                writeln!(self.writer)?;
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match self.execute(trimmed) {
                Ok(CommandStatus::Quit) => break,
                Ok(CommandStatus::Continue) => {}
                Err(err) => writeln!(self.writer, "error: {err:#}")?,
            }
        }
        Ok(())
    }

    /// Execute a single command line. Surrounding whitespace is ignored.
    pub fn execute(&mut self, line: &str) -> Result<CommandStatus> {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(CommandStatus::Continue);
        };
        match cmd {
            "help" => {
                writeln!(
                    self.writer,
                    "Available commands: help, vars, bootargs <text>, peek <addr> <len>, start, quit"
                )?;
                Ok(CommandStatus::Continue)
            }
            "vars" => {
                for (name, value) in self.hv.vars() {
                    writeln!(self.writer, "{name} = {value}")?;
                }
                Ok(CommandStatus::Continue)
            }
            "bootargs" => {
                let rest = line["bootargs".len()..].trim();
                self.hv.set_boot_args(rest)?;
                Ok(CommandStatus::Continue)
            }
            "peek" => {
                let addr = parse_number(parts.next().ok_or_else(|| anyhow!("peek requires an address"))?)?;
                let len = parse_number(parts.next().ok_or_else(|| anyhow!("peek requires a length"))?)?;
                let bytes = self.hv.peek(addr, len)?;
                for chunk in bytes.chunks(16) {
                    let rendered: Vec<String> =
                        chunk.iter().map(|byte| format!("{byte:02x}")).collect();
                    writeln!(self.writer, "{}", rendered.join(" "))?;
                }
                Ok(CommandStatus::Continue)
            }
            "start" => {
                self.hv.start()?;
                Ok(CommandStatus::Continue)
            }
            "quit" => {
                writeln!(self.writer, "closing session")?;
                Ok(CommandStatus::Quit)
            }
            unknown => Err(anyhow!("unknown command '{unknown}'")),
        }
    }

    /// Consume the shell and return the owned session and writer.
    pub fn into_parts(self) -> (H, W) {
        (self.hv, self.writer)
    }
}

/// Parse a decimal or 0x-prefixed hexadecimal number.
pub fn parse_number(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|err| anyhow!("invalid number '{value}': {err}"))
}

/// Run startup scripts and one-shot commands with catch-log-escalate.
///
/// Every failure is logged with its full context chain and flips the
/// escalation flag; the batch always runs to the end. A failure inside a
/// script abandons the rest of that script only.
pub fn run_batch<H: Hypervisor, W: Write>(
    shell: &mut Shell<H, W>,
    scripts: &[PathBuf],
    commands: &[String],
) -> bool {
    let mut escalate = false;
    for script in scripts {
        if let Err(err) = run_script_file(shell, script) {
            log::error!("script {}: {err:?}", script.display());
            escalate = true;
        }
    }
    for command in commands {
        if let Err(err) = shell.execute(command) {
            log::error!("command {command:?}: {err:?}");
            escalate = true;
        }
    }
    escalate
}

fn run_script_file<H: Hypervisor, W: Write>(
    shell: &mut Shell<H, W>,
    path: &Path,
) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open script {}", path.display()))?;
    shell.run_script(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trustcache_blob_is_header_then_payload() {
        let blob = trustcache_blob(&[0xAA, 0xBB]);
        assert_eq!(&blob[..8], &TRUSTCACHE_HEADER);
        assert_eq!(&blob[8..], &[0xAA, 0xBB]);
    }

    #[test]
    fn parse_number_handles_both_radices() {
        assert_eq!(parse_number("4096").unwrap(), 4096);
        assert_eq!(parse_number("0x1000").unwrap(), 0x1000);
        assert!(parse_number("0xzz").is_err());
    }
}
