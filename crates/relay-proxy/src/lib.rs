// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Typed client for the relayboot debug-proxy command link.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Typed client for the debug-proxy command link to an ARM64 target.
//!
//! The proxy stub on the target accepts memory, register, cache, and
//! control-transfer commands over a host link. Wire framing belongs to the
//! transport backend; this crate defines the command vocabulary, the
//! [`ProxyPort`] seam a backend implements, and the [`Proxy`] layer that
//! gives each command a typed method and a uniform error taxonomy.

use core::fmt;

pub mod mock;

pub use mock::MockPort;

/// Commands understood by the on-target proxy stub.
///
/// Every command is a single blocking round-trip; the proxy never pipelines
/// and never retries. `Call` and `Reload` transfer control away from the
/// stub and are irreversible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Liveness probe. Also used after a handoff to confirm the link
    /// came back up.
    Noop,
    /// Allocate `size` bytes from the target-side heap.
    Malloc {
        /// Allocation size in bytes.
        size: u64,
    },
    /// Read `len` bytes of target memory at `addr`.
    ReadMem {
        /// Target address.
        addr: u64,
        /// Byte count.
        len: u64,
    },
    /// Write bytes verbatim into target memory.
    WriteMem {
        /// Target address.
        addr: u64,
        /// Bytes to write.
        bytes: Vec<u8>,
    },
    /// Write bytes into target memory, compressed on the wire. The
    /// transport owns the compression; the payload here is plain.
    CompressedWriteMem {
        /// Target address.
        addr: u64,
        /// Bytes to write.
        bytes: Vec<u8>,
    },
    /// Target-side copy of `len` bytes from `src` to `dest`.
    CopyMem {
        /// Destination address on the target.
        dest: u64,
        /// Source address on the target.
        src: u64,
        /// Byte count.
        len: u64,
    },
    /// Read a 64-bit implementation-defined register at `addr`.
    ReadReg {
        /// Register address.
        addr: u64,
    },
    /// Write a 64-bit implementation-defined register at `addr`.
    WriteReg {
        /// Register address.
        addr: u64,
        /// Value to write.
        value: u64,
    },
    /// Clean the data cache by virtual address over a range.
    CacheClean {
        /// Range base address.
        addr: u64,
        /// Range length in bytes.
        len: u64,
    },
    /// Invalidate the instruction cache over a range.
    CacheInvalidateIcache {
        /// Range base address.
        addr: u64,
        /// Range length in bytes.
        len: u64,
    },
    /// Tear down the MMU so physical addressing is in effect. Older proxy
    /// stubs do not implement this and answer `Unsupported`.
    MmuShutdown,
    /// Branch to `entry` with `args` in `x0..x3`. With `reboot` set the
    /// proxy tears itself down first and the target reboots into the new
    /// image as part of the call.
    Call {
        /// Entry address.
        entry: u64,
        /// Arguments passed in `x0..x3`.
        args: [u64; 4],
        /// Reboot the target as part of the call.
        reboot: bool,
    },
    /// Reinitialize the proxy execution context, then branch to `entry`
    /// with `args` in `x0..x3`. MMU state is left to the proxy.
    Reload {
        /// Entry address.
        entry: u64,
        /// Arguments passed in `x0..x3`.
        args: [u64; 4],
    },
    /// Query the base address where payload images are loaded.
    KernelBase,
    /// Query the address of the live boot-argument block.
    BootArgsAddr,
    /// Query the address and length of the flattened device tree.
    AdtBlob,
    /// Point the target at a replacement flattened device tree.
    PutAdtBlob {
        /// Address of the uploaded blob.
        addr: u64,
        /// Blob length in bytes.
        len: u64,
    },
}

impl Request {
    /// Short operation name used in logs and error messages.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Malloc { .. } => "malloc",
            Self::ReadMem { .. } => "readmem",
            Self::WriteMem { .. } => "writemem",
            Self::CompressedWriteMem { .. } => "compressed-writemem",
            Self::CopyMem { .. } => "copymem",
            Self::ReadReg { .. } => "readreg",
            Self::WriteReg { .. } => "writereg",
            Self::CacheClean { .. } => "cache-clean",
            Self::CacheInvalidateIcache { .. } => "icache-invalidate",
            Self::MmuShutdown => "mmu-shutdown",
            Self::Call { .. } => "call",
            Self::Reload { .. } => "reload",
            Self::KernelBase => "kernel-base",
            Self::BootArgsAddr => "bootargs-addr",
            Self::AdtBlob => "adt-blob",
            Self::PutAdtBlob { .. } => "put-adt-blob",
        }
    }
}

/// Replies produced by the on-target proxy stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Command completed with no payload.
    Done,
    /// Command produced a single address.
    Address(u64),
    /// Command produced a single 64-bit value.
    Value(u64),
    /// Command produced raw bytes.
    Bytes(Vec<u8>),
    /// Command produced an address/length pair.
    Region {
        /// Region base address.
        addr: u64,
        /// Region length in bytes.
        len: u64,
    },
    /// The target executed the command and reported failure.
    Failed(CommandStatus),
}

impl Response {
    fn label(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Address(_) => "address",
            Self::Value(_) => "value",
            Self::Bytes(_) => "bytes",
            Self::Region { .. } => "region",
            Self::Failed(_) => "failed",
        }
    }
}

/// Failure detail reported by the target for a command it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The command is not implemented by this proxy stub.
    Unsupported,
    /// An address argument was outside any mapped region.
    BadAddress,
    /// The command ran and failed.
    Error,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "command not supported"),
            Self::BadAddress => write!(f, "bad address"),
            Self::Error => write!(f, "command failed"),
        }
    }
}

/// Transport seam a proxy link backend implements.
///
/// A backend frames `Request` onto its wire, performs exactly one blocking
/// round-trip, and returns the decoded `Response`. Link-level timeouts and
/// retries are the backend's business; callers treat every error as fatal.
pub trait ProxyPort {
    /// Error type surfaced by the link backend.
    type Error: fmt::Display;

    /// Perform one command round-trip.
    fn execute(&mut self, request: Request) -> Result<Response, Self::Error>;
}

/// Errors surfaced by the typed proxy layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProxyError<E: fmt::Display> {
    /// The link backend failed before a reply arrived.
    #[error("{op}: link failure: {err}")]
    Port {
        /// Operation in flight.
        op: &'static str,
        /// Backend error detail.
        err: E,
    },
    /// The target received the command and reported failure.
    #[error("{op}: {status}")]
    Command {
        /// Operation that failed.
        op: &'static str,
        /// Failure detail from the target.
        status: CommandStatus,
    },
    /// The reply did not match the command.
    #[error("{op}: unexpected {got} response")]
    Unexpected {
        /// Operation in flight.
        op: &'static str,
        /// Label of the reply actually received.
        got: &'static str,
    },
}

impl<E: fmt::Display> ProxyError<E> {
    /// True when the target answered "command not supported".
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::Command {
                status: CommandStatus::Unsupported,
                ..
            }
        )
    }
}

/// Typed command layer over a [`ProxyPort`].
pub struct Proxy<P> {
    port: P,
}

impl<P> Proxy<P> {
    /// Wrap a link backend.
    pub fn new(port: P) -> Self {
        Self { port }
    }

    /// Consume the proxy and return the backend.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Borrow the backend.
    pub fn port(&self) -> &P {
        &self.port
    }
}

impl<P: ProxyPort> Proxy<P> {
    fn round_trip(&mut self, request: Request) -> Result<Response, ProxyError<P::Error>> {
        let op = request.op();
        log::trace!("proxy {op}");
        let response = self
            .port
            .execute(request)
            .map_err(|err| ProxyError::Port { op, err })?;
        if let Response::Failed(status) = response {
            return Err(ProxyError::Command { op, status });
        }
        Ok(response)
    }

    fn expect_done(&mut self, request: Request) -> Result<(), ProxyError<P::Error>> {
        let op = request.op();
        match self.round_trip(request)? {
            Response::Done => Ok(()),
            other => Err(ProxyError::Unexpected {
                op,
                got: other.label(),
            }),
        }
    }

    fn expect_address(&mut self, request: Request) -> Result<u64, ProxyError<P::Error>> {
        let op = request.op();
        match self.round_trip(request)? {
            Response::Address(addr) => Ok(addr),
            other => Err(ProxyError::Unexpected {
                op,
                got: other.label(),
            }),
        }
    }

    /// Liveness probe.
    pub fn noop(&mut self) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::Noop)
    }

    /// Allocate target-side memory and return its address.
    pub fn malloc(&mut self, size: u64) -> Result<u64, ProxyError<P::Error>> {
        self.expect_address(Request::Malloc { size })
    }

    /// Read target memory.
    pub fn read_mem(&mut self, addr: u64, len: u64) -> Result<Vec<u8>, ProxyError<P::Error>> {
        match self.round_trip(Request::ReadMem { addr, len })? {
            Response::Bytes(bytes) => Ok(bytes),
            other => Err(ProxyError::Unexpected {
                op: "readmem",
                got: other.label(),
            }),
        }
    }

    /// Write target memory verbatim.
    pub fn write_mem(&mut self, addr: u64, bytes: &[u8]) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::WriteMem {
            addr,
            bytes: bytes.to_vec(),
        })
    }

    /// Write target memory with wire compression.
    pub fn compressed_write_mem(
        &mut self,
        addr: u64,
        bytes: &[u8],
    ) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::CompressedWriteMem {
            addr,
            bytes: bytes.to_vec(),
        })
    }

    /// Target-side memory copy.
    pub fn copy_mem(&mut self, dest: u64, src: u64, len: u64) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::CopyMem { dest, src, len })
    }

    /// Read an implementation-defined 64-bit register.
    pub fn read_reg(&mut self, addr: u64) -> Result<u64, ProxyError<P::Error>> {
        match self.round_trip(Request::ReadReg { addr })? {
            Response::Value(value) => Ok(value),
            other => Err(ProxyError::Unexpected {
                op: "readreg",
                got: other.label(),
            }),
        }
    }

    /// Write an implementation-defined 64-bit register.
    pub fn write_reg(&mut self, addr: u64, value: u64) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::WriteReg { addr, value })
    }

    /// Clean the data cache over a range.
    pub fn cache_clean(&mut self, addr: u64, len: u64) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::CacheClean { addr, len })
    }

    /// Invalidate the instruction cache over a range.
    pub fn cache_invalidate_icache(
        &mut self,
        addr: u64,
        len: u64,
    ) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::CacheInvalidateIcache { addr, len })
    }

    /// Shut down the target MMU. Old proxy stubs answer `Unsupported`;
    /// callers on the direct-call path treat that reply as best-effort.
    pub fn mmu_shutdown(&mut self) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::MmuShutdown)
    }

    /// Branch to `entry` with `args` in `x0..x3`.
    pub fn call(
        &mut self,
        entry: u64,
        args: [u64; 4],
        reboot: bool,
    ) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::Call {
            entry,
            args,
            reboot,
        })
    }

    /// Reinitialize the proxy context, then branch to `entry`.
    pub fn reload(&mut self, entry: u64, args: [u64; 4]) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::Reload { entry, args })
    }

    /// Base address where payload images are loaded.
    pub fn kernel_base(&mut self) -> Result<u64, ProxyError<P::Error>> {
        self.expect_address(Request::KernelBase)
    }

    /// Address of the live boot-argument block.
    pub fn bootargs_addr(&mut self) -> Result<u64, ProxyError<P::Error>> {
        self.expect_address(Request::BootArgsAddr)
    }

    /// Address and length of the flattened device tree.
    pub fn adt_blob(&mut self) -> Result<(u64, u64), ProxyError<P::Error>> {
        match self.round_trip(Request::AdtBlob)? {
            Response::Region { addr, len } => Ok((addr, len)),
            other => Err(ProxyError::Unexpected {
                op: "adt-blob",
                got: other.label(),
            }),
        }
    }

    /// Point the target at a replacement flattened device tree.
    pub fn put_adt_blob(&mut self, addr: u64, len: u64) -> Result<(), ProxyError<P::Error>> {
        self.expect_done(Request::PutAdtBlob { addr, len })
    }
}
