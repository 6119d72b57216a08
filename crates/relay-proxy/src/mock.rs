// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Deterministic in-memory proxy target for tests and offline runs.
// Author: Lukas Bower

//! Deterministic simulation of a proxy target.
//!
//! `MockPort` models just enough of a target — sparse memory, a bump heap,
//! a register file, and a control-transfer event log — for the boot flows
//! to run end to end without hardware. Tests seed it with a boot-argument
//! template and a device-tree blob, run a flow, then assert on what landed
//! where.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;

use crate::{CommandStatus, ProxyPort, Request, Response};

/// Base address the mock reports for payload images.
pub const MOCK_KERNEL_BASE: u64 = 0x8_0300_0000;
/// Start of the mock's proxy heap.
pub const MOCK_HEAP_BASE: u64 = 0x8_2000_0000;
/// Alignment of mock heap allocations.
pub const MOCK_HEAP_ALIGN: u64 = 0x4000;
/// Address of the seeded boot-argument template.
pub const MOCK_BOOTARGS_ADDR: u64 = 0x8_0001_0000;
/// Address of the seeded device-tree blob.
pub const MOCK_ADT_ADDR: u64 = 0x8_0010_0000;

/// Control transfers and other one-way commands observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// MMU shutdown was requested and honored.
    MmuShutdown,
    /// A `call` handoff.
    Call {
        /// Entry address.
        entry: u64,
        /// `x0..x3` arguments.
        args: [u64; 4],
        /// Reboot flag.
        reboot: bool,
    },
    /// A `reload` handoff.
    Reload {
        /// Entry address.
        entry: u64,
        /// `x0..x3` arguments.
        args: [u64; 4],
    },
}

/// In-memory proxy target.
#[derive(Debug, Default)]
pub struct MockPort {
    mem: BTreeMap<u64, u8>,
    regs: HashMap<u64, u64>,
    heap_next: u64,
    mmu_supported: bool,
    fail: Option<(&'static str, CommandStatus)>,
    events: Vec<ControlEvent>,
    maintenance: Vec<(&'static str, u64, u64)>,
    noops: u32,
    adt: Option<(u64, u64)>,
    committed_adt: Option<(u64, u64)>,
}

impl MockPort {
    /// Create an empty mock target.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap_next: MOCK_HEAP_BASE,
            mmu_supported: true,
            ..Self::default()
        }
    }

    /// Seed the live boot-argument template at [`MOCK_BOOTARGS_ADDR`].
    pub fn seed_bootargs(&mut self, bytes: &[u8]) {
        self.store(MOCK_BOOTARGS_ADDR, bytes);
    }

    /// Seed the device-tree blob at [`MOCK_ADT_ADDR`].
    pub fn seed_adt(&mut self, bytes: &[u8]) {
        self.store(MOCK_ADT_ADDR, bytes);
        self.adt = Some((MOCK_ADT_ADDR, bytes.len() as u64));
    }

    /// Seed arbitrary bytes at `addr`, e.g. pre-boot firmware.
    pub fn seed_region(&mut self, addr: u64, bytes: &[u8]) {
        self.store(addr, bytes);
    }

    /// Make the next occurrence of `op` fail with `status`.
    pub fn fail_op(&mut self, op: &'static str, status: CommandStatus) {
        self.fail = Some((op, status));
    }

    /// Toggle MMU shutdown support.
    pub fn set_mmu_supported(&mut self, supported: bool) {
        self.mmu_supported = supported;
    }

    /// Read back `len` bytes of mock memory; unwritten bytes read as zero.
    #[must_use]
    pub fn mem_at(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.mem.get(&(addr + i)).copied().unwrap_or(0))
            .collect()
    }

    /// Value last written to the register at `addr`, if any.
    #[must_use]
    pub fn reg(&self, addr: u64) -> Option<u64> {
        self.regs.get(&addr).copied()
    }

    /// Control transfers observed so far.
    #[must_use]
    pub fn events(&self) -> &[ControlEvent] {
        &self.events
    }

    /// Cache-maintenance operations observed so far, as (op, addr, len).
    #[must_use]
    pub fn maintenance(&self) -> &[(&'static str, u64, u64)] {
        &self.maintenance
    }

    /// Number of `noop` probes answered.
    #[must_use]
    pub fn noop_count(&self) -> u32 {
        self.noops
    }

    /// Device-tree blob last committed with `put-adt-blob`, if any.
    #[must_use]
    pub fn committed_adt(&self) -> Option<Vec<u8>> {
        self.committed_adt
            .map(|(addr, len)| self.mem_at(addr, len as usize))
    }

    fn store(&mut self, addr: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u64, *byte);
        }
    }

    fn forced_failure(&mut self, op: &'static str) -> Option<Response> {
        match self.fail {
            Some((fail_op, status)) if fail_op == op => {
                self.fail = None;
                Some(Response::Failed(status))
            }
            _ => None,
        }
    }
}

impl ProxyPort for MockPort {
    type Error = Infallible;

    fn execute(&mut self, request: Request) -> Result<Response, Self::Error> {
        if let Some(failed) = self.forced_failure(request.op()) {
            return Ok(failed);
        }
        Ok(match request {
            Request::Noop => {
                self.noops += 1;
                Response::Done
            }
            Request::Malloc { size } => {
                let addr = self.heap_next;
                let size = size.max(1);
                self.heap_next += (size + MOCK_HEAP_ALIGN - 1) & !(MOCK_HEAP_ALIGN - 1);
                Response::Address(addr)
            }
            Request::ReadMem { addr, len } => Response::Bytes(self.mem_at(addr, len as usize)),
            Request::WriteMem { addr, bytes } | Request::CompressedWriteMem { addr, bytes } => {
                self.store(addr, &bytes);
                Response::Done
            }
            Request::CopyMem { dest, src, len } => {
                let bytes = self.mem_at(src, len as usize);
                self.store(dest, &bytes);
                Response::Done
            }
            Request::ReadReg { addr } => Response::Value(self.regs.get(&addr).copied().unwrap_or(0)),
            Request::WriteReg { addr, value } => {
                self.regs.insert(addr, value);
                Response::Done
            }
            Request::CacheClean { addr, len } => {
                self.maintenance.push(("dc-cvau", addr, len));
                Response::Done
            }
            Request::CacheInvalidateIcache { addr, len } => {
                self.maintenance.push(("ic-ivau", addr, len));
                Response::Done
            }
            Request::MmuShutdown => {
                if self.mmu_supported {
                    self.events.push(ControlEvent::MmuShutdown);
                    Response::Done
                } else {
                    Response::Failed(CommandStatus::Unsupported)
                }
            }
            Request::Call {
                entry,
                args,
                reboot,
            } => {
                self.events.push(ControlEvent::Call {
                    entry,
                    args,
                    reboot,
                });
                Response::Done
            }
            Request::Reload { entry, args } => {
                self.events.push(ControlEvent::Reload { entry, args });
                Response::Done
            }
            Request::KernelBase => Response::Address(MOCK_KERNEL_BASE),
            Request::BootArgsAddr => Response::Address(MOCK_BOOTARGS_ADDR),
            Request::AdtBlob => match self.adt {
                Some((addr, len)) => Response::Region { addr, len },
                None => Response::Failed(CommandStatus::BadAddress),
            },
            Request::PutAdtBlob { addr, len } => {
                self.committed_adt = Some((addr, len));
                Response::Done
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_mem_moves_bytes() {
        let mut port = MockPort::new();
        port.store(0x1000, b"sepfw");
        port.execute(Request::CopyMem {
            dest: 0x2000,
            src: 0x1000,
            len: 5,
        })
        .unwrap();
        assert_eq!(port.mem_at(0x2000, 5), b"sepfw");
    }

    #[test]
    fn forced_failure_fires_once() {
        let mut port = MockPort::new();
        port.fail_op("noop", CommandStatus::Error);
        assert_eq!(
            port.execute(Request::Noop).unwrap(),
            Response::Failed(CommandStatus::Error)
        );
        assert_eq!(port.execute(Request::Noop).unwrap(), Response::Done);
    }

    #[test]
    fn adt_blob_requires_seeding() {
        let mut port = MockPort::new();
        assert_eq!(
            port.execute(Request::AdtBlob).unwrap(),
            Response::Failed(CommandStatus::BadAddress)
        );
        port.seed_adt(b"tree");
        assert_eq!(
            port.execute(Request::AdtBlob).unwrap(),
            Response::Region {
                addr: MOCK_ADT_ADDR,
                len: 4
            }
        );
    }
}
