// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Proxy-utility context for one in-flight boot attempt.
// Author: Lukas Bower

//! Target context.
//!
//! Owns the typed proxy for the duration of one boot attempt and layers the
//! conveniences the flow needs on top of raw commands: cached kernel base,
//! boot-argument template fetch, device-tree fetch, and coherent uploads.
//! Target memory is never freed; the attempt ends in a reboot or reload.

use adt_model::Adt;
use relay_proxy::{Proxy, ProxyError, ProxyPort};

use crate::bootargs::{self, BootArgs};
use crate::chainload::ChainloadError;
use crate::stub::RelocationStub;

/// Default target-side heap reservation, matching the guest tooling.
pub const DEFAULT_HEAP_SIZE: u64 = 128 * 1024 * 1024;

/// Exclusive handle on the target for one boot attempt.
pub struct TargetContext<P: ProxyPort> {
    proxy: Proxy<P>,
    kernel_base: u64,
    heap_size: u64,
    heap_used: u64,
}

impl<P: ProxyPort> TargetContext<P> {
    /// Bring up the link: probe it, then cache the kernel base.
    pub fn bootstrap(port: P, heap_size: u64) -> Result<Self, ProxyError<P::Error>> {
        let mut proxy = Proxy::new(port);
        proxy.noop()?;
        let kernel_base = proxy.kernel_base()?;
        log::debug!("link up: kernel base {kernel_base:#x}, heap {heap_size:#x}");
        Ok(Self {
            proxy,
            kernel_base,
            heap_size,
            heap_used: 0,
        })
    }

    /// Base address where payload images are loaded.
    #[must_use]
    pub fn kernel_base(&self) -> u64 {
        self.kernel_base
    }

    /// Direct access to the typed proxy.
    pub fn proxy(&mut self) -> &mut Proxy<P> {
        &mut self.proxy
    }

    /// Consume the context and return the link backend.
    pub fn into_port(self) -> P {
        self.proxy.into_port()
    }

    /// Allocate target-side memory. The proxy owns the heap; the local
    /// reservation is advisory and only logged when exceeded.
    pub fn malloc(&mut self, size: u64) -> Result<u64, ProxyError<P::Error>> {
        let addr = self.proxy.malloc(size)?;
        self.heap_used = self.heap_used.saturating_add(size);
        if self.heap_used > self.heap_size {
            log::warn!(
                "target heap use {:#x} exceeds the {:#x} reservation",
                self.heap_used,
                self.heap_size
            );
        }
        Ok(addr)
    }

    /// Fetch a copy of the live boot-argument template.
    pub fn bootargs_template(&mut self) -> Result<BootArgs, ChainloadError<P::Error>> {
        let addr = self.proxy.bootargs_addr()?;
        let blob = self.proxy.read_mem(addr, bootargs::ENCODED_SIZE as u64)?;
        Ok(BootArgs::decode(&blob)?)
    }

    /// Fetch and decode the device tree.
    pub fn fetch_adt(&mut self) -> Result<Adt, ChainloadError<P::Error>> {
        let (addr, len) = self.proxy.adt_blob()?;
        let blob = self.proxy.read_mem(addr, len)?;
        Ok(Adt::decode(&blob)?)
    }

    /// Upload image bytes with wire compression and clean the data cache
    /// over them.
    pub fn upload_image(&mut self, addr: u64, bytes: &[u8]) -> Result<(), ProxyError<P::Error>> {
        self.proxy.compressed_write_mem(addr, bytes)?;
        self.proxy.cache_clean(addr, bytes.len() as u64)
    }

    /// Write the stub and make it coherent before it is ever executed.
    pub fn stage_stub(
        &mut self,
        addr: u64,
        stub: &RelocationStub,
    ) -> Result<(), ProxyError<P::Error>> {
        let code = stub.code();
        self.proxy.write_mem(addr, &code)?;
        self.proxy.cache_clean(addr, code.len() as u64)?;
        self.proxy.cache_invalidate_icache(addr, code.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proxy::mock::{MockPort, MOCK_KERNEL_BASE};

    #[test]
    fn bootstrap_probes_and_caches_base() {
        let ctx = TargetContext::bootstrap(MockPort::new(), DEFAULT_HEAP_SIZE).unwrap();
        assert_eq!(ctx.kernel_base(), MOCK_KERNEL_BASE);
        assert_eq!(ctx.into_port().noop_count(), 1);
    }

    #[test]
    fn template_round_trips_through_target_memory() {
        let template = BootArgs {
            top_of_kernel_data: 0x8_0500_0000,
            ..BootArgs::default()
        };
        let mut port = MockPort::new();
        port.seed_bootargs(&template.encode().unwrap());
        let mut ctx = TargetContext::bootstrap(port, DEFAULT_HEAP_SIZE).unwrap();
        assert_eq!(ctx.bootargs_template().unwrap(), template);
    }

    #[test]
    fn stub_staging_is_coherent() {
        let mut ctx = TargetContext::bootstrap(MockPort::new(), DEFAULT_HEAP_SIZE).unwrap();
        let stub = RelocationStub::synthesize(0x8_0300_0000);
        ctx.stage_stub(0x8_2000_0000, &stub).unwrap();
        let port = ctx.into_port();
        assert_eq!(port.mem_at(0x8_2000_0000, stub.code().len()), stub.code());
        assert_eq!(
            port.maintenance(),
            &[
                ("dc-cvau", 0x8_2000_0000, stub.len()),
                ("ic-ivau", 0x8_2000_0000, stub.len()),
            ]
        );
    }
}
