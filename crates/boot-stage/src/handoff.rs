// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Transfer control to the relocation stub through the proxy.
// Author: Lukas Bower

//! Handoff executor.
//!
//! Two mutually exclusive mechanisms hand the target to the stub, modeled
//! as a closed enum so exactly one is chosen per boot attempt. Direct-call
//! mode runs the stub with physical addressing already in effect; reload
//! mode lets the proxy reinitialize its own execution context first. After
//! either, a `noop` probe confirms the link survived the jump.

use relay_proxy::{Proxy, ProxyError, ProxyPort};

use crate::layout::Layout;

/// The two handoff mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffMode {
    /// Shut down the MMU (best effort), then `call` the stub. With
    /// `reboot` the target reboots into the new image as part of the call.
    Call {
        /// Request a target reboot as part of the call.
        reboot: bool,
    },
    /// `reload` into the stub, leaving MMU state to the proxy.
    Reload,
}

/// The four register arguments the stub receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubArgs {
    /// Final boot-args address, handed through to the kernel in `x0`.
    pub bootargs: u64,
    /// Copy source: staging region base.
    pub source: u64,
    /// Copy destination: the kernel's true base.
    pub dest: u64,
    /// Bytes to relocate.
    pub remaining: u64,
}

impl StubArgs {
    /// Arguments for relocating `layout` from `region` to `dest`.
    #[must_use]
    pub fn for_relocation(layout: &Layout, region: u64, dest: u64) -> Self {
        Self {
            bootargs: dest + layout.bootargs.offset,
            source: region,
            dest,
            remaining: layout.total_size,
        }
    }

    fn to_array(self) -> [u64; 4] {
        [self.bootargs, self.source, self.dest, self.remaining]
    }
}

/// Run the handoff. Does not return control to the stub; the only
/// post-condition checked is that the proxy link answers a probe again.
pub fn execute<P: ProxyPort>(
    proxy: &mut Proxy<P>,
    stub_addr: u64,
    args: StubArgs,
    mode: HandoffMode,
) -> Result<(), ProxyError<P::Error>> {
    match mode {
        HandoffMode::Call { reboot } => {
            log::info!("shutting down MMU");
            match proxy.mmu_shutdown() {
                Ok(()) => {}
                Err(err) if err.is_unsupported() => {
                    log::debug!("proxy does not implement mmu-shutdown, continuing");
                }
                Err(err) => return Err(err),
            }
            log::info!("jumping to stub at {stub_addr:#x}");
            proxy.call(stub_addr, args.to_array(), reboot)?;
        }
        HandoffMode::Reload => {
            log::info!("reloading into stub at {stub_addr:#x}");
            proxy.reload(stub_addr, args.to_array())?;
        }
    }
    proxy.noop()?;
    log::info!("proxy is alive again");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proxy::{mock::ControlEvent, CommandStatus, MockPort};

    fn args() -> StubArgs {
        StubArgs {
            bootargs: 0x8_0310_0000,
            source: 0x8_2000_0000,
            dest: 0x8_0300_0000,
            remaining: 0x10_4000,
        }
    }

    #[test]
    fn call_mode_shuts_down_mmu_then_calls() {
        let mut proxy = Proxy::new(MockPort::new());
        execute(&mut proxy, 0x8_2010_0000, args(), HandoffMode::Call { reboot: true }).unwrap();
        let events = proxy.port().events();
        assert_eq!(events[0], ControlEvent::MmuShutdown);
        assert_eq!(
            events[1],
            ControlEvent::Call {
                entry: 0x8_2010_0000,
                args: [0x8_0310_0000, 0x8_2000_0000, 0x8_0300_0000, 0x10_4000],
                reboot: true,
            }
        );
        assert_eq!(proxy.port().noop_count(), 1);
    }

    #[test]
    fn unsupported_mmu_shutdown_is_best_effort() {
        let mut port = MockPort::new();
        port.set_mmu_supported(false);
        let mut proxy = Proxy::new(port);
        execute(&mut proxy, 0x1000, args(), HandoffMode::Call { reboot: false }).unwrap();
        assert!(matches!(
            proxy.port().events()[0],
            ControlEvent::Call { .. }
        ));
    }

    #[test]
    fn other_mmu_failures_propagate() {
        let mut port = MockPort::new();
        port.fail_op("mmu-shutdown", CommandStatus::Error);
        let mut proxy = Proxy::new(port);
        let err = execute(&mut proxy, 0x1000, args(), HandoffMode::Call { reboot: false });
        assert!(err.is_err());
        assert!(proxy.port().events().is_empty());
    }

    #[test]
    fn reload_mode_skips_mmu_shutdown() {
        let mut proxy = Proxy::new(MockPort::new());
        execute(&mut proxy, 0x2000, args(), HandoffMode::Reload).unwrap();
        assert_eq!(
            proxy.port().events(),
            &[ControlEvent::Reload {
                entry: 0x2000,
                args: [0x8_0310_0000, 0x8_2000_0000, 0x8_0300_0000, 0x10_4000],
            }]
        );
    }

    #[test]
    fn dead_link_after_handoff_is_an_error() {
        let mut port = MockPort::new();
        port.fail_op("noop", CommandStatus::Error);
        let mut proxy = Proxy::new(port);
        assert!(execute(&mut proxy, 0x2000, args(), HandoffMode::Reload).is_err());
    }
}
