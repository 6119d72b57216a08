// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Rewrite device-tree references and arm secondary cores.
// Author: Lukas Bower

//! Address patcher for the full-OS bring-up path.
//!
//! Rewrites the firmware and boot-args locations in `chosen/memory-map`,
//! writes the page-aligned reset vector into every secondary core's
//! implementation-defined control register, and commits the device tree as
//! one push. A failed register write aborts before the push, leaving the
//! device tree on the target untouched.

use adt_model::Adt;
use relay_proxy::{Proxy, ProxyPort};

use crate::chainload::ChainloadError;
use crate::layout::Layout;

/// Device-tree node naming the staged firmware and boot-args regions.
pub const MEMORY_MAP_PATH: &str = "chosen/memory-map";
/// Device-tree node listing processor cores in boot order.
pub const CPUS_PATH: &str = "cpus";
/// Property carrying a core's reset-vector control register.
pub const CPU_IMPL_REG: &str = "cpu-impl-reg";

/// Reset vectors are page-aligned: the low 12 bits of the entry address
/// are cleared before being written.
pub const RESET_VECTOR_MASK: u64 = !0xfff;

/// Patch the device tree and arm secondary cores for a staged kernel.
///
/// `firmware_dest` is the post-relocation firmware address
/// (`kernel_base + firmware offset`); `staging_base` is where the
/// boot-args block actually sits until the stub runs.
pub fn patch_for_kernel<P: ProxyPort>(
    adt: &mut Adt,
    proxy: &mut Proxy<P>,
    layout: &Layout,
    staging_base: u64,
    firmware_dest: u64,
    firmware_len: u64,
    entry: u64,
) -> Result<(), ChainloadError<P::Error>> {
    let mut txn = adt.edit();
    let map = txn.require_mut(MEMORY_MAP_PATH)?;
    map.set_reg_tuple("SEPFW", (firmware_dest, firmware_len));
    map.set_reg_tuple(
        "BootArgs",
        (staging_base + layout.bootargs.offset, layout.bootargs.len),
    );

    let reset_vector = entry & RESET_VECTOR_MASK;
    log::info!("setting secondary-core reset vectors to {reset_vector:#x}");
    let secondaries: Vec<(String, u64)> = txn
        .require(CPUS_PATH)?
        .children()
        .iter()
        .skip(1)
        .map(|cpu| Ok((cpu.name().to_owned(), cpu.reg_tuple(CPU_IMPL_REG)?.0)))
        .collect::<Result<_, adt_model::AdtError>>()?;
    for (name, reg_addr) in secondaries {
        log::debug!("  {name}: [{reg_addr:#x}] = {reset_vector:#x}");
        proxy.write_reg(reg_addr, reset_vector)?;
    }

    txn.commit(proxy)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::plan;
    use relay_proxy::{CommandStatus, MockPort};

    fn sample_adt() -> Adt {
        let mut adt = Adt::new();
        let map = adt.root_mut().add_child("chosen").add_child("memory-map");
        map.set_reg_tuple("SEPFW", (0x9_0000_0000, 0x40_0000));
        map.set_reg_tuple("BootArgs", (0x8_0001_0000, 0x4000));
        let cpus = adt.root_mut().add_child("cpus");
        for i in 0..3u64 {
            cpus.add_child(&format!("cpu{i}"))
                .set_reg_tuple(CPU_IMPL_REG, (0x2_1005_0000 + i * 8, 8));
        }
        adt
    }

    #[test]
    fn reset_vectors_are_page_aligned_and_skip_the_primary() {
        let mut adt = sample_adt();
        let mut proxy = Proxy::new(MockPort::new());
        let layout = plan(0x8000, 0x40_0000, 0x4000);
        patch_for_kernel(
            &mut adt,
            &mut proxy,
            &layout,
            0x8_2000_0000,
            0x8_0300_8000,
            0x40_0000,
            0x8_0300_0123,
        )
        .unwrap();
        let port = proxy.port();
        assert_eq!(port.reg(0x2_1005_0000), None); // primary untouched
        assert_eq!(port.reg(0x2_1005_0008), Some(0x8_0300_0000));
        assert_eq!(port.reg(0x2_1005_0010), Some(0x8_0300_0000));
    }

    #[test]
    fn memory_map_entries_point_at_new_layout() {
        let mut adt = sample_adt();
        let mut proxy = Proxy::new(MockPort::new());
        let layout = plan(0x8000, 0x40_0000, 0x4000);
        patch_for_kernel(
            &mut adt,
            &mut proxy,
            &layout,
            0x8_2000_0000,
            0x8_0300_8000,
            0x40_0000,
            0x8_0300_0000,
        )
        .unwrap();
        let map = adt.require(MEMORY_MAP_PATH).unwrap();
        assert_eq!(map.reg_tuple("SEPFW").unwrap(), (0x8_0300_8000, 0x40_0000));
        assert_eq!(
            map.reg_tuple("BootArgs").unwrap(),
            (0x8_2000_0000 + layout.bootargs.offset, 0x4000)
        );
        assert!(proxy.port().committed_adt().is_some());
    }

    #[test]
    fn failed_register_write_aborts_before_push() {
        let mut adt = sample_adt();
        let mut port = MockPort::new();
        port.fail_op("writereg", CommandStatus::Error);
        let mut proxy = Proxy::new(port);
        let layout = plan(0x8000, 0x40_0000, 0x4000);
        let err = patch_for_kernel(
            &mut adt,
            &mut proxy,
            &layout,
            0x8_2000_0000,
            0x8_0300_8000,
            0x40_0000,
            0x8_0300_0000,
        );
        assert!(err.is_err());
        assert!(proxy.port().committed_adt().is_none());
        // Local tree also untouched.
        assert_eq!(
            adt.require(MEMORY_MAP_PATH)
                .unwrap()
                .reg_tuple("SEPFW")
                .unwrap(),
            (0x9_0000_0000, 0x40_0000)
        );
    }
}
