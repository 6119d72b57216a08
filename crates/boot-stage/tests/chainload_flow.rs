// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end chainload sequence tests against the mock target.
// Author: Lukas Bower

use adt_model::Adt;
use boot_stage::bootargs::{BootArgs, VideoArgs};
use boot_stage::{
    chainload, ChainloadOptions, FlatPayload, HandoffMode, RelocationStub, TargetContext,
    VirtSlide, BOOTARGS_SIZE,
};
use relay_proxy::mock::{ControlEvent, MockPort, MOCK_HEAP_BASE, MOCK_KERNEL_BASE};

const SEPFW_SRC: u64 = 0x9_0000_0000;
const SEPFW_LEN: u64 = 0x6000;
const CPU_REG_BASE: u64 = 0x2_1005_0000;

fn seeded_port() -> MockPort {
    let mut port = MockPort::new();

    let mut adt = Adt::new();
    let map = adt.root_mut().add_child("chosen").add_child("memory-map");
    map.set_reg_tuple("SEPFW", (SEPFW_SRC, SEPFW_LEN));
    map.set_reg_tuple("BootArgs", (0x8_0001_0000, BOOTARGS_SIZE));
    let cpus = adt.root_mut().add_child("cpus");
    for i in 0..4u64 {
        cpus.add_child(&format!("cpu{i}"))
            .set_reg_tuple("cpu-impl-reg", (CPU_REG_BASE + i * 8, 8));
    }
    port.seed_adt(&adt.encode());

    let template = BootArgs {
        revision: 2,
        version: 2,
        virt_base: 0xffff_fe00_0700_4000,
        phys_base: MOCK_KERNEL_BASE,
        mem_size: 0x2_0000_0000,
        top_of_kernel_data: 0x8_0500_0000,
        video: VideoArgs {
            display: 1,
            ..VideoArgs::default()
        },
        machine_type: 0x8027,
        devtree: 0xffff_fe00_0700_8000,
        devtree_size: 0x2_0000,
        cmdline: String::new(),
        boot_flags: 0,
        mem_size_actual: 0x2_0000_0000,
    };
    port.seed_bootargs(&template.encode().unwrap());

    // Firmware bytes at their pre-boot location.
    let firmware: Vec<u8> = (0..SEPFW_LEN).map(|i| (i % 251) as u8).collect();
    port.seed_region(SEPFW_SRC, &firmware);

    port
}

fn payload() -> FlatPayload {
    FlatPayload::new(vec![0xAA; 0x2340], 0x800)
}

#[test]
fn xnu_boot_patches_stages_and_calls() {
    let mut ctx = TargetContext::bootstrap(seeded_port(), 0x100_0000).unwrap();
    let options = ChainloadOptions {
        xnu: true,
        mode: HandoffMode::Call { reboot: true },
        boot_args: vec!["-v".to_owned(), "debug=0x14e".to_owned()],
        virt_slide: VirtSlide::Alternate,
        ..ChainloadOptions::default()
    };
    let report = chainload(&mut ctx, &payload(), &options).unwrap();

    let region = report.region_base;
    assert_eq!(region, MOCK_HEAP_BASE);
    // image 0x2340 -> 0x4000, firmware 0x6000 -> 0x8000, bootargs 0x4000.
    assert_eq!(report.layout.total_size, 0x4000 + 0x8000 + 0x4000);
    assert_eq!(report.entry, MOCK_KERNEL_BASE + 0x800);
    assert_eq!(report.stub_addr, region + report.layout.total_size);

    let port = ctx.into_port();

    // Image staged at the region base.
    assert_eq!(port.mem_at(region, 4), vec![0xAA; 4]);

    // Firmware copied device-side into its segment.
    assert_eq!(
        port.mem_at(region + report.layout.firmware.offset, 8),
        (0..8u64).map(|i| (i % 251) as u8).collect::<Vec<_>>()
    );

    // Device tree committed with the new locations.
    let committed = Adt::decode(&port.committed_adt().expect("adt pushed")).unwrap();
    let map = committed.require("chosen/memory-map").unwrap();
    assert_eq!(
        map.reg_tuple("SEPFW").unwrap(),
        (MOCK_KERNEL_BASE + report.layout.firmware.offset, SEPFW_LEN)
    );
    assert_eq!(
        map.reg_tuple("BootArgs").unwrap(),
        (region + report.layout.bootargs.offset, BOOTARGS_SIZE)
    );

    // Secondary cores armed with a page-aligned vector; primary untouched.
    let vector = report.entry & !0xfff;
    assert_eq!(port.reg(CPU_REG_BASE), None);
    for i in 1..4u64 {
        assert_eq!(port.reg(CPU_REG_BASE + i * 8), Some(vector));
    }

    // Boot arguments serialized into their segment.
    let blob = port.mem_at(
        region + report.layout.bootargs.offset,
        boot_stage::bootargs::ENCODED_SIZE,
    );
    let args = BootArgs::decode(&blob).unwrap();
    assert_eq!(
        args.top_of_kernel_data,
        MOCK_KERNEL_BASE + report.layout.total_size
    );
    assert_eq!(args.video.display, 0);
    assert_eq!(args.cmdline, "-v debug=0x14e");
    assert_eq!(args.virt_base, 0xffff_fff0_0700_4000);

    // Stub staged at the region tail.
    let stub = RelocationStub::synthesize(report.entry);
    assert_eq!(port.mem_at(report.stub_addr, stub.code().len()), stub.code());

    // Handoff: MMU down, then a rebooting call with the stub arguments.
    let events = port.events();
    assert_eq!(events[0], ControlEvent::MmuShutdown);
    assert_eq!(
        events[1],
        ControlEvent::Call {
            entry: report.stub_addr,
            args: [
                MOCK_KERNEL_BASE + report.layout.bootargs.offset,
                region,
                MOCK_KERNEL_BASE,
                report.layout.total_size,
            ],
            reboot: true,
        }
    );
    // Bootstrap probe plus post-handoff liveness probe.
    assert_eq!(port.noop_count(), 2);
}

#[test]
fn bare_payload_boot_skips_patching_and_reloads() {
    let mut ctx = TargetContext::bootstrap(seeded_port(), 0x100_0000).unwrap();
    let options = ChainloadOptions {
        xnu: false,
        mode: HandoffMode::Reload,
        virt_slide: VirtSlide::None,
        ..ChainloadOptions::default()
    };
    let report = chainload(&mut ctx, &payload(), &options).unwrap();

    // No firmware: its segment is empty and the region is smaller.
    assert_eq!(report.layout.firmware.len, 0);
    assert_eq!(report.layout.total_size, 0x4000 + 0x4000);

    let port = ctx.into_port();
    assert!(port.committed_adt().is_none());
    for i in 0..4u64 {
        assert_eq!(port.reg(CPU_REG_BASE + i * 8), None);
    }

    // Template top of kernel data (0x8_0500_0000) is above the staged
    // region top and must not move down.
    let blob = port.mem_at(
        report.region_base + report.layout.bootargs.offset,
        boot_stage::bootargs::ENCODED_SIZE,
    );
    let args = BootArgs::decode(&blob).unwrap();
    assert_eq!(args.top_of_kernel_data, 0x8_0500_0000);
    assert_eq!(args.cmdline, "");
    assert_eq!(args.virt_base, 0xffff_fe00_0700_4000);

    assert!(matches!(
        port.events()[0],
        ControlEvent::Reload { entry, .. } if entry == report.stub_addr
    ));
}

#[test]
fn transport_failure_propagates_without_push() {
    let mut port = seeded_port();
    port.fail_op("writereg", relay_proxy::CommandStatus::Error);
    let mut ctx = TargetContext::bootstrap(port, 0x100_0000).unwrap();
    let options = ChainloadOptions {
        xnu: true,
        ..ChainloadOptions::default()
    };
    assert!(chainload(&mut ctx, &payload(), &options).is_err());
    let port = ctx.into_port();
    assert!(port.committed_adt().is_none());
    assert!(port.events().is_empty());
}
