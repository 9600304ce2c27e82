use worldswitch_arch_amd64::{DescriptorTableRegister, SegmentDescriptor};

use crate::{
    La, Mpn, SwitchError, VcpuId, WorldSwitch,
    apic::ApicDescriptor,
    cpu::{SegmentRegister, Cpu, mock::MockCpu},
    crossgdt::{CrossGdtInit, CrossGdtInitEntry},
    crosspage::CROSSPAGE_VERSION,
    host::mock::MockHost,
    layout,
    vm::{Vm, VmConfig},
};

const PT_ROOT: Mpn = Mpn(0x100);

fn host_gdt_buffer() -> Vec<u64> {
    let mut gdt = vec![0u64; 16];
    gdt[2] = SegmentDescriptor::new(0, 0xFFFFF, 0b1011, true, 0, true, false, true, true).0;
    gdt[3] = SegmentDescriptor::new(0, 0xFFFFF, 0b0011, true, 0, true, true, true, false).0;
    gdt
}

fn cpu_with_gdt(gdt: &[u64]) -> MockCpu {
    let mut cpu = MockCpu::new();
    cpu.state.gdtr = DescriptorTableRegister::new(gdt.as_ptr() as u64, (gdt.len() * 8) as u32);
    cpu
}

fn monitor_gdt_init() -> CrossGdtInit {
    CrossGdtInit {
        entries: vec![CrossGdtInitEntry {
            index: layout::MONITOR_DATA_SELECTOR / 8,
            present: true,
            base: 0,
            limit: 0xFFFFF,
            typ: 0b0011,
            s: true,
            dpl: 0,
            db: true,
            granularity: true,
            long_mode: false,
        }],
    }
}

fn powered_setup() -> (Vec<u64>, WorldSwitch<MockHost>, Vm) {
    let gdt = host_gdt_buffer();
    let mut cpu = cpu_with_gdt(&gdt);
    let ws = WorldSwitch::new(MockHost::new(1), &mut cpu).expect("driver init");

    // The monitor page tables: an empty root is all the L4-rooted patches
    // of low-half kernel addresses need.
    ws.host().install_page(PT_ROOT, vec![0u8; 4096]);

    ws.create_cross_gdt(&mut cpu, &monitor_gdt_init())
        .expect("crossGDT");

    let vm = Vm::new(
        ws.host(),
        VmConfig {
            num_vcpus: 2,
            pt_root_mpns: vec![PT_ROOT, PT_ROOT],
            apic: ApicDescriptor::default(),
        },
    )
    .expect("vm");

    (gdt, ws, vm)
}

#[test]
fn crosspage_init_wires_every_vcpu() {
    let (gdt, ws, vm) = powered_setup();
    let mut cpu = cpu_with_gdt(&gdt);

    ws.init_crosspage(
        &mut cpu,
        &vm,
        layout::MONITOR_START_LPN,
        layout::MONITOR_END_LPN,
    )
    .expect("crosspage init");

    assert!(vm.num_ptp_pages() > 0);

    let cross_gdt_la = ws.cross_gdt().unwrap().la();
    for index in 0..vm.num_vcpus() {
        let vcpu = VcpuId(index as u32);
        let cp = vm.crosspage(vcpu);

        // Self-description: the data page knows its own addresses.
        assert_eq!(La(cp.crosspage_data_la).lpn(), La(vm.crosspage_ptr(vcpu) as u64).lpn());
        assert_eq!(cp.cross_gdt_la, cross_gdt_la.0);
        assert_eq!(cp.mon_cr3, PT_ROOT.address().0);

        // The switch IDT has exactly the four handled gates.
        let present: Vec<usize> = cp
            .switch_idt
            .iter()
            .enumerate()
            .filter(|(_, gate)| gate.present())
            .map(|(vector, _)| vector)
            .collect();
        assert_eq!(present, vec![1, 2, 6, 18]);

        assert_eq!(cp.host_initial64_cs, cpu.get_segment(SegmentRegister::Cs));
        assert_eq!(cp.pseudo_tsc_conv.mult, 1);
        assert_eq!(cp.pseudo_tsc_conv.shift, 0);
        assert_eq!(cp.pseudo_tsc_conv.version % 2, 0);
    }

    vm.destroy(ws.host());
    ws.terminate();
}

#[test]
fn power_on_without_cross_gdt_fails() {
    let gdt = host_gdt_buffer();
    let mut cpu = cpu_with_gdt(&gdt);
    let ws = WorldSwitch::new(MockHost::new(1), &mut cpu).expect("driver init");

    let vm = Vm::new(
        ws.host(),
        VmConfig {
            num_vcpus: 1,
            pt_root_mpns: vec![PT_ROOT],
            apic: ApicDescriptor::default(),
        },
    )
    .unwrap();

    let err = ws
        .init_crosspage(&mut cpu, &vm, layout::MONITOR_START_LPN, layout::MONITOR_END_LPN)
        .unwrap_err();
    assert!(matches!(err, SwitchError::NoCrossGdt));

    vm.destroy(ws.host());
    ws.terminate();
}

#[test]
fn version_mismatch_fails_power_on() {
    let (gdt, ws, vm) = powered_setup();
    let mut cpu = cpu_with_gdt(&gdt);

    // The monitor side was built against another layout.
    unsafe {
        (*vm.crosspage_ptr(VcpuId(0))).version = CROSSPAGE_VERSION ^ 0xFF;
    }

    let err = ws
        .init_crosspage(&mut cpu, &vm, layout::MONITOR_START_LPN, layout::MONITOR_END_LPN)
        .unwrap_err();
    assert!(matches!(
        err,
        SwitchError::VersionMismatch { driver: CROSSPAGE_VERSION, .. }
    ));

    vm.destroy(ws.host());
    ws.terminate();
}

#[test]
fn monitor_covering_crosspage_addresses_fails() {
    let (gdt, ws, vm) = powered_setup();
    let mut cpu = cpu_with_gdt(&gdt);

    // Declare the monitor's range right on top of the crosspage data
    // page's linear address: no patch level exists.
    let data_lpn = La(vm.crosspage_ptr(VcpuId(0)) as u64).lpn();
    let err = ws
        .init_crosspage(&mut cpu, &vm, data_lpn, data_lpn)
        .unwrap_err();
    assert!(matches!(err, SwitchError::MonitorOverlap { .. }));

    vm.destroy(ws.host());
    ws.terminate();
}
