//! The privileged-instruction surface of the switch driver.
//!
//! Every ring-0 instruction the driver executes goes through the [`Cpu`]
//! trait: register moves, descriptor-table loads, MSR access, the VMX
//! instructions, and the call into the crosspage.  [`HwCpu`] implements it
//! with inline assembly; tests drive the driver with a scripted mock and
//! assert on the instruction log.

use worldswitch_arch_amd64::{DescriptorTableRegister, Rflags, Selector};

use crate::{Ma, crosspage::CrossPageData};

/// Output of a `cpuid` invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuidRegs {
    /// EAX output.
    pub eax: u32,
    /// EBX output.
    pub ebx: u32,
    /// ECX output.
    pub ecx: u32,
    /// EDX output.
    pub edx: u32,
}

/// A directly addressable segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRegister {
    /// Code segment.
    Cs,
    /// Data segment.
    Ds,
    /// Extra segment.
    Es,
    /// FS segment.
    Fs,
    /// GS segment.
    Gs,
    /// Stack segment.
    Ss,
}

/// The privileged instructions used on the switch path.
///
/// All methods take `&mut self` so a scripted implementation can log and
/// sequence them.  Implementations for real hardware assume ring 0 with the
/// constraints the switch driver establishes (interrupts off where
/// required); that contract is carried by the constructor, not by the
/// individual methods.
pub trait Cpu {
    /// `true` when exceptions raised by these methods vector through the
    /// live IDT (i.e. this is real hardware).  The switch-IDT self-test
    /// only runs when this holds.
    const HARDWARE: bool;

    /// Executes `cpuid` with the given leaf and subleaf.
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuidRegs;

    /// Reads RFLAGS.
    fn get_flags(&mut self) -> Rflags;

    /// Writes RFLAGS.
    fn set_flags(&mut self, flags: Rflags);

    /// Disables maskable interrupts on this CPU.
    fn disable_interrupts(&mut self);

    /// Reads CR0.
    fn get_cr0(&mut self) -> u64;
    /// Writes CR0.
    fn set_cr0(&mut self, value: u64);
    /// Reads CR2.
    fn get_cr2(&mut self) -> u64;
    /// Writes CR2.
    fn set_cr2(&mut self, value: u64);
    /// Reads CR3.
    fn get_cr3(&mut self) -> u64;
    /// Writes CR3.
    fn set_cr3(&mut self, value: u64);
    /// Reads CR4.
    fn get_cr4(&mut self) -> u64;
    /// Writes CR4.
    fn set_cr4(&mut self, value: u64);

    /// Reads debug register `n` (0..=3, 6, 7).
    ///
    /// May raise `#DB` if DR7.GD is set; the switch IDT handler records the
    /// event in the crosspage and resumes.
    fn get_dr(&mut self, n: usize) -> u64;

    /// Writes debug register `n`.
    fn set_dr(&mut self, n: usize, value: u64);

    /// `sgdt`.
    fn get_gdt(&mut self) -> DescriptorTableRegister;
    /// `lgdt`.
    fn set_gdt(&mut self, dtr: &DescriptorTableRegister);
    /// `sidt`.
    fn get_idt(&mut self) -> DescriptorTableRegister;
    /// `lidt`.
    fn set_idt(&mut self, dtr: &DescriptorTableRegister);

    /// Reads a segment selector register.
    fn get_segment(&mut self, seg: SegmentRegister) -> Selector;

    /// Writes a segment selector register.  CS is not writable this way
    /// and is never written by the driver.
    fn set_segment(&mut self, seg: SegmentRegister, sel: Selector);

    /// `sldt`.
    fn get_ldt(&mut self) -> Selector;
    /// `lldt`.
    fn set_ldt(&mut self, sel: Selector);
    /// `str`.
    fn get_tr(&mut self) -> Selector;
    /// `ltr`.
    fn set_tr(&mut self, sel: Selector);

    /// Reads an MSR.
    fn rdmsr(&mut self, msr: u32) -> u64;
    /// Writes an MSR.
    fn wrmsr(&mut self, msr: u32, value: u64);

    /// Reads the time-stamp counter.
    fn rdtsc(&mut self) -> u64;

    /// Enters VMX root operation with the given VMXON region.  Returns
    /// `false` if the CPU refused, which usually means a foreign hypervisor
    /// is already in root mode.
    fn vmxon(&mut self, region: Ma) -> bool;

    /// Leaves VMX root operation.
    fn vmxoff(&mut self);

    /// Stores the current-VMCS pointer.
    fn vmptrst(&mut self) -> Ma;

    /// Loads a current-VMCS pointer.
    fn vmptrld(&mut self, vmcs: Ma);

    /// Raises software interrupt `vector` (`int N`).
    fn raise_interrupt(&mut self, vector: u8);

    /// Reads a 32-bit MMIO register (used for the xAPIC window).
    fn mmio_read32(&mut self, va: u64) -> u32;

    /// Writes a 32-bit MMIO register.
    fn mmio_write32(&mut self, va: u64, value: u32);

    /// Calls the crosspage's host-to-monitor entry point and returns when
    /// the monitor comes back.
    ///
    /// # Safety
    ///
    /// `crosspage` must point to a fully initialized crosspage whose
    /// page-table patches have been applied; the calling thread must be
    /// pinned with interrupts disabled and the switch IDT loaded.
    unsafe fn host_to_vmm(&mut self, crosspage: *mut CrossPageData);
}

#[cfg(target_arch = "x86_64")]
pub use self::hw::HwCpu;

#[cfg(test)]
pub(crate) mod mock {
    //! A scripted CPU: every privileged operation lands in plain state and
    //! an instruction log the tests assert on.

    use std::collections::{HashMap, VecDeque};

    use worldswitch_arch_amd64::{DescriptorTableRegister, Rflags, Selector};

    use super::{Cpu, CpuidRegs, SegmentRegister};
    use crate::{Ma, crosspage::CrossPageData};

    /// Snapshot of everything the switch driver must restore.
    #[derive(Debug, Default, Clone, PartialEq)]
    pub struct CpuState {
        pub flags: u64,
        pub cr: [u64; 5],
        pub dr: [u64; 8],
        pub gdtr: DescriptorTableRegister,
        pub idtr: DescriptorTableRegister,
        pub cs: Selector,
        pub ds: Selector,
        pub es: Selector,
        pub fs: Selector,
        pub gs: Selector,
        pub ss: Selector,
        pub ldt: Selector,
        pub tr: Selector,
        pub msrs: HashMap<u32, u64>,
        pub tsc: u64,
        pub current_vmcs: u64,
    }

    type SwitchBehavior = Box<dyn FnMut(&mut CrossPageData)>;

    pub struct MockCpu {
        pub state: CpuState,
        pub log: Vec<String>,
        pub raised: Vec<u8>,
        pub vmxon_succeeds: bool,
        pub in_root_mode: bool,
        pub cpuid: HashMap<(u32, u32), CpuidRegs>,
        pub mmio: HashMap<u64, u32>,
        pub on_host_to_vmm: VecDeque<SwitchBehavior>,
    }

    impl MockCpu {
        pub fn new() -> MockCpu {
            let mut state = CpuState {
                flags: Rflags::IF | 0x2,
                cs: Selector(0x10),
                ds: Selector(0x18),
                es: Selector(0x18),
                ss: Selector(0x18),
                tr: Selector(0x40),
                ..CpuState::default()
            };
            state.cr[0] = 0x8005_0033;
            state.cr[3] = 0x1AB000;
            state.cr[4] = 0x370678;
            state.dr[6] = 0xFFFF_0FF0;
            state.dr[7] = 0x400;
            MockCpu {
                state,
                log: Vec::new(),
                raised: Vec::new(),
                vmxon_succeeds: true,
                in_root_mode: false,
                cpuid: HashMap::new(),
                mmio: HashMap::new(),
                on_host_to_vmm: VecDeque::new(),
            }
        }

        /// Queues the behavior of the next monitor visit.
        pub fn on_switch(&mut self, behavior: impl FnMut(&mut CrossPageData) + 'static) {
            self.on_host_to_vmm.push_back(Box::new(behavior));
        }

        pub fn set_msr_value(&mut self, msr: u32, value: u64) {
            self.state.msrs.insert(msr, value);
        }

        pub fn count_log(&self, needle: &str) -> usize {
            self.log.iter().filter(|line| line.as_str() == needle).count()
        }
    }

    impl Cpu for MockCpu {
        const HARDWARE: bool = false;

        fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuidRegs {
            self.cpuid.get(&(leaf, subleaf)).copied().unwrap_or_default()
        }

        fn get_flags(&mut self) -> Rflags {
            Rflags(self.state.flags)
        }

        fn set_flags(&mut self, flags: Rflags) {
            self.state.flags = flags.0;
        }

        fn disable_interrupts(&mut self) {
            self.state.flags &= !Rflags::IF;
            self.log.push("cli".into());
        }

        fn get_cr0(&mut self) -> u64 {
            self.state.cr[0]
        }

        fn set_cr0(&mut self, value: u64) {
            self.state.cr[0] = value;
        }

        fn get_cr2(&mut self) -> u64 {
            self.state.cr[2]
        }

        fn set_cr2(&mut self, value: u64) {
            self.state.cr[2] = value;
        }

        fn get_cr3(&mut self) -> u64 {
            self.state.cr[3]
        }

        fn set_cr3(&mut self, value: u64) {
            self.state.cr[3] = value;
        }

        fn get_cr4(&mut self) -> u64 {
            self.state.cr[4]
        }

        fn set_cr4(&mut self, value: u64) {
            self.log.push(format!("set_cr4 {value:#x}"));
            self.state.cr[4] = value;
        }

        fn get_dr(&mut self, n: usize) -> u64 {
            self.state.dr[n]
        }

        fn set_dr(&mut self, n: usize, value: u64) {
            self.log.push(format!("set_dr{n} {value:#x}"));
            self.state.dr[n] = value;
        }

        fn get_gdt(&mut self) -> DescriptorTableRegister {
            self.state.gdtr
        }

        fn set_gdt(&mut self, dtr: &DescriptorTableRegister) {
            self.state.gdtr = *dtr;
            self.log.push("lgdt".into());
        }

        fn get_idt(&mut self) -> DescriptorTableRegister {
            self.state.idtr
        }

        fn set_idt(&mut self, dtr: &DescriptorTableRegister) {
            self.state.idtr = *dtr;
            self.log.push("lidt".into());
        }

        fn get_segment(&mut self, seg: SegmentRegister) -> Selector {
            match seg {
                SegmentRegister::Cs => self.state.cs,
                SegmentRegister::Ds => self.state.ds,
                SegmentRegister::Es => self.state.es,
                SegmentRegister::Fs => self.state.fs,
                SegmentRegister::Gs => self.state.gs,
                SegmentRegister::Ss => self.state.ss,
            }
        }

        fn set_segment(&mut self, seg: SegmentRegister, sel: Selector) {
            match seg {
                SegmentRegister::Cs => unreachable!(),
                SegmentRegister::Ds => self.state.ds = sel,
                SegmentRegister::Es => self.state.es = sel,
                SegmentRegister::Fs => self.state.fs = sel,
                SegmentRegister::Gs => self.state.gs = sel,
                SegmentRegister::Ss => self.state.ss = sel,
            }
        }

        fn get_ldt(&mut self) -> Selector {
            self.state.ldt
        }

        fn set_ldt(&mut self, sel: Selector) {
            self.state.ldt = sel;
        }

        fn get_tr(&mut self) -> Selector {
            self.state.tr
        }

        fn set_tr(&mut self, sel: Selector) {
            self.state.tr = sel;
            self.log.push("ltr".into());
        }

        fn rdmsr(&mut self, msr: u32) -> u64 {
            self.state.msrs.get(&msr).copied().unwrap_or(0)
        }

        fn wrmsr(&mut self, msr: u32, value: u64) {
            self.log.push(format!("wrmsr {msr:#x} {value:#x}"));
            self.state.msrs.insert(msr, value);
        }

        fn rdtsc(&mut self) -> u64 {
            self.state.tsc
        }

        fn vmxon(&mut self, region: Ma) -> bool {
            self.log.push(format!("vmxon {:#x}", region.0));
            if self.vmxon_succeeds && !self.in_root_mode {
                self.in_root_mode = true;
                true
            } else {
                false
            }
        }

        fn vmxoff(&mut self) {
            self.log.push("vmxoff".into());
            self.in_root_mode = false;
        }

        fn vmptrst(&mut self) -> Ma {
            self.log.push("vmptrst".into());
            Ma(self.state.current_vmcs)
        }

        fn vmptrld(&mut self, vmcs: Ma) {
            self.log.push(format!("vmptrld {:#x}", vmcs.0));
            self.state.current_vmcs = vmcs.0;
        }

        fn raise_interrupt(&mut self, vector: u8) {
            self.log.push(format!("int {vector}"));
            self.raised.push(vector);
        }

        fn mmio_read32(&mut self, va: u64) -> u32 {
            self.mmio.get(&va).copied().unwrap_or(0)
        }

        fn mmio_write32(&mut self, va: u64, value: u32) {
            self.mmio.insert(va, value);
        }

        unsafe fn host_to_vmm(&mut self, crosspage: *mut CrossPageData) {
            self.log.push("host_to_vmm".into());
            if let Some(mut behavior) = self.on_host_to_vmm.pop_front() {
                behavior(unsafe { &mut *crosspage });
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod hw {
    use core::arch::asm;

    use worldswitch_arch_amd64::{DescriptorTableRegister, Rflags, Selector};
    use zerocopy::{FromBytes, IntoBytes};

    use super::{Cpu, CpuidRegs, SegmentRegister};
    use crate::{Ma, crosspage::CrossPageData, crosspage::code};

    /// The real CPU.
    ///
    /// Zero-sized; constructing one asserts that the caller runs in ring 0
    /// on the CPU it intends to drive.
    pub struct HwCpu(());

    impl HwCpu {
        /// Creates a handle to the executing CPU.
        ///
        /// # Safety
        ///
        /// The caller must be executing in ring 0 and must keep the thread
        /// pinned for as long as per-CPU state (descriptor tables, MSRs,
        /// root mode) is being manipulated.
        pub unsafe fn new() -> HwCpu {
            HwCpu(())
        }
    }

    impl Cpu for HwCpu {
        const HARDWARE: bool = true;

        fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuidRegs {
            let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
            CpuidRegs {
                eax: r.eax,
                ebx: r.ebx,
                ecx: r.ecx,
                edx: r.edx,
            }
        }

        fn get_flags(&mut self) -> Rflags {
            let flags: u64;
            unsafe {
                asm!("pushfq", "pop {}", out(reg) flags, options(preserves_flags));
            }
            Rflags(flags)
        }

        fn set_flags(&mut self, flags: Rflags) {
            unsafe {
                asm!("push {}", "popfq", in(reg) flags.0);
            }
        }

        fn disable_interrupts(&mut self) {
            unsafe {
                asm!("cli", options(nomem, nostack));
            }
        }

        fn get_cr0(&mut self) -> u64 {
            let value: u64;
            unsafe {
                asm!("mov {}, cr0", out(reg) value, options(nomem, nostack));
            }
            value
        }

        fn set_cr0(&mut self, value: u64) {
            unsafe {
                asm!("mov cr0, {}", in(reg) value, options(nomem, nostack));
            }
        }

        fn get_cr2(&mut self) -> u64 {
            let value: u64;
            unsafe {
                asm!("mov {}, cr2", out(reg) value, options(nomem, nostack));
            }
            value
        }

        fn set_cr2(&mut self, value: u64) {
            unsafe {
                asm!("mov cr2, {}", in(reg) value, options(nomem, nostack));
            }
        }

        fn get_cr3(&mut self) -> u64 {
            let value: u64;
            unsafe {
                asm!("mov {}, cr3", out(reg) value, options(nomem, nostack));
            }
            value
        }

        fn set_cr3(&mut self, value: u64) {
            unsafe {
                asm!("mov cr3, {}", in(reg) value, options(nostack));
            }
        }

        fn get_cr4(&mut self) -> u64 {
            let value: u64;
            unsafe {
                asm!("mov {}, cr4", out(reg) value, options(nomem, nostack));
            }
            value
        }

        fn set_cr4(&mut self, value: u64) {
            unsafe {
                asm!("mov cr4, {}", in(reg) value, options(nostack));
            }
        }

        fn get_dr(&mut self, n: usize) -> u64 {
            let value: u64;
            unsafe {
                match n {
                    0 => asm!("mov {}, dr0", out(reg) value, options(nomem, nostack)),
                    1 => asm!("mov {}, dr1", out(reg) value, options(nomem, nostack)),
                    2 => asm!("mov {}, dr2", out(reg) value, options(nomem, nostack)),
                    3 => asm!("mov {}, dr3", out(reg) value, options(nomem, nostack)),
                    6 => asm!("mov {}, dr6", out(reg) value, options(nomem, nostack)),
                    7 => asm!("mov {}, dr7", out(reg) value, options(nomem, nostack)),
                    _ => unreachable!("no debug register {n}"),
                }
            }
            value
        }

        fn set_dr(&mut self, n: usize, value: u64) {
            unsafe {
                match n {
                    0 => asm!("mov dr0, {}", in(reg) value, options(nomem, nostack)),
                    1 => asm!("mov dr1, {}", in(reg) value, options(nomem, nostack)),
                    2 => asm!("mov dr2, {}", in(reg) value, options(nomem, nostack)),
                    3 => asm!("mov dr3, {}", in(reg) value, options(nomem, nostack)),
                    6 => asm!("mov dr6, {}", in(reg) value, options(nomem, nostack)),
                    7 => asm!("mov dr7, {}", in(reg) value, options(nomem, nostack)),
                    _ => unreachable!("no debug register {n}"),
                }
            }
        }

        fn get_gdt(&mut self) -> DescriptorTableRegister {
            let mut image = [0u8; 10];
            unsafe {
                asm!("sgdt [{}]", in(reg) image.as_mut_ptr(), options(nostack));
            }
            DescriptorTableRegister::read_from_bytes(&image).unwrap_or_default()
        }

        fn set_gdt(&mut self, dtr: &DescriptorTableRegister) {
            let image = dtr.as_bytes();
            unsafe {
                asm!("lgdt [{}]", in(reg) image.as_ptr(), options(nostack));
            }
        }

        fn get_idt(&mut self) -> DescriptorTableRegister {
            let mut image = [0u8; 10];
            unsafe {
                asm!("sidt [{}]", in(reg) image.as_mut_ptr(), options(nostack));
            }
            DescriptorTableRegister::read_from_bytes(&image).unwrap_or_default()
        }

        fn set_idt(&mut self, dtr: &DescriptorTableRegister) {
            let image = dtr.as_bytes();
            unsafe {
                asm!("lidt [{}]", in(reg) image.as_ptr(), options(nostack));
            }
        }

        fn get_segment(&mut self, seg: SegmentRegister) -> Selector {
            let sel: u16;
            unsafe {
                match seg {
                    SegmentRegister::Cs => {
                        asm!("mov {0:x}, cs", out(reg) sel, options(nomem, nostack))
                    }
                    SegmentRegister::Ds => {
                        asm!("mov {0:x}, ds", out(reg) sel, options(nomem, nostack))
                    }
                    SegmentRegister::Es => {
                        asm!("mov {0:x}, es", out(reg) sel, options(nomem, nostack))
                    }
                    SegmentRegister::Fs => {
                        asm!("mov {0:x}, fs", out(reg) sel, options(nomem, nostack))
                    }
                    SegmentRegister::Gs => {
                        asm!("mov {0:x}, gs", out(reg) sel, options(nomem, nostack))
                    }
                    SegmentRegister::Ss => {
                        asm!("mov {0:x}, ss", out(reg) sel, options(nomem, nostack))
                    }
                }
            }
            Selector(sel)
        }

        fn set_segment(&mut self, seg: SegmentRegister, sel: Selector) {
            unsafe {
                match seg {
                    SegmentRegister::Cs => unreachable!("CS is not directly writable"),
                    SegmentRegister::Ds => {
                        asm!("mov ds, {0:x}", in(reg) sel.0, options(nostack))
                    }
                    SegmentRegister::Es => {
                        asm!("mov es, {0:x}", in(reg) sel.0, options(nostack))
                    }
                    SegmentRegister::Fs => {
                        asm!("mov fs, {0:x}", in(reg) sel.0, options(nostack))
                    }
                    SegmentRegister::Gs => {
                        asm!("mov gs, {0:x}", in(reg) sel.0, options(nostack))
                    }
                    SegmentRegister::Ss => {
                        asm!("mov ss, {0:x}", in(reg) sel.0, options(nostack))
                    }
                }
            }
        }

        fn get_ldt(&mut self) -> Selector {
            let sel: u16;
            unsafe {
                asm!("sldt {0:x}", out(reg) sel, options(nomem, nostack));
            }
            Selector(sel)
        }

        fn set_ldt(&mut self, sel: Selector) {
            unsafe {
                asm!("lldt {0:x}", in(reg) sel.0, options(nostack));
            }
        }

        fn get_tr(&mut self) -> Selector {
            let sel: u16;
            unsafe {
                asm!("str {0:x}", out(reg) sel, options(nomem, nostack));
            }
            Selector(sel)
        }

        fn set_tr(&mut self, sel: Selector) {
            unsafe {
                asm!("ltr {0:x}", in(reg) sel.0, options(nostack));
            }
        }

        fn rdmsr(&mut self, msr: u32) -> u64 {
            let (hi, lo): (u32, u32);
            unsafe {
                asm!(
                    "rdmsr",
                    in("ecx") msr,
                    out("eax") lo,
                    out("edx") hi,
                    options(nomem, nostack),
                );
            }
            (u64::from(hi) << 32) | u64::from(lo)
        }

        fn wrmsr(&mut self, msr: u32, value: u64) {
            let lo = value as u32;
            let hi = (value >> 32) as u32;
            unsafe {
                asm!(
                    "wrmsr",
                    in("ecx") msr,
                    in("eax") lo,
                    in("edx") hi,
                    options(nomem, nostack),
                );
            }
        }

        fn rdtsc(&mut self) -> u64 {
            let (hi, lo): (u32, u32);
            unsafe {
                asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
            }
            (u64::from(hi) << 32) | u64::from(lo)
        }

        fn vmxon(&mut self, region: Ma) -> bool {
            // CF set means VMfailInvalid, ZF set means VMfailValid; either
            // way root mode was not entered.
            let failed: u8;
            let region = region.0;
            unsafe {
                asm!(
                    "vmxon [{region}]",
                    "setc {fail}",
                    "setz {tmp}",
                    "or {fail}, {tmp}",
                    region = in(reg) &region,
                    fail = out(reg_byte) failed,
                    tmp = out(reg_byte) _,
                );
            }
            failed == 0
        }

        fn vmxoff(&mut self) {
            unsafe {
                asm!("vmxoff", options(nomem, nostack));
            }
        }

        fn vmptrst(&mut self) -> Ma {
            let mut vmcs: u64 = 0;
            unsafe {
                asm!("vmptrst [{}]", in(reg) &mut vmcs, options(nostack));
            }
            Ma(vmcs)
        }

        fn vmptrld(&mut self, vmcs: Ma) {
            let vmcs = vmcs.0;
            unsafe {
                asm!("vmptrld [{}]", in(reg) &vmcs, options(nostack));
            }
        }

        fn raise_interrupt(&mut self, vector: u8) {
            // `int imm8` cannot take a runtime vector, so jump into a table
            // of `int N; ret` triplets, one per vector.
            unsafe {
                let base = code::raise_interrupt_table_base();
                let entry = base.add(usize::from(vector) * 3);
                let f: extern "C" fn() = core::mem::transmute(entry);
                f();
            }
        }

        fn mmio_read32(&mut self, va: u64) -> u32 {
            unsafe { core::ptr::read_volatile(va as *const u32) }
        }

        fn mmio_write32(&mut self, va: u64, value: u32) {
            unsafe { core::ptr::write_volatile(va as *mut u32, value) }
        }

        unsafe fn host_to_vmm(&mut self, crosspage: *mut CrossPageData) {
            // The crosspage pointer rides in RCX for the benefit of the
            // entry code, which uses the same register protocol no matter
            // which C ABI built the caller; under SysV that makes it the
            // fourth argument.
            unsafe {
                code::ws_host_to_vmm(crosspage, 0, 0, crosspage);
            }
        }
    }
}
