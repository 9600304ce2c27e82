//! The pseudo-TSC (PTSC): a per-VM monotonic time source kept coherent
//! across worldswitches and across VCPUs.
//!
//! While a VCPU thread runs inside the monitor it cannot call the host's
//! reference clock, so it computes time as `tsc + add`.  The engine's job
//! is picking `add` on every entry such that:
//!
//! - a VCPU never observes PTSC going backwards across a switch pair,
//! - all VCPUs concurrently inside the monitor use the *same* offset when
//!   the hardware TSCs are synchronized (so their PTSCs are mutually
//!   monotonic), and
//! - a TSC reset (host standby, broken firmware) degrades to reference-
//!   clock-based PTSC instead of time travel.
//!
//! The shared offset is coordinated through one packed atomic,
//! `{vcpuid, in_vmm_cnt}`: the count of threads currently in the monitor
//! lives in the low dword so leaving threads can decrement it with a plain
//! atomic subtract, and the high dword names the VCPU whose published
//! offset everyone currently entering must adopt.  The offset itself may
//! only change while the count is zero.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::{VcpuId, cpu::Cpu, crosspage::CrossPageData, host::HostTime};

/// Multiplier on the PTSC rate used to detect an absurd forward jump
/// (which really means the TSC went backwards underneath us).
const LARGE_DELTA_SECONDS: u64 = 4096;

/// Per-VM PTSC coordination state.
pub struct PtscState {
    /// Packed `{vcpuid: high dword, in_vmm_cnt: low dword}`.
    offset_info: AtomicU64,

    /// Upper bound on any PTSC value the monitor may have computed.
    latest: AtomicU64,

    /// Per-VCPU published offsets; slot `v` is written only while
    /// `in_vmm_cnt == 0` and read only after `v` was advertised.
    offsets: Box<[AtomicU64]>,
}

impl PtscState {
    /// Creates the coordination state for `num_vcpus` VCPUs.
    pub fn new(num_vcpus: usize) -> PtscState {
        PtscState {
            offset_info: AtomicU64::new(0),
            latest: AtomicU64::new(0),
            offsets: (0..num_vcpus).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// The latest PTSC any monitor may have observed.
    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// Number of VCPU threads currently inside the monitor.
    pub fn in_vmm_count(&self) -> u32 {
        self.offset_info.load(Ordering::Acquire) as u32
    }
}

fn conv_begin_write(cp: &mut CrossPageData) {
    cp.pseudo_tsc_conv.version = cp.pseudo_tsc_conv.version.wrapping_add(1);
    fence(Ordering::Release);
}

fn conv_end_write(cp: &mut CrossPageData) {
    fence(Ordering::Release);
    cp.pseudo_tsc_conv.version = cp.pseudo_tsc_conv.version.wrapping_add(1);
}

/// Resets the conversion to identity at crosspage init.
pub(crate) fn reset_conversion(cp: &mut CrossPageData) {
    conv_begin_write(cp);
    cp.pseudo_tsc_conv.mult = 1;
    cp.pseudo_tsc_conv.shift = 0;
    cp.pseudo_tsc_conv.add = 0;
    conv_end_write(cp);
}

/// Refreshes the PTSC conversion on the way into the monitor.
///
/// Runs with interrupts disabled on the pCPU the monitor will use, so the
/// `rdtsc` here reads the TSC the monitor is about to read.
pub fn update_parameters<H: HostTime, C: Cpu>(
    host: &H,
    cpu: &mut C,
    state: &PtscState,
    cp: &mut CrossPageData,
    vcpuid: VcpuId,
) {
    let mut ptsc = host.pseudo_tsc();

    // Unsigned comparison tests ptsc inside
    // [worldSwitchPTSC, worldSwitchPTSC + largeDelta): a huge apparent
    // delta means the clock basis jumped (TSC reset, standby, bad rate
    // estimate) rather than that much time passing between switches.
    if ptsc.wrapping_sub(cp.world_switch_ptsc) > host.pseudo_tsc_hz() * LARGE_DELTA_SECONDS {
        if host.set_pseudo_tsc_use_ref_clock() {
            ptsc = host.pseudo_tsc();
        }

        // If still behind by less than a second, the reference clock is
        // just coarse; hold PTSC at its high-water mark rather than
        // stepping backwards on this VCPU.
        if cp.world_switch_ptsc.wrapping_sub(ptsc) < host.pseudo_tsc_hz() {
            ptsc = cp.world_switch_ptsc;
        }
    }

    let tsc = cpu.rdtsc();

    if host.hw_tscs_synced() {
        let mut adopted_vcpuid;
        loop {
            let old = state.offset_info.load(Ordering::Acquire);
            let in_vmm_cnt = old as u32;
            adopted_vcpuid = (old >> 32) as u32;

            if in_vmm_cnt == 0 {
                let offset = if host.pseudo_tsc_uses_ref_clock() {
                    // Must read latest after offset_info: a leaving thread
                    // publishes latest before its decrement.
                    let latest = state.latest.load(Ordering::Acquire);
                    if ptsc < latest {
                        ptsc = latest;
                    }
                    ptsc.wrapping_sub(tsc)
                } else {
                    host.pseudo_tsc_offset()
                };

                // No other thread reads our slot until in_vmm_cnt > 0.
                state.offsets[vcpuid.0 as usize].store(offset, Ordering::Release);
                adopted_vcpuid = vcpuid.0;
            }

            let new = (u64::from(adopted_vcpuid) << 32) | u64::from(in_vmm_cnt + 1);
            if state
                .offset_info
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let add = state.offsets[adopted_vcpuid as usize].load(Ordering::Acquire);
        conv_begin_write(cp);
        cp.pseudo_tsc_conv.add = add;
        conv_end_write(cp);

        // Derive the cached PTSC from the TSC: the TSC-based PTSC may
        // drift from the reference clock over the short term, and the
        // monitor's view is the one that must not regress.
        ptsc = tsc.wrapping_add(add);
    } else {
        conv_begin_write(cp);
        cp.pseudo_tsc_conv.add = ptsc.wrapping_sub(tsc);
        conv_end_write(cp);
    }

    cp.world_switch_ptsc = ptsc;
}

/// Records a conservative upper bound on the PTSC the monitor used, then
/// drops out of the in-monitor count.  Runs on the way back to the host.
pub fn update_latest<H: HostTime, C: Cpu>(
    host: &H,
    cpu: &mut C,
    state: &PtscState,
    cp: &CrossPageData,
) {
    if !host.hw_tscs_synced() {
        return;
    }

    // Not worldSwitchPTSC: callees on the exit path may have computed
    // fresher PTSC values from the TSC.
    let ptsc = cpu.rdtsc().wrapping_add(cp.pseudo_tsc_conv.add);
    let mut latest = state.latest.load(Ordering::Acquire);
    while ptsc > latest {
        match state.latest.compare_exchange(
            latest,
            ptsc,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(observed) => latest = observed,
        }
    }

    // in_vmm_cnt is the low dword, so a plain decrement of the packed
    // word takes this thread out of the count.
    state.offset_info.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
#[path = "ptsc_tests.rs"]
mod ptsc_tests;
