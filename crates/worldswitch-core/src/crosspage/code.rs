//! The crosspage code page.
//!
//! One page of position-fixed machine code shared by the host and the
//! monitor: the four switch-IDT exception handlers, the two world-switch
//! entry points, and their shared return trampoline.  The page is linked
//! into this driver and additionally mapped into every monitor address
//! space at the same host linear address by the page-table patch engine,
//! so the identical byte sequence executes under either CR3.
//!
//! The exception handlers locate their data page by reading IDTR (`sidt`)
//! and rounding down to a page boundary: to be running here at all, the CPU
//! must have vectored through the switch IDT, and that IDT lives inside the
//! crosspage data page.
//!
//! The monitor-to-host entry addresses the data page with an absolute
//! displacement of its fixed monitor-side address; the monitor occupies the
//! top 64 MiB of the address space precisely so such displacements fit in a
//! sign-extended 32-bit immediate.

use std::mem::offset_of;

use crate::La;

use super::data::CrossPageData;

unsafe extern "C" {
    /// First byte of the crosspage code page.
    pub static ws_crosspage_code_begin: u8;

    /// First byte past the crosspage code.
    pub static ws_crosspage_code_end: u8;

    /// `#DB` handler.
    pub static ws_switch_db_handler: u8;

    /// `#NMI` handler.
    pub static ws_switch_nmi_handler: u8;

    /// `#UD` handler.
    pub static ws_switch_ud_handler: u8;

    /// `#MC` handler.
    pub static ws_switch_mc_handler: u8;

    /// Host-to-monitor switch.  The crosspage pointer is passed both as the
    /// first argument (Microsoft ABI) and the fourth (System V ABI), so the
    /// entry code finds it in RCX either way.
    pub fn ws_host_to_vmm(
        crosspage: *mut CrossPageData,
        unused1: u64,
        unused2: u64,
        crosspage_again: *mut CrossPageData,
    );

    /// Monitor-to-host switch; the monitor calls this through
    /// `CrossPageData::vmm_to_host_la`.
    pub fn ws_vmm_to_host();

    /// 256 `int N; ret` triplets, indexed by vector.
    static ws_raise_interrupt_table: u8;
}

/// Host linear address of the crosspage code page.
pub fn code_begin_la() -> La {
    // Taking the address of an extern symbol never reads it.
    La(unsafe { &raw const ws_crosspage_code_begin } as u64)
}

/// Host linear address of the end of the crosspage code.
pub fn code_end_la() -> La {
    La(unsafe { &raw const ws_crosspage_code_end } as u64)
}

/// Host linear address of the monitor-to-host entry point.
pub fn vmm_to_host_la() -> La {
    La(ws_vmm_to_host as usize as u64)
}

/// Host linear address of the switch-IDT handler for `vector`.
///
/// Only the four handled vectors have handlers; everything else returns the
/// `#UD` handler so a stray gate would at least be observable.
pub fn handler_la(vector: u8) -> La {
    let sym = unsafe {
        match vector {
            1 => &raw const ws_switch_db_handler,
            2 => &raw const ws_switch_nmi_handler,
            18 => &raw const ws_switch_mc_handler,
            _ => &raw const ws_switch_ud_handler,
        }
    };
    La(sym as u64)
}

/// Base of the software-interrupt dispatch table.
pub(crate) fn raise_interrupt_table_base() -> *const u8 {
    unsafe { &raw const ws_raise_interrupt_table }
}

/// Checks that the crosspage code fits within one page: the begin and end
/// symbols must land on the same page.
pub fn code_fits_one_page() -> bool {
    code_begin_la().lpn() == code_end_la().lpn()
}

core::arch::global_asm!(
    r#"
.pushsection .text.ws_crosspage, "ax"
.balign 4096

.global ws_crosspage_code_begin
ws_crosspage_code_begin:

// ---------------------------------------------------------------------------
// #DB handler.
//
// Fires either because the host kernel had DR7.GD set when the driver saved
// the debug registers, or on every instruction when the trap flag is set.
// In the GD case the witness is recorded and the handler returns without
// re-enabling NMIs.  In the TF case a real iretq is unavoidable: RF must be
// set in the return frame to guarantee forward progress, and only iretq
// honors it.
//
// Frame: 0(rsp)=RIP 8(rsp)=CS 16(rsp)=RFLAGS 24(rsp)=RSP 32(rsp)=SS
// ---------------------------------------------------------------------------
.p2align 4
.global ws_switch_db_handler
ws_switch_db_handler:
    push    rax
    call    .Lws_get_cross_page_data
    add     rax, {ws_exception} + 1
    mov     byte ptr [rax], 1
    pop     rax
    test    dword ptr [rsp + 16], {eflags_tf}
    jz      .Lws_return_no_nmi
    or      dword ptr [rsp + 16], {eflags_rf}
    int     2
    iretq

// ---------------------------------------------------------------------------
// #UD handler.
//
// Records the witness.  A #UD from the monitor range or from the crosspage
// itself is a deliberate ud2: remember its RIP, skip the two-byte opcode,
// and resume.  A #UD from anywhere else mirrors the host kernel's own
// treatment of an invalid opcode in kernel text: halt.
// ---------------------------------------------------------------------------
.p2align 4
.global ws_switch_ud_handler
ws_switch_ud_handler:
    push    rax
    push    rbx
    push    rcx
    call    .Lws_get_cross_page_data
    mov     ecx, {ws_exception} + 6
    mov     byte ptr [rax + rcx], 1
    cmp     qword ptr [rsp + 24], {monitor_start}
    jae     .Lws_ud_known_context
    mov     rbx, [rsp + 24]
    and     rbx, {page_mask}
    mov     ecx, {crosspage_code_la}
    cmp     rbx, [rax + rcx]
    je      .Lws_ud_known_context
    cli
    hlt
.Lws_ud_known_context:
    mov     rbx, [rsp + 24]
    mov     ecx, {ws_ud2}
    mov     [rax + rcx], rbx
    add     qword ptr [rsp + 24], 2
    pop     rcx
    pop     rbx
    pop     rax
    jmp     .Lws_return_no_nmi

// ---------------------------------------------------------------------------
// #NMI handler.
//
// Records the witness and returns while keeping NMI delivery inhibited:
// as long as no iret executes, the CPU blocks further NMIs, which is the
// only thing standing between the switch path and a recursive NMI on a
// half-formed stack.
// ---------------------------------------------------------------------------
.p2align 4
.global ws_switch_nmi_handler
ws_switch_nmi_handler:
    push    rax
    call    .Lws_get_cross_page_data
    add     rax, {ws_exception} + 2
    mov     byte ptr [rax], 1
    pop     rax
    jmp     .Lws_return_no_nmi

// ---------------------------------------------------------------------------
// #MC handler.
// ---------------------------------------------------------------------------
.p2align 4
.global ws_switch_mc_handler
ws_switch_mc_handler:
    push    rax
    call    .Lws_get_cross_page_data
    add     rax, {ws_exception} + 18
    mov     byte ptr [rax], 1
    pop     rax
    jmp     .Lws_return_no_nmi

// ---------------------------------------------------------------------------
// Return from a switch exception without enabling NMIs.
//
// iretq would lift the CPU's internal NMI blocking, so rebuild the
// interrupted frame on the interrupted stack and leave with popfq + lretq
// instead.  Entered by jump with the hardware frame at 0(rsp).
// ---------------------------------------------------------------------------
.p2align 4
.Lws_return_no_nmi:
    push    rbp
    push    rax
    mov     rbp, [rsp + 40]
    sub     rbp, 32
    mov     rax, [rsp + 24]
    mov     [rbp + 24], rax
    mov     rax, [rsp + 16]
    mov     [rbp + 16], rax
    mov     rax, [rsp + 32]
    mov     [rbp + 8], rax
    mov     rax, [rsp + 8]
    mov     [rbp], rax
    pop     rax
    mov     rsp, rbp
    pop     rbp
    popfq
    retfq

// ---------------------------------------------------------------------------
// Host to monitor.
//
// Entered with the crosspage address in RCX and the return address on the
// host stack.  Saves the host context into the crosspage, loads the
// monitor context, switches to the crossGDT, and flips CR3 last so every
// stack access before the TLB flush still went through host translations.
// Preserves RBX, RSI, RDI, RBP, RSP, R12..R15 (the union of both C ABIs'
// callee-saved sets).
// ---------------------------------------------------------------------------
.p2align 4
.global ws_host_to_vmm
ws_host_to_vmm:
    push    qword ptr [rsp]
    mov     word ptr [rsp + 8], cs

    mov     rax, rsp
    lea     rsp, [rcx + {host_context_empty}]
    mov     dx, ss
    push    dx
    push    rax
    push    r15
    push    r14
    push    r13
    push    r12
    push    rdi
    push    rsi
    push    rbp
    push    rbx
    mov     rax, cr3
    push    rax

    lea     rsp, [rcx + {mon_context_full}]
    pop     rsi
    pop     rbx
    pop     rbp
    pop     r12
    pop     r13
    pop     r14
    pop     r15
    pop     rax
    pop     dx
    lgdt    [rcx + {cross_gdt_desc}]
    mov     cr3, rsi
    mov     ds, dx
    mov     es, dx
    mov     ss, dx
    mov     rsp, rax

    retfq

// ---------------------------------------------------------------------------
// Monitor to host.
//
// The mirror image.  The crosspage is found through its fixed monitor-side
// address; the switch IDT is re-pointed at its host linear address before
// CR3 changes back.  DF is cleared on the way out because Microsoft
// calling conventions assume it.
// ---------------------------------------------------------------------------
.p2align 4
.global ws_vmm_to_host
ws_vmm_to_host:
    mov     rcx, {cross_page_data_la} + {crosspage_data_la}
    mov     rcx, [rcx]

    push    qword ptr [rsp]
    mov     word ptr [rsp + 8], cs

    mov     rax, rsp
    lea     rsp, [rcx + {mon_context_empty}]
    mov     dx, ss
    push    dx
    push    rax
    push    r15
    push    r14
    push    r13
    push    r12
    push    rbp
    push    rbx
    mov     rax, cr3
    push    rax

    lea     rsp, [rcx + {host_context_full}]
    pop     r9
    pop     rbx
    pop     rbp
    pop     rsi
    pop     rdi
    pop     r12
    pop     r13
    pop     r14
    pop     r15
    pop     rax
    pop     dx
    lgdt    [rcx + {cross_gdt_desc}]
    lidt    [rcx + {switch_host_idtr}]
    mov     cr3, r9
    mov     ds, dx
    mov     es, dx
    mov     ss, dx
    mov     rsp, rax

    cld
    retfq

// ---------------------------------------------------------------------------
// Locate the crosspage data page from inside an exception handler.
//
// The switch IDT lives in the data page, so IDTR.base rounded down to page
// alignment is the data page.  Returns the page address in RAX; clobbers
// RFLAGS, which the hardware frame already preserves.
// ---------------------------------------------------------------------------
.p2align 4
.Lws_get_cross_page_data:
    sub     rsp, 16
    sidt    [rsp]
    mov     rax, [rsp + 2]
    add     rsp, 16
    and     rax, {page_mask}
    ret

.global ws_crosspage_code_end
ws_crosspage_code_end:

.popsection
"#,
    ws_exception = const offset_of!(CrossPageData, ws_exception),
    ws_ud2 = const offset_of!(CrossPageData, ws_ud2),
    crosspage_data_la = const offset_of!(CrossPageData, crosspage_data_la),
    crosspage_code_la = const offset_of!(CrossPageData, crosspage_code_la),
    cross_gdt_desc = const offset_of!(CrossPageData, cross_gdt_hkla_desc),
    switch_host_idtr = const offset_of!(CrossPageData, switch_host_idtr),
    host_context_empty = const offset_of!(CrossPageData, host_ds),
    host_context_full = const offset_of!(CrossPageData, host_cr3),
    mon_context_empty = const offset_of!(CrossPageData, mon_ds),
    mon_context_full = const offset_of!(CrossPageData, mon_cr3),
    monitor_start = const crate::layout::MONITOR_LINEAR_START.0 as i64,
    cross_page_data_la = const crate::layout::CROSS_PAGE_DATA_LA.0 as i64,
    page_mask = const -4096i64,
    eflags_tf = const 0x100u32,
    eflags_rf = const 0x10000u32,
);

// The software-interrupt dispatch table: int takes only an immediate
// vector, so the driver indexes into 256 three-byte `int N; ret` stubs.
core::arch::global_asm!(
    r#"
.pushsection .text.ws_raise, "ax"
.balign 16
.global ws_raise_interrupt_table
ws_raise_interrupt_table:
.set ws_vector, 0
.rept 256
    .byte 0xcd
    .byte ws_vector
    .byte 0xc3
    .set ws_vector, ws_vector + 1
.endr
.popsection
"#
);
