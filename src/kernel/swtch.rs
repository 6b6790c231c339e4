// Context switch:
//
//   swtch(&old, new);
//
// Save the current callee-saved registers on the stack as a
// Context, store its address in *old, then switch to new's stack
// and pop its registers. Returns on the new context's stack.

use crate::proc::Context;

#[cfg(all(target_os = "none", target_arch = "x86"))]
core::arch::global_asm!(
    r#"
    .globl swtch
    swtch:
        mov eax, [esp + 4]
        mov edx, [esp + 8]

        push ebp
        push ebx
        push esi
        push edi

        mov [eax], esp
        mov esp, edx

        pop edi
        pop esi
        pop ebx
        pop ebp
        ret
"#
);

#[cfg(target_os = "none")]
extern "C" {
    pub fn swtch(old: *mut *mut Context, new: *mut Context);
}

// Hosted builds never run the scheduler; the stub keeps the core
// compiling for tests.
#[cfg(not(target_os = "none"))]
pub unsafe fn swtch(_old: *mut *mut Context, _new: *mut Context) {
    unreachable!("swtch: context switch is target-specific");
}
