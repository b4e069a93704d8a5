//! The assembled trampoline template.
//!
//! The template is a single stub that forwards its first three arguments to
//! the evaluator passed as its fourth, then returns the evaluator's result.
//! It keeps a frame-pointer-friendly prologue so profilers can unwind
//! through it with nothing but the frame chain. Every arena slot starts with
//! an exact copy of these bytes; the copies differ only in address, which is
//! precisely the point.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        core::arch::global_asm!(
            ".text",
            ".balign 16",
            ".globl opal_trampoline_start",
            ".hidden opal_trampoline_start",
            ".globl opal_trampoline_end",
            ".hidden opal_trampoline_end",
            "opal_trampoline_start:",
            "sub rsp, 8",
            "call rcx",
            "add rsp, 8",
            "ret",
            "opal_trampoline_end:",
        );
    } else if #[cfg(target_arch = "aarch64")] {
        core::arch::global_asm!(
            ".text",
            ".balign 16",
            ".globl opal_trampoline_start",
            ".hidden opal_trampoline_start",
            ".globl opal_trampoline_end",
            ".hidden opal_trampoline_end",
            "opal_trampoline_start:",
            "stp x29, x30, [sp, #-16]!",
            "mov x29, sp",
            "blr x3",
            "ldp x29, x30, [sp], #16",
            "ret",
            "opal_trampoline_end:",
        );
    } else {
        compile_error!("the perf trampoline supports only x86-64 and aarch64");
    }
}

unsafe extern "C" {
    static opal_trampoline_start: u8;
    static opal_trampoline_end: u8;
}

/// The template machine code copied into every arena slot.
pub fn template() -> &'static [u8] {
    unsafe {
        let start = &raw const opal_trampoline_start;
        let end = &raw const opal_trampoline_end;
        core::slice::from_raw_parts(start, end.addr() - start.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_nonempty_and_small() {
        let code = template();
        assert!(!code.is_empty());
        // The stub is a handful of instructions; anything bigger means the
        // symbols drifted apart.
        assert!(code.len() <= 64);
    }
}
