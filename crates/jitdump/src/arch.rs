//! Per-architecture constants used by the jitdump header and the unwind
//! emitter.

use gimli::Register;

/// Size of a machine pointer on the target.
pub const POINTER_SIZE: usize = size_of::<usize>();

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// ELF machine identifier recorded in the jitdump file header.
        pub const ELF_MACHINE: u32 = object::elf::EM_X86_64 as u32;
        /// DWARF number of the stack pointer register.
        pub const REG_SP: Register = gimli::X86_64::RSP;
        /// DWARF number of the return address register.
        pub const REG_RA: Register = gimli::X86_64::RA;
    } else if #[cfg(target_arch = "aarch64")] {
        /// ELF machine identifier recorded in the jitdump file header.
        pub const ELF_MACHINE: u32 = object::elf::EM_AARCH64 as u32;
        /// DWARF number of the stack pointer register.
        pub const REG_SP: Register = gimli::AArch64::SP;
        /// DWARF number of the return address register.
        pub const REG_RA: Register = gimli::AArch64::X30;
    } else {
        compile_error!("jitdump emission supports only x86-64 and aarch64");
    }
}
