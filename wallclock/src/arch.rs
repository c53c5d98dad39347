//! Architecture-specific pieces of context inspection: the encoded syscall
//! instruction and the registers of interest in a saved `ucontext_t`.

#[cfg(target_arch = "x86_64")]
mod imp {
    /// Encoded width of the `syscall` instruction (`0F 05`).
    pub const SYSCALL_WIDTH: usize = 2;

    pub fn is_syscall(op: &[u8; SYSCALL_WIDTH]) -> bool {
        op == &[0x0f, 0x05]
    }

    /// # Safety
    /// `uc` must point to a live `ucontext_t` saved by the kernel.
    pub unsafe fn program_counter(uc: *const libc::ucontext_t) -> usize {
        (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }

    /// Syscall return value slot (RAX) of the saved context.
    ///
    /// # Safety
    /// `uc` must point to a live `ucontext_t` saved by the kernel.
    pub unsafe fn syscall_result(uc: *const libc::ucontext_t) -> i64 {
        (*uc).uc_mcontext.gregs[libc::REG_RAX as usize] as i64
    }
}

#[cfg(target_arch = "aarch64")]
mod imp {
    /// Encoded width of the `svc #0` instruction.
    pub const SYSCALL_WIDTH: usize = 4;

    pub fn is_syscall(op: &[u8; SYSCALL_WIDTH]) -> bool {
        u32::from_le_bytes(*op) == 0xd400_0001
    }

    /// # Safety
    /// `uc` must point to a live `ucontext_t` saved by the kernel.
    pub unsafe fn program_counter(uc: *const libc::ucontext_t) -> usize {
        (*uc).uc_mcontext.pc as usize
    }

    /// Syscall return value slot (X0) of the saved context.
    ///
    /// # Safety
    /// `uc` must point to a live `ucontext_t` saved by the kernel.
    pub unsafe fn syscall_result(uc: *const libc::ucontext_t) -> i64 {
        (*uc).uc_mcontext.regs[0] as i64
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("wallclock supports x86_64 and aarch64 only");

pub use imp::{is_syscall, program_counter, syscall_result, SYSCALL_WIDTH};

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn recognizes_syscall_opcode() {
        assert!(is_syscall(&[0x0f, 0x05]));
        assert!(!is_syscall(&[0x90, 0x90])); // nop; nop
        assert!(!is_syscall(&[0x0f, 0x04]));
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn recognizes_syscall_opcode() {
        assert!(is_syscall(&0xd400_0001u32.to_le_bytes()));
        assert!(!is_syscall(&0xd503_201fu32.to_le_bytes())); // nop
    }
}
