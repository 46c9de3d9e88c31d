#[cfg(target_arch = "x86_64")]
mod arch {
    /// Register file as `ptrace(PTRACE_GETREGS/PTRACE_SETREGS)` sees it.
    pub type Regs = libc::user_regs_struct;

    /// Build the register file for an injected syscall from a saved snapshot.
    ///
    /// At a syscall-entry stop the kernel takes the syscall number from
    /// `orig_rax`; arguments one to six live in `rdi`, `rsi`, `rdx`, `r10`,
    /// `r8`, `r9`. Registers for arguments that are not given keep their
    /// snapshot values. More than six arguments is a programmer error.
    pub fn prepare_syscall(saved: &Regs, nr: u64, args: &[u64]) -> Regs {
        let mut regs = *saved;
        regs.orig_rax = nr;
        for (i, arg) in args.iter().enumerate() {
            match i {
                0 => regs.rdi = *arg,
                1 => regs.rsi = *arg,
                2 => regs.rdx = *arg,
                3 => regs.r10 = *arg,
                4 => regs.r8 = *arg,
                5 => regs.r9 = *arg,
                _ => panic!("too many syscall args"),
            }
        }
        regs
    }

    /// Return-value register after a syscall-exit stop.
    pub fn syscall_ret(regs: &Regs) -> u64 {
        regs.rax
    }
}

pub use arch::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    fn snapshot() -> Regs {
        let mut regs: Regs = unsafe { mem::zeroed() };
        regs.rip = 0x1000;
        regs.rax = 77;
        regs.rdi = 11;
        regs.rsi = 22;
        regs.rdx = 33;
        regs.r10 = 44;
        regs.r8 = 55;
        regs.r9 = 66;
        regs
    }

    #[test]
    fn test_prepare_syscall_maps_argument_registers() {
        let regs = prepare_syscall(&snapshot(), libc::SYS_getpid as u64, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(regs.orig_rax, libc::SYS_getpid as u64);
        assert_eq!(regs.rdi, 1);
        assert_eq!(regs.rsi, 2);
        assert_eq!(regs.rdx, 3);
        assert_eq!(regs.r10, 4);
        assert_eq!(regs.r8, 5);
        assert_eq!(regs.r9, 6);
        // everything else stays as captured
        assert_eq!(regs.rip, 0x1000);
        assert_eq!(regs.rax, 77);
    }

    #[test]
    fn test_prepare_syscall_keeps_argument_registers_when_absent() {
        let regs = prepare_syscall(&snapshot(), libc::SYS_getpid as u64, &[]);
        assert_eq!(regs.orig_rax, libc::SYS_getpid as u64);
        assert_eq!(regs.rdi, 11);
        assert_eq!(regs.rsi, 22);
        assert_eq!(regs.rdx, 33);
        assert_eq!(regs.r10, 44);
        assert_eq!(regs.r8, 55);
        assert_eq!(regs.r9, 66);
    }

    #[test]
    #[should_panic]
    fn test_prepare_syscall_rejects_seven_arguments() {
        prepare_syscall(&snapshot(), libc::SYS_getpid as u64, &[0; 7]);
    }
}
