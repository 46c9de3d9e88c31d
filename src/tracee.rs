use libc::{c_int, c_long, c_void, mode_t, off_t, pid_t};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use simple_error::{bail, require_with, try_with};
use std::mem;
use std::os::unix::prelude::RawFd;

use crate::cpu::{self, Regs};
use crate::result::{Error, Result};

/// Tracing states as driven by wait(2) notifications. The kernel only tags a
/// stop as "syscall", so the enter/exit distinction is derived from the
/// controller's own previous state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    SignalDelivery,
    SyscallEnter,
    SyscallExit,
    Exited,
    Killed,
}

/// Syscall return values above `2^64 - 4096` are negated kernel error numbers.
const MAX_ERRNO: u64 = 4095;

fn translate_return(rax: u64) -> std::result::Result<i64, Errno> {
    if rax > u64::MAX - MAX_ERRNO {
        Err(nix::errno::from_i32(-(rax as i64) as i32))
    } else {
        Ok(rax as i64)
    }
}

/// A foreign process driven at syscall granularity.
///
/// Between `setup` and `cleanup` the tracee's register file and address
/// space belong to us: the tracee is stopped whenever we touch them, and
/// every resume passes signal zero so no pending signal reaches it.
pub struct Tracee {
    pid: Pid,
    state: State,
    /// Captured at the first syscall-entry stop and written back after every
    /// injection, so the tracee's own in-flight syscall keeps its arguments.
    saved_regs: Option<Regs>,
    /// Signal from the most recent non-syscall stop. Recorded for debugging,
    /// never re-injected.
    saved_signal: Option<Signal>,
    /// Set once the first attach-induced SIGSTOP has been observed.
    attached: bool,
}

impl Tracee {
    pub fn new(pid: Pid) -> Tracee {
        Tracee {
            pid,
            state: State::Running,
            saved_regs: None,
            saved_signal: None,
            attached: false,
        }
    }

    /// Attach (or re-stop an already attached tracee) and enable
    /// `PTRACE_O_TRACESYSGOOD`, so syscall stops carry the 0x80-tagged trap
    /// and are distinguishable from signal-delivery stops.
    pub fn setup(&mut self) -> Result<()> {
        debug!("setup: attaching to {}", self.pid);
        match self.state {
            State::Exited | State::Killed => {
                bail!("process {} quit by being killed or exiting", self.pid)
            }
            State::Running => {
                if !self.attached {
                    try_with!(ptrace::attach(self.pid), "cannot attach to {}", self.pid);
                } else {
                    try_with!(
                        kill(self.pid, Signal::SIGSTOP),
                        "cannot send SIGSTOP to {}",
                        self.pid
                    );
                }
                self.wait_child()?;
            }
            _ => {}
        }

        try_with!(
            ptrace::setoptions(self.pid, Options::PTRACE_O_TRACESYSGOOD),
            "cannot set ptrace options for {}",
            self.pid
        );
        Ok(())
    }

    /// Detach; the tracee continues on its own. The register snapshot does
    /// not outlive the attached window.
    pub fn cleanup(&mut self) -> Result<()> {
        match self.state {
            State::Exited | State::Killed => {
                bail!("process {} quit by being killed or exiting", self.pid)
            }
            State::Running => {
                if !self.attached {
                    return Ok(());
                }
                try_with!(
                    kill(self.pid, Signal::SIGSTOP),
                    "cannot send SIGSTOP to {}",
                    self.pid
                );
                self.wait_child()?;
            }
            _ => {}
        }

        try_with!(
            ptrace::detach(self.pid, None),
            "cannot detach from {}",
            self.pid
        );
        self.attached = false;
        self.saved_regs = None;
        self.saved_signal = None;
        debug!("cleanup: detached from {}", self.pid);
        Ok(())
    }

    /// Block until the next stop of the tracee and classify it.
    fn wait_child(&mut self) -> Result<()> {
        debug!("wait for {} in state {:?}", self.pid, self.state);
        let status = try_with!(
            waitpid(self.pid, Some(WaitPidFlag::__WALL)),
            "cannot wait for tracee {}",
            self.pid
        );

        match status {
            WaitStatus::Exited(_, code) => {
                self.state = State::Exited;
                debug!("tracee exited with status {}", code);
            }
            WaitStatus::Signaled(_, Signal::SIGKILL, _) => {
                // the one signal nobody can suppress
                self.state = State::Killed;
                debug!("tracee was killed");
            }
            WaitStatus::Signaled(_, signal, _) => {
                panic!(
                    "tracee terminated by {} although every signal is suppressed",
                    signal
                );
            }
            WaitStatus::PtraceSyscall(_) => {
                // the enter/exit toggle, keyed off our own previous state
                if self.state != State::SyscallEnter {
                    self.state = State::SyscallEnter;
                } else {
                    self.state = State::SyscallExit;
                }
                debug!("syscall stop: {:?}", self.state);
            }
            WaitStatus::Stopped(_, signal) => {
                if !self.attached && signal == Signal::SIGSTOP {
                    self.attached = true;
                }
                self.saved_signal = Some(signal);
                self.state = State::SignalDelivery;
                debug!("signal-delivery stop: {}", signal);
            }
            WaitStatus::Continued(_) => {
                panic!("waitpid reported a continued tracee without WCONTINUED");
            }
            status => {
                panic!("unexpected wait status: {:?}", status);
            }
        }
        Ok(())
    }

    /// Drive the tracee forward until it sits in a syscall-entry stop, then
    /// capture the register snapshot if this is the first entry observed.
    fn catch_syscall(&mut self) -> Result<()> {
        while self.state != State::SyscallEnter {
            match self.state {
                State::Exited | State::Killed => {
                    bail!("tracee {} died while waiting for a syscall", self.pid)
                }
                State::SignalDelivery => {
                    if let Some(signal) = self.saved_signal {
                        debug!("dropping pending {} for {}", signal, self.pid);
                    }
                }
                _ => {}
            }
            // resume with signal zero: whatever was pending is discarded
            try_with!(
                ptrace::syscall(self.pid, None),
                "cannot resume tracee {}",
                self.pid
            );
            self.wait_child()?;
        }

        if self.saved_regs.is_none() {
            let regs = try_with!(
                ptrace::getregs(self.pid),
                "cannot read registers of {}",
                self.pid
            );
            self.saved_regs = Some(regs);
        }
        Ok(())
    }

    /// Invoke a syscall inside the tracee as if the tracee had made it.
    ///
    /// Waits for the next syscall-entry stop, ghost-writes number and
    /// arguments into the register file, resumes to the paired syscall-exit
    /// stop, reads the result and writes the original snapshot back.
    pub fn remote_syscall(&mut self, nr: c_long, args: &[u64]) -> Result<i64> {
        debug!("inject syscall nr={} args={:?} into {}", nr, args, self.pid);
        self.catch_syscall()?;

        let saved = require_with!(self.saved_regs, "no register snapshot for {}", self.pid);
        let regs = cpu::prepare_syscall(&saved, nr as u64, args);
        try_with!(
            ptrace::setregs(self.pid, regs),
            "cannot write registers of {}",
            self.pid
        );
        try_with!(
            ptrace::syscall(self.pid, None),
            "cannot resume tracee {}",
            self.pid
        );

        // TRACESYSGOOD guarantees the matching syscall-exit stop comes next
        self.wait_child()?;
        if self.state != State::SyscallExit {
            bail!(
                "expected a syscall-exit stop for {}, tracee is {:?}",
                self.pid,
                self.state
            );
        }

        let result = try_with!(
            ptrace::getregs(self.pid),
            "cannot read syscall result of {}",
            self.pid
        );
        try_with!(
            ptrace::setregs(self.pid, saved),
            "cannot restore registers of {}",
            self.pid
        );

        let ret = cpu::syscall_ret(&result);
        debug!("syscall nr={} returned {}", nr, ret as i64);
        translate_return(ret).map_err(Error::from)
    }

    /// Copy bytes into the tracee's address space with `PTRACE_POKEDATA`.
    /// A trailing partial word is read-modified-written so the tracee's
    /// bytes beyond the copy survive.
    pub fn remote_memcpy(&mut self, src: &[u8], addr: u64) -> Result<()> {
        let word = mem::size_of::<c_long>();
        for (i, chunk) in src.chunks(word).enumerate() {
            let dest = (addr as usize + i * word) as *mut c_void;
            let data = if chunk.len() == word {
                let mut bytes = [0u8; mem::size_of::<c_long>()];
                bytes.copy_from_slice(chunk);
                c_long::from_ne_bytes(bytes)
            } else {
                let old = match ptrace::read(self.pid, dest) {
                    Ok(old) => old,
                    Err(errno) => {
                        error!("cannot read from tracee memory: {}", errno);
                        return Err(Error::Sys(errno));
                    }
                };
                let mut bytes = old.to_ne_bytes();
                bytes[..chunk.len()].copy_from_slice(chunk);
                c_long::from_ne_bytes(bytes)
            };
            if let Err(errno) = unsafe { ptrace::write(self.pid, dest, data as *mut c_void) } {
                error!("cannot write to tracee memory: {}", errno);
                return Err(Error::Sys(errno));
            }
        }
        Ok(())
    }

    pub fn fcntl(&mut self, fd: RawFd, cmd: c_int) -> Result<c_int> {
        self.remote_syscall(libc::SYS_fcntl, &[fd as u64, cmd as u64])
            .map(|v| v as c_int)
    }

    pub fn mmap(
        &mut self,
        addr: u64,
        length: usize,
        prot: c_int,
        flags: c_int,
        fd: RawFd,
        offset: off_t,
    ) -> Result<u64> {
        self.remote_syscall(
            libc::SYS_mmap,
            &[
                addr,
                length as u64,
                prot as u64,
                flags as u64,
                fd as u64,
                offset as u64,
            ],
        )
        .map(|v| v as u64)
    }

    /// `pathname` is an address inside the tracee, not in this process.
    pub fn open(&mut self, pathname: u64, flags: c_int, mode: mode_t) -> Result<RawFd> {
        self.remote_syscall(libc::SYS_open, &[pathname, flags as u64, mode as u64])
            .map(|v| v as RawFd)
    }

    pub fn dup2(&mut self, oldfd: RawFd, newfd: RawFd) -> Result<RawFd> {
        self.remote_syscall(libc::SYS_dup2, &[oldfd as u64, newfd as u64])
            .map(|v| v as RawFd)
    }

    pub fn close(&mut self, fd: RawFd) -> Result<()> {
        self.remote_syscall(libc::SYS_close, &[fd as u64]).map(drop)
    }

    pub fn munmap(&mut self, addr: u64, length: usize) -> Result<()> {
        self.remote_syscall(libc::SYS_munmap, &[addr, length as u64])
            .map(drop)
    }

    pub fn getpid(&mut self) -> Result<pid_t> {
        self.remote_syscall(libc::SYS_getpid, &[])
            .map(|v| v as pid_t)
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        match ptrace::detach(self.pid, None) {
            // ESRCH: the tracee is already gone
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!("cannot detach from tracee {}: {}", self.pid, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_translate_return_boundaries() {
        assert_eq!(translate_return(0), Ok(0));
        assert_eq!(translate_return(42), Ok(42));
        // largest non-error value
        assert_eq!(
            translate_return(u64::MAX - 4095),
            Ok((u64::MAX - 4095) as i64)
        );
        assert_eq!(translate_return(u64::MAX), Err(Errno::EPERM));
        assert_eq!(
            translate_return(-(libc::ENOENT as i64) as u64),
            Err(Errno::ENOENT)
        );
    }

    #[test]
    fn test_remote_getpid() {
        // cat blocks in read(2); the interrupted read restarts on resume and
        // hands us a syscall-entry stop to hijack
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("cannot spawn cat");
        let pid = Pid::from_raw(child.id() as i32);

        let mut tracee = Tracee::new(pid);
        tracee.setup().expect("cannot attach to child");
        let remote_pid = tracee.getpid().expect("remote getpid failed");
        assert_eq!(remote_pid, pid.as_raw());
        tracee.cleanup().expect("cannot detach from child");

        child.kill().expect("cannot kill child");
        child.wait().expect("cannot reap child");
    }

    #[test]
    fn test_remote_syscall_reports_errno() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("cannot spawn cat");
        let pid = Pid::from_raw(child.id() as i32);

        let mut tracee = Tracee::new(pid);
        tracee.setup().expect("cannot attach to child");
        match tracee.close(-1) {
            Err(Error::Sys(errno)) => assert_eq!(errno, Errno::EBADF),
            other => panic!("expected EBADF from remote close(-1), got {:?}", other.err()),
        }
        tracee.cleanup().expect("cannot detach from child");

        child.kill().expect("cannot kill child");
        child.wait().expect("cannot reap child");
    }
}
