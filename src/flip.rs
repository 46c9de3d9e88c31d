use libc::c_int;
use log::error;
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::prelude::RawFd;
use std::path::{Path, PathBuf};

use crate::page_math;
use crate::platform;
use crate::result::{Error, Result};
use crate::rollover::{rollback, rollover};
use crate::tracee::Tracee;

/// Appended to the rotated-away file unless `FILEFLIP_SUFFIX` says otherwise.
pub const DEFAULT_SUFFIX: &str = ".flipped";

pub struct FlipOptions {
    pub pid: Pid,
    /// Absolute path of the file to rotate, as validated by `check_target`.
    pub path: PathBuf,
    pub suffix: String,
}

/// Validate the invocation against the running system and resolve the target
/// path to the absolute form that `/proc/<pid>/fd` links report. All
/// failures here are argument errors.
pub fn check_target(pid: Pid, path: &Path) -> Result<PathBuf> {
    if !platform::is_x86_64_linux() {
        bail!("fileflip only works on x86-64 Linux");
    }
    if pid.as_raw() <= 1 {
        bail!("error pid {}", pid);
    }
    let path = try_with!(fs::canonicalize(path), "cannot resolve {}", path.display());
    // the path and its NUL terminator must fit into the scratch page
    if path.as_os_str().len() >= page_math::page_size() {
        bail!("file name too long: {}", path.display());
    }
    Ok(path)
}

/// Rotate `opts.path` aside and point `orig_fd` inside the tracee at a
/// fresh file of the same mode and open flags.
///
/// The rename is rolled back on every failure before `dup2` succeeds. A
/// failed tracing primitive leaves the tracee's state unknown: it is not
/// driven any further and the kernel detaches it when this process exits.
pub fn run(opts: &FlipOptions, orig_fd: RawFd) -> Result<()> {
    let mode = rollover(&opts.path, &opts.suffix)?;

    let mut tracee = Tracee::new(opts.pid);
    if let Err(err) = tracee.setup() {
        rollback(&opts.path, &opts.suffix);
        return Err(err);
    }

    match drive(&mut tracee, opts, orig_fd, mode) {
        Ok(()) => tracee.cleanup(),
        Err(err) => {
            if let Error::Sys(_) = err {
                if let Err(detach_err) = tracee.cleanup() {
                    error!("{}", detach_err);
                }
            }
            Err(err)
        }
    }
}

fn drive(tracee: &mut Tracee, opts: &FlipOptions, orig_fd: RawFd, mode: u32) -> Result<()> {
    // capture the original open flags so the replacement matches the
    // tracee's access mode (O_APPEND, O_NONBLOCK, ...)
    let flags = match tracee.fcntl(orig_fd, libc::F_GETFL) {
        Ok(flags) => flags,
        Err(err) => {
            error!("fcntl F_GETFL error: {}", err);
            rollback(&opts.path, &opts.suffix);
            return Err(err);
        }
    };

    let page_size = page_math::page_size();
    let scratch = match tracee.mmap(
        0,
        page_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
        -1,
        0,
    ) {
        Ok(addr) => addr,
        Err(err) => {
            error!("mmap error: {}", err);
            rollback(&opts.path, &opts.suffix);
            return Err(err);
        }
    };

    let res = replace_fd(tracee, opts, orig_fd, mode, flags, scratch);

    // the scratch page is released on every path once it exists, unless
    // tracing itself broke down and the tracee must not be touched again
    match res {
        Err(Error::Fatal(_)) => res,
        _ => {
            if let Err(err) = tracee.munmap(scratch, page_size) {
                error!("munmap error: {}", err);
            }
            res
        }
    }
}

fn replace_fd(
    tracee: &mut Tracee,
    opts: &FlipOptions,
    orig_fd: RawFd,
    mode: u32,
    flags: c_int,
    scratch: u64,
) -> Result<()> {
    let mut path_bytes = opts.path.as_os_str().as_bytes().to_vec();
    path_bytes.push(0);

    if let Err(err) = tracee.remote_memcpy(&path_bytes, scratch) {
        rollback(&opts.path, &opts.suffix);
        return Err(err);
    }

    let tmp_fd = match tracee.open(scratch, flags | libc::O_CREAT, mode as libc::mode_t) {
        Ok(fd) => fd,
        Err(err) => {
            error!("open error: {}", err);
            rollback(&opts.path, &opts.suffix);
            return Err(err);
        }
    };

    // dup2 atomically replaces the original descriptor; from here on the
    // tracee has definitively switched and the rename stays
    if let Err(err) = tracee.dup2(tmp_fd, orig_fd) {
        error!("dup2 error: {}", err);
        // open already recreated the path, so this reports the partially
        // visible state instead of renaming
        rollback(&opts.path, &opts.suffix);
        return Err(err);
    }

    if let Err(err) = tracee.close(tmp_fd) {
        error!("close error: {}", err);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc;
    use crate::rollover::rolled_path;
    use std::fs::File;
    use std::process::{Command, Stdio};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_check_target_rejects_init_pid() {
        assert!(check_target(Pid::from_raw(1), Path::new("/etc/hostname")).is_err());
        assert!(check_target(Pid::from_raw(0), Path::new("/etc/hostname")).is_err());
    }

    #[test]
    fn test_check_target_rejects_missing_file() {
        let dir = tempdir().expect("cannot create tempdir");
        let missing = dir.path().join("no-such-file");
        assert!(check_target(Pid::from_raw(2), &missing).is_err());
    }

    #[test]
    fn test_flip_live_writer() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = dir.path().join("ff.log");
        let log = File::create(&path).expect("cannot create log file");

        // the child's stdout descriptor holds our target file open
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("while :; do echo x; done")
            .stdout(log)
            .stderr(Stdio::null())
            .spawn()
            .expect("cannot spawn writer");
        let pid = Pid::from_raw(child.id() as i32);
        let path = fs::canonicalize(&path).expect("cannot canonicalize path");

        // let the writer put something into the pre-flip file
        thread::sleep(Duration::from_millis(200));

        let fds = proc::opened_fds(pid, &path).expect("fd scan failed");
        assert!(!fds.is_empty(), "writer does not hold the log open");

        let opts = FlipOptions {
            pid,
            path: path.clone(),
            suffix: DEFAULT_SUFFIX.to_string(),
        };
        run(&opts, fds[0]).expect("flip failed");

        let rolled = rolled_path(&path, DEFAULT_SUFFIX);
        assert!(rolled.exists());
        assert!(path.exists());
        assert!(
            fs::metadata(&rolled).expect("cannot stat rolled file").len() > 0,
            "rolled file lost the pre-flip writes"
        );

        // the writer keeps going, now into the fresh file
        thread::sleep(Duration::from_millis(500));
        assert!(
            fs::metadata(&path).expect("cannot stat fresh file").len() > 0,
            "writer never reached the fresh file"
        );

        child.kill().expect("cannot kill writer");
        child.wait().expect("cannot reap writer");
    }

    #[test]
    fn test_flip_again_fails_on_rolled_file() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = dir.path().join("ff.log");
        fs::write(&path, b"current").expect("cannot write file");
        fs::write(rolled_path(&path, DEFAULT_SUFFIX), b"previous").expect("cannot write file");

        let opts = FlipOptions {
            pid: Pid::from_raw(2),
            path: path.clone(),
            suffix: DEFAULT_SUFFIX.to_string(),
        };
        // fails on the already-exists check before any tracing happens
        assert!(run(&opts, 1).is_err());
        assert_eq!(fs::read(&path).expect("cannot read file"), b"current");
    }
}
