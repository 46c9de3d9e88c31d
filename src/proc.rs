use log::warn;
use nix::unistd::Pid;
use simple_error::try_with;
use std::fs::{read_dir, read_link};
use std::os::unix::prelude::RawFd;
use std::path::{Path, PathBuf};

use crate::result::Result;

pub fn pid_path(pid: Pid) -> PathBuf {
    PathBuf::from("/proc").join(pid.as_raw().to_string())
}

/// Descriptors in `pid` that currently refer to `path`.
///
/// Each entry under `/proc/<pid>/fd` is a descriptor number whose symlink
/// target is the path it refers to. An empty result means the process does
/// not hold the file open; callers treat that as an argument error.
pub fn opened_fds(pid: Pid, path: &Path) -> Result<Vec<RawFd>> {
    let dir = pid_path(pid).join("fd");
    let entries = try_with!(read_dir(&dir), "failed to read {}", dir.display());

    let mut fds = vec![];
    for maybe_entry in entries {
        let entry = try_with!(maybe_entry, "failed to read {}", dir.display());
        let target = try_with!(
            read_link(entry.path()),
            "cannot read link {}",
            entry.path().display()
        );
        if target != path {
            continue;
        }
        match entry.file_name().to_string_lossy().parse::<RawFd>() {
            Ok(fd) => fds.push(fd),
            Err(_) => warn!("can't get fd number from {}", entry.path().display()),
        }
    }
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::os::unix::io::AsRawFd;
    use tempfile::tempdir;

    #[test]
    fn test_opened_fds_finds_own_descriptor() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = dir.path().join("held.log");
        let file = File::create(&path).expect("cannot create file");
        let path = fs::canonicalize(&path).expect("cannot canonicalize path");

        let fds = opened_fds(Pid::this(), &path).expect("fd scan failed");
        assert_eq!(fds, vec![file.as_raw_fd()]);
    }

    #[test]
    fn test_opened_fds_empty_for_unheld_path() {
        let dir = tempdir().expect("cannot create tempdir");
        let path = dir.path().join("nobody-has-this");
        let fds = opened_fds(Pid::this(), &path).expect("fd scan failed");
        assert!(fds.is_empty());
    }
}
