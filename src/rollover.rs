use log::error;
use simple_error::{bail, try_with};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::result::Result;

pub fn rolled_path(path: &Path, suffix: &str) -> PathBuf {
    let mut rolled = path.as_os_str().to_os_string();
    rolled.push(suffix);
    PathBuf::from(rolled)
}

/// Rename `path` to `<path><suffix>` and return the permission bits of the
/// old file, so the replacement can be opened with the same mode.
/// Refuses to overwrite an already rolled file.
pub fn rollover(path: &Path, suffix: &str) -> Result<u32> {
    let meta = try_with!(fs::metadata(path), "cannot stat {}", path.display());

    let rolled = rolled_path(path, suffix);
    if rolled.exists() {
        bail!("file {} already exists", rolled.display());
    }

    try_with!(
        fs::rename(path, &rolled),
        "cannot rename {} to {}",
        path.display(),
        rolled.display()
    );
    Ok(meta.permissions().mode() & 0o7777)
}

/// Undo `rollover`, best effort. Only acts when `<path><suffix>` exists and
/// `path` does not; any other state means the flip is partially visible and
/// is left for manual intervention.
pub fn rollback(path: &Path, suffix: &str) {
    let rolled = rolled_path(path, suffix);
    if !rolled.exists() {
        error!("file {} does not exist", rolled.display());
        return;
    }
    if path.exists() {
        error!("file {} already exists", path.display());
        return;
    }
    if let Err(err) = fs::rename(&rolled, path) {
        error!(
            "cannot rename {} back to {}: {}",
            rolled.display(),
            path.display(),
            err
        );
    }
}
