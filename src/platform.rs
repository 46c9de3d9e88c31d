use nix::sys::utsname::uname;

/// The injection engine speaks the x86-64 Linux syscall convention only.
pub fn is_x86_64_linux() -> bool {
    match uname() {
        Ok(uts) => uts.sysname() == "Linux" && uts.machine() == "x86_64",
        Err(_) => false,
    }
}
