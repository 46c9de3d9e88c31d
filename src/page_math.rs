use nix::unistd::{sysconf, SysconfVar};

pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) => size as usize,
        // x86-64 Linux uses 4k pages
        _ => 4096,
    }
}
