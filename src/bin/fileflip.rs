use clap::{crate_version, value_t_or_exit, App, Arg};
use log::error;
use nix::unistd::Pid;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use fileflip::flip::{self, FlipOptions};
use fileflip::proc;

const EXIT_ARGS: i32 = 1;
const EXIT_ERR: i32 = 2;

/// Timestamped lines on stderr: `<unix-nanoseconds> <level>: <message>`.
/// A non-empty `FILEFLIP_DEBUG` turns on the tracer's debug trace.
fn setup_logging() {
    let level = if env::var_os("FILEFLIP_DEBUG").map_or(false, |v| !v.is_empty()) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .format(|buf, record| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            writeln!(
                buf,
                "{} {}: {}",
                now.as_nanos(),
                record.level().to_string().to_lowercase(),
                record.args()
            )
        })
        .init();
}

fn main() {
    setup_logging();

    let matches = App::new("fileflip")
        .about("Rotate an opened file promptly while nobody knows")
        .version(crate_version!())
        .arg(
            Arg::with_name("pid")
                .help("Pid of the process holding the file open")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("file")
                .help("File to rotate")
                .required(true)
                .index(2),
        )
        .get_matches();

    let pid = Pid::from_raw(value_t_or_exit!(matches, "pid", i32));
    let file = PathBuf::from(matches.value_of("file").unwrap_or_default());

    // the environment is read here and nowhere else
    let suffix = env::var("FILEFLIP_SUFFIX")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| flip::DEFAULT_SUFFIX.to_string());

    let path = match flip::check_target(pid, &file) {
        Ok(path) => path,
        Err(err) => {
            error!("{}", err);
            std::process::exit(EXIT_ARGS);
        }
    };

    let fds = match proc::opened_fds(pid, &path) {
        Ok(fds) => fds,
        Err(err) => {
            error!("{}", err);
            std::process::exit(EXIT_ERR);
        }
    };
    // only the first match is flipped; further descriptors stay untouched
    let orig_fd = match fds.first() {
        Some(fd) => *fd,
        None => {
            error!(
                "can't find file {} opened in process {}",
                path.display(),
                pid
            );
            std::process::exit(EXIT_ARGS);
        }
    };

    let opts = FlipOptions { pid, path, suffix };
    if let Err(err) = flip::run(&opts, orig_fd) {
        error!("{}", err);
        std::process::exit(EXIT_ERR);
    }
}
