use nix::errno::Errno;
use simple_error::SimpleError;
use std::fmt;
use std::result;

/// Errors escaping the tracer.
///
/// `Fatal` covers failed tracing primitives and host I/O: the tracee's state
/// is unknown (or the flip cannot proceed) and no recovery is possible in
/// this process. `Sys` is an errno returned by a syscall injected into the
/// tracee; the tracee itself is intact and can be driven further.
#[derive(Debug)]
pub enum Error {
    Fatal(SimpleError),
    Sys(Errno),
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Fatal(err) => err.fmt(f),
            Error::Sys(errno) => write!(f, "{}", errno.desc()),
        }
    }
}

impl std::error::Error for Error {}

// simple_error's try_with!/bail!/require_with! wrap through From, so they
// work unchanged against this error type.
impl From<SimpleError> for Error {
    fn from(err: SimpleError) -> Error {
        Error::Fatal(err)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::Sys(errno)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Error {
        Error::Fatal(SimpleError::new(msg))
    }
}
