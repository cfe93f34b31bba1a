// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A closed taxonomy of error kinds so callers can distinguish a bad
//    precondition from a fatal replay failure without string-matching.

use std::borrow::Cow;
use std::fmt;

use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Mirrors the kinds distinguished in the error-handling design: public
/// preconditions (`InvalidArgument`, `InvalidOperation`) fail before any
/// mutation, replay failures (`UnsupportedVersion`, `UnsupportedCommand`,
/// `CodecFailure`) are fatal, and `StorageFailure` is the one kind the
/// durable cancellation source conditionally rolls back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidArgument,
    InvalidOperation,
    UnsupportedVersion,
    UnsupportedCommand,
    CodecFailure,
    StorageFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::UnsupportedVersion => "unsupported version",
            ErrorKind::UnsupportedCommand => "unsupported command",
            ErrorKind::CodecFailure => "codec failure",
            ErrorKind::StorageFailure => "storage failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: DynBacktraceError,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.inner)
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new(ErrorKind::StorageFailure, err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Error {
        error!(target: "durables", %kind, "{:?}", err);
        Error {
            kind,
            inner: DynBacktraceError::from(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub fn err(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(kind, SimpleErr(msg.into()))
}

pub fn invalid_argument(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::InvalidArgument, msg)
}
pub fn invalid_operation(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::InvalidOperation, msg)
}
pub fn unsupported_version(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::UnsupportedVersion, msg)
}
pub fn unsupported_command(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::UnsupportedCommand, msg)
}
pub fn codec_failure(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::CodecFailure, msg)
}
pub fn storage_failure(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::StorageFailure, msg)
}

#[test]
fn test_error() {
    let e = invalid_argument("key must not be empty");
    assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    assert!(format!("{e}").starts_with("invalid argument"));
}
