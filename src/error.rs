//! Error taxonomy used throughout `chirp`.
//!
//! Mirrors the status-code surface a host application sees in send and
//! release callbacks: every non-success outcome carries one of these kinds.

use std::error;
use std::fmt;
use std::result;

/// Extension of the standard library's `Result` type, used to wrap a
/// foreign error in a [`Error`], keeping the foreign error as the source.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type, used when the
/// foreign error type isn't worth (or able to be) preserved.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type used across the crate.
pub type Result<T> = result::Result<T, Error>;

/// The error type returned by fallible `chirp` operations, and the type
/// carried by send/release callbacks when they complete with a failure.
pub struct Error {
    inner: ErrorInner,
}

enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "Error::Simple({:?})", k),
            ErrorInner::Wrapped(k, e) => write!(f, "Error::Wrapped({:?}, {})", k, e),
        }
    }
}

impl Error {
    /// Returns an error not wrapping another error, with kind `kind`.
    pub fn simple(kind: ErrorKind) -> Self {
        Error {
            inner: ErrorInner::Simple(kind),
        }
    }

    /// Wraps an arbitrary error, tagging it with kind `kind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error {
            inner: ErrorInner::Wrapped(kind, e.into()),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the kind of this error, keeping any wrapped source.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(f, "{:?}: {}", k, e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::wrapped(ErrorKind::IoError, e)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.inner {
            ErrorInner::Simple(_) => None,
            ErrorInner::Wrapped(_, e) => Some(e.as_ref()),
        }
    }
}

/// The status taxonomy of spec §7, surfaced as the kind of every
/// [`Error`] and as the terminal status of send/release callbacks.
///
/// `Success` has no variant here: a successful outcome is `Ok(())` or a
/// plain value, never an `Error`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Invalid config or API argument.
    ValueError,
    /// A runtime/event-loop handle operation failed.
    IoError,
    /// Invalid handshake, invalid wire message, oversized message, or a
    /// control message (ACK/NOOP) carrying a payload or REQ_ACK.
    ProtocolError,
    /// Listen failed because the port was already bound.
    AddrInUse,
    /// Unrecoverable environment error (e.g. RNG unavailable).
    Fatal,
    /// Any TLS handshake/record error.
    TlsError,
    /// The underlying socket write failed.
    WriteError,
    /// Operation attempted before initialization completed.
    Uninit,
    /// Shutdown or close was already in progress.
    InProgress,
    /// Connect, handshake, or write exceeded `config.timeout`.
    Timeout,
    /// Allocation failure.
    NoMemory,
    /// The node is closing/closed, or the connection was torn down
    /// mid-write.
    Shutdown,
    /// The connect attempt itself failed (refused, unreachable, etc).
    CannotConnect,
    /// The message was accepted but placed behind others on the remote.
    Queued,
    /// The message is already enqueued or in flight.
    Used,
    /// Partial progress; used internally by state machines.
    More,
    /// The dispatcher skipped a remote because a slot or the writer was
    /// occupied.
    Busy,
    /// The dispatcher found nothing to do.
    Empty,
    /// The node failed to initialize.
    InitFail,
}
