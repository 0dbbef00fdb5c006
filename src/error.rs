/// A toyraft error. Protocol-level refusals (stale terms, log
/// inconsistencies, proposals to non-leaders) are not errors, they are
/// ordinary reply values; errors represent failures of the peer itself or
/// its collaborators.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The operation was aborted and must be retried, typically because the
    /// peer has shut down.
    Abort,
    /// Invalid data, e.g. a corrupt blob returned by the persister.
    InvalidData(String),
    /// An IO error.
    IO(String),
    /// An internal error. These are fatal: correctness can no longer be
    /// assumed, so the peer cannot safely continue.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidData(message) => write!(f, "invalid data: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
            Error::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

/// A toyraft result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

// Channel disconnects happen when the peer is shutting down, so the sender
// should abort rather than fail.
impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::Abort
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::Abort
    }
}

impl From<crossbeam::channel::RecvTimeoutError> for Error {
    fn from(_: crossbeam::channel::RecvTimeoutError) -> Self {
        Error::Abort
    }
}
