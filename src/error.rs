use thiserror::Error;

use crate::append::AppendError;
use crate::index::IndexError;
use crate::log::LogError;
use crate::psub::PersistentError;
use crate::reader::ReadError;
use crate::sub::SubscriptionError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the subsystem errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Append(#[from] AppendError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Persistent(#[from] PersistentError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Log(e) => e.transience(),
            Error::Index(e) => e.transience(),
            Error::Append(e) => e.transience(),
            Error::Read(e) => e.transience(),
            Error::Subscription(e) => e.transience(),
            Error::Persistent(e) => e.transience(),
        }
    }
}
