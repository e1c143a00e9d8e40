//! Positions in the global transaction log.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A pair of byte offsets into the global log. The `commit` position defines
/// the "all" order; ties break on `prepare`. Derived `Ord` relies on the
/// field order below.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct LogPosition {
    pub commit: i64,
    pub prepare: i64,
}

impl LogPosition {
    /// The beginning of the log.
    pub const START: LogPosition = LogPosition {
        commit: 0,
        prepare: 0,
    };

    /// Past every possible record; backward reads start here.
    pub const END: LogPosition = LogPosition {
        commit: i64::MAX,
        prepare: i64::MAX,
    };

    pub fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }

    /// Position of a record that is its own commit.
    pub fn single(offset: i64) -> Self {
        Self {
            commit: offset,
            prepare: offset,
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C:{}/P:{}", self.commit, self.prepare)
    }
}
