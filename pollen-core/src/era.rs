//! Era arithmetic: wrapping time-window identifiers that partition chunk storage.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default number of eras a chunk cache looks back from its end era.
pub const DEFAULT_CACHE_LOOKBACK: u32 = 1000;

/// Wrapping window identifier. The ring covers the whole `u32` range;
/// `previous` and `next` are total and never leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Era(u32);

impl Era {
    /// First era of a fresh store.
    pub const FIRST: Era = Era(0);
    /// Top of the ring; `next` wraps back to [`Era::FIRST`].
    pub const LAST: Era = Era(u32::MAX);

    pub fn new(value: u32) -> Self {
        Era(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Era before this one; wraps from 0 to the top of the ring.
    pub fn previous(self) -> Era {
        Era(self.0.wrapping_sub(1))
    }

    /// Era after this one; wraps from the top of the ring to 0.
    pub fn next(self) -> Era {
        Era(self.0.wrapping_add(1))
    }

    /// Start era of a cache window reaching `lookback` eras back from `self`.
    /// Same as applying [`Era::previous`] `lookback` times.
    pub fn lookback_start(self, lookback: u32) -> Era {
        Era(self.0.wrapping_sub(lookback))
    }
}

impl fmt::Display for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Era {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Era)
    }
}
