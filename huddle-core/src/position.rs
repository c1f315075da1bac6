//! Fractional position keys for list ordering.
//!
//! A position is a non-empty string over the printable ASCII range
//! `' '..='~'`, read as base-95 digits after an implicit radix point.
//! Between any two distinct positions another one can always be generated,
//! so inserts never renumber siblings. Two clients inserting at the same
//! index concurrently may produce equal keys; the tree breaks that tie with
//! the node id.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PositionError;

const MIN_CHAR: u8 = b' ';
const MAX_CHAR: u8 = b'~';
const BASE: u16 = (MAX_CHAR - MIN_CHAR) as u16 + 1;

/// An ordered position key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(String);

impl Position {
    /// Parse and validate a position received from the wire.
    ///
    /// The last digit may not be the minimum digit, otherwise no key could
    /// sort between `p` and `p + min`.
    pub fn parse(s: impl Into<String>) -> Result<Self, PositionError> {
        let s = s.into();
        let bytes = s.as_bytes();
        if bytes.is_empty() {
            return Err(PositionError::Empty);
        }
        if let Some(&b) = bytes.iter().find(|b| !(MIN_CHAR..=MAX_CHAR).contains(*b)) {
            return Err(PositionError::InvalidDigit(b));
        }
        if bytes[bytes.len() - 1] == MIN_CHAR {
            return Err(PositionError::TrailingMinimum);
        }
        Ok(Self(s))
    }

    /// The key used for the first item of an empty list.
    pub fn first() -> Self {
        Self::between(None, None)
    }

    /// A key strictly after `self`.
    pub fn after(&self) -> Self {
        Self::between(Some(self), None)
    }

    /// A key strictly before `self`.
    pub fn before(&self) -> Self {
        Self::between(None, Some(self))
    }

    /// Generate a key strictly between `lo` and `hi`. `None` means
    /// unbounded on that side. If `lo >= hi` the upper bound is ignored.
    pub fn between(lo: Option<&Position>, hi: Option<&Position>) -> Self {
        let hi = match (lo, hi) {
            (Some(l), Some(h)) if l >= h => None,
            (_, h) => h,
        };

        let lo_digits: Vec<u16> = lo.map(Self::digits).unwrap_or_default();
        let hi_digits: Option<Vec<u16>> = hi.map(Self::digits);

        let mut out: Vec<u16> = Vec::new();
        let mut bounded = hi_digits.is_some();
        let mut i = 0;
        loop {
            let a = lo_digits.get(i).copied().unwrap_or(0);
            let b = if bounded {
                hi_digits
                    .as_ref()
                    .and_then(|h| h.get(i).copied())
                    .unwrap_or(BASE)
            } else {
                BASE
            };

            if b > a + 1 {
                out.push((a + b) / 2);
                break;
            }
            out.push(a);
            if b == a + 1 {
                // prefix is now strictly below hi
                bounded = false;
            }
            i += 1;
        }

        Self(out.into_iter().map(|d| (d as u8 + MIN_CHAR) as char).collect())
    }

    /// `n` increasing keys for seeding a fresh list.
    pub fn sequence(n: usize) -> Vec<Self> {
        let mut out = Vec::with_capacity(n);
        let mut last: Option<Position> = None;
        for _ in 0..n {
            let next = Self::between(last.as_ref(), None);
            out.push(next.clone());
            last = Some(next);
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digits(&self) -> Vec<u16> {
        self.0.bytes().map(|b| (b - MIN_CHAR) as u16).collect()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
