//! Event Identifiers
//!
//! Event ids are unbounded integers rendered as decimal strings. They name
//! dump subdirectories, so they have to order numerically no matter how many
//! digits they carry: `"20" < "100"`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Arbitrary-precision, non-negative event id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    /// The id before the first event
    pub fn zero() -> Self {
        Self("0".to_string())
    }

    /// Parse a decimal digit string; leading zeros are dropped
    pub fn parse(s: &str) -> Option<Self> {
        if !is_numeric_name(s) {
            return None;
        }
        let trimmed = s.trim_start_matches('0');
        if trimmed.is_empty() {
            Some(Self::zero())
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == "0"
    }

    /// Narrow to u64 when the value fits
    pub fn to_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// The id immediately after this one
    pub fn next(&self) -> Self {
        let mut digits: Vec<u8> = self.0.bytes().collect();
        let mut i = digits.len();
        loop {
            if i == 0 {
                digits.insert(0, b'1');
                break;
            }
            i -= 1;
            if digits[i] == b'9' {
                digits[i] = b'0';
            } else {
                digits[i] += 1;
                break;
            }
        }
        Self(String::from_utf8_lossy(&digits).into_owned())
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl TryFrom<String> for EventId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventId::parse(s.trim()).ok_or_else(|| Error::Config(format!("invalid event id '{}'", s)))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_numeric(&self.0, &other.0)
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Whether a name is a non-empty run of ASCII digits
pub fn is_numeric_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

/// Order two digit strings by numeric value
///
/// Leading zeros are insignificant. Names that are not numeric sort after
/// all numeric names, lexically among themselves.
pub fn compare_numeric(a: &str, b: &str) -> Ordering {
    match (is_numeric_name(a), is_numeric_name(b)) {
        (true, true) => {
            let a = a.trim_start_matches('0');
            let b = b.trim_start_matches('0');
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

/// Sort directory names by numeric event id
pub fn sort_numeric<S: AsRef<str>>(names: &mut [S]) {
    names.sort_by(|a, b| compare_numeric(a.as_ref(), b.as_ref()));
}
