//! Client supplied checksums in `algorithm:value` form.

use serde::{Deserialize, Serialize};
use std::{convert::Infallible, fmt, str::FromStr};

/// A checksum token such as `md5:5d41402abc4b2a76b9719d911017c592`.
///
/// An empty algorithm means the client did not ask for verification.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: String,
    pub value: String,
}

impl Checksum {
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into().to_ascii_lowercase(),
            value: value.into(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn md5_of(data: &[u8]) -> Self {
        Self::new("md5", format!("{:x}", md5::compute(data)))
    }

    pub fn is_requested(&self) -> bool {
        !self.algorithm.is_empty()
    }

    /// Compare digests; hex values are compared case-insensitively.
    pub fn matches(&self, other: &Checksum) -> bool {
        self.algorithm.eq_ignore_ascii_case(&other.algorithm)
            && self.value.eq_ignore_ascii_case(&other.value)
    }
}

impl FromStr for Checksum {
    type Err = Infallible;

    /// Anything that is not exactly `algorithm:value` yields no checksum.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let token = token.trim();
        let mut parts = token.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(algorithm), Some(value), None) if !algorithm.is_empty() => {
                Ok(Self::new(algorithm, value))
            }
            _ => Ok(Self::none()),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_requested() {
            write!(f, "{}:{}", self.algorithm, self.value)
        } else {
            Ok(())
        }
    }
}
