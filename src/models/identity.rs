//! The authenticated principal every storage call is made on behalf of.

use serde::{Deserialize, Serialize};

/// An authenticated user as handed over by the authentication layer.
///
/// The storage layer never mutates an identity. It only reads the
/// namespace key to locate the user's home directory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Account name, also used as the namespace key.
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    /// Key under which this identity's data lives inside a backend.
    pub fn namespace(&self) -> &str {
        &self.username
    }

    /// A namespace is usable as a single directory name: non-empty, no
    /// separators, no dot segments, no control bytes.
    pub fn has_valid_namespace(&self) -> bool {
        let ns = self.namespace();
        !ns.is_empty()
            && ns != "."
            && ns != ".."
            && !ns
                .bytes()
                .any(|b| b == b'/' || b == b'\\' || b.is_ascii_control())
    }
}
