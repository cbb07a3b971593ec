//! Value objects shared by every backend and the dispatcher.
//!
//! None of these types touch storage. They are plain data with parsing and
//! formatting rules, serialized as JSON by the REST adapter via `serde`.

pub mod capabilities;
pub mod checksum;
pub mod chunk;
pub mod identity;
pub mod metadata;
pub mod path;
