//! Per-backend feature flags and the operations they gate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An operation the dispatcher can forward to a backend.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    PutObject,
    PutObjectInChunks,
    GetObject,
    Stat,
    Remove,
    CreateContainer,
    Copy,
    Rename,
    ThirdPartyCopy,
    ThirdPartyRename,
    CreateUserHomeDirectory,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a backend can do for a given identity.
///
/// The dispatcher checks these flags before every call, so backends may
/// assume an operation they are asked to perform is one they advertised.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub put_object: bool,
    pub put_object_in_chunks: bool,
    pub get_object: bool,
    pub stat: bool,
    pub remove: bool,
    pub create_container: bool,
    pub copy: bool,
    pub rename: bool,
    pub third_party_copy: bool,
    pub third_party_rename: bool,
    pub verify_client_checksum: bool,
    pub send_checksum: bool,
    pub create_user_home_directory: bool,
    /// Algorithm used when verifying or sending checksums (e.g. `md5`).
    pub supported_checksum_algorithm: String,
}

impl Capabilities {
    pub fn allows(&self, op: Operation) -> bool {
        match op {
            Operation::PutObject => self.put_object,
            Operation::PutObjectInChunks => self.put_object_in_chunks,
            Operation::GetObject => self.get_object,
            Operation::Stat => self.stat,
            Operation::Remove => self.remove,
            Operation::CreateContainer => self.create_container,
            Operation::Copy => self.copy,
            Operation::Rename => self.rename,
            Operation::ThirdPartyCopy => self.third_party_copy,
            Operation::ThirdPartyRename => self.third_party_rename,
            Operation::CreateUserHomeDirectory => self.create_user_home_directory,
        }
    }
}
