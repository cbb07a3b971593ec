//! Storage backends and the dispatcher that routes between them.

pub mod dispatcher;
pub mod local;
pub mod root;
pub mod storage;
