//! HTTP handlers. They translate requests into dispatcher calls and
//! storage results into responses; no storage logic lives here.

use crate::services::dispatcher::Dispatcher;
use std::{path::PathBuf, sync::Arc};

pub mod health_handlers;
pub mod storage_handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,

    /// Directory used by the readiness probe for its disk check.
    pub probe_dir: PathBuf,
}
