//! Defines the HTTP surface over the storage dispatcher.
//!
//! ## Structure
//! - **Probes**
//!   - `GET /healthz`, `GET /readyz`
//!
//! - **Namespace**
//!   - `POST   /api/v1/home` - create the caller's home on every backend
//!   - `GET    /api/v1/capabilities/{*path}` - capabilities of the owning backend
//!   - `GET    /api/v1/meta[/{*path}]` - stat, `?children=true` lists a container
//!   - `POST   /api/v1/containers/{*path}` - create container (`?recursive=true`)
//!   - `POST   /api/v1/copy`, `POST /api/v1/rename` - JSON `{from, to}`
//!
//! - **Objects**
//!   - `PUT    /api/v1/objects/{*path}` - upload (chunk upload with `OC-Chunked: 1`)
//!   - `GET    /api/v1/objects/{*path}` - download
//!   - `HEAD   /api/v1/objects/{*path}` - metadata headers only
//!   - `DELETE /api/v1/objects/{*path}` - remove (`?recursive=true`)
//!   - `POST   /api/v1/chunked/{*path}` - open a chunked upload
//!
//! Paths are logical: the first segment selects the backend.

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    storage_handlers::{
        copy_resource, create_container, create_home, delete_object, download_object,
        get_capabilities, head_object, rename_resource, start_chunked_upload, stat_resource,
        stat_root, upload_object,
    },
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router. State is attached by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/home", post(create_home))
        .route("/api/v1/capabilities/{*path}", get(get_capabilities))
        .route("/api/v1/meta", get(stat_root))
        .route("/api/v1/meta/{*path}", get(stat_resource))
        .route(
            "/api/v1/objects/{*path}",
            put(upload_object)
                .get(download_object)
                .head(head_object)
                .delete(delete_object),
        )
        .route("/api/v1/containers/{*path}", post(create_container))
        .route("/api/v1/chunked/{*path}", post(start_chunked_upload))
        .route("/api/v1/copy", post(copy_resource))
        .route("/api/v1/rename", post(rename_resource))
}
