//! Routes for the Swift-compatible object API served by `guest-backup serve`.
//!
//! ## Structure
//! - **Account**
//!   - `HEAD /v1/{account}`: usage counters as headers
//!   - `GET  /v1/{account}`: usage counters as JSON
//!
//! - **Container**
//!   - `PUT  /v1/{account}/{container}`: create (idempotent)
//!   - `HEAD /v1/{account}/{container}`: object count and bytes used
//!
//! - **Object**
//!   - `PUT  /v1/{account}/{container}/{*object}`: upload, optionally as a manifest
//!   - `HEAD /v1/{account}/{container}/{*object}`: headers only
//!   - `GET  /v1/{account}/{container}/{*object}`: stream (manifests concatenate segments)
//!
//! The account segment is accepted for URL compatibility; one store backs
//! every account.

use crate::handlers::{
    ServerState,
    health_handlers::{healthz, readyz},
    swift_handlers::{
        get_account, get_object, head_account, head_container, head_object, put_container,
        put_object,
    },
};
use axum::{
    Router,
    routing::{get, head, put},
};

/// Build the router. Handlers share `ServerState`.
pub fn routes() -> Router<ServerState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/v1/{account}/{container}/{*object}",
            put(put_object).get(get_object).head(head_object),
        )
        .route(
            "/v1/{account}/{container}",
            put(put_container).head(head_container),
        )
        .route("/v1/{account}", head(head_account).get(get_account))
}
