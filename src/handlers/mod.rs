pub mod health_handlers;
pub mod swift_handlers;

use crate::{errors::AppError, services::local_store::LocalObjectStore};
use axum::http::HeaderMap;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ServerState {
    pub store: LocalObjectStore,

    /// Token clients must present in `X-Auth-Token`; `None` disables auth.
    pub auth_token: Option<Arc<str>>,
}

impl ServerState {
    pub fn new(store: LocalObjectStore, auth_token: Option<String>) -> Self {
        Self {
            store,
            auth_token: auth_token.map(Arc::from),
        }
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let Some(expected) = self.auth_token.as_deref() else {
            return Ok(());
        };
        let presented = headers
            .get("x-auth-token")
            .and_then(|value| value.to_str().ok());
        if presented == Some(expected) {
            Ok(())
        } else {
            Err(AppError::unauthorized())
        }
    }
}
