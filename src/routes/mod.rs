//! Route modules for the Bigfile server

pub mod health;
pub mod upload;

use std::time::Duration;

use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Response envelope shared by every `/bigfile` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonResult<T = serde_json::Value> {
    pub result_code: i32,
    pub result_msg: String,
    pub result_data: Option<T>,
}

impl<T> JsonResult<T> {
    pub fn new(result_code: i32, result_msg: impl Into<String>, result_data: Option<T>) -> Self {
        Self {
            result_code,
            result_msg: result_msg.into(),
            result_data,
        }
    }

    pub fn success(result_data: T) -> Self {
        Self::new(0, "ok", Some(result_data))
    }
}

impl JsonResult {
    pub fn failure(result_msg: impl Into<String>) -> Self {
        Self::new(-1, result_msg, None)
    }
}

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
        .max_age(Duration::from_secs(3600));

    Router::new()
        .nest("/health", health::router())
        .nest("/bigfile", upload::router(state.config().storage.max_chunk_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
