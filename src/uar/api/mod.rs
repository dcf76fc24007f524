pub mod routes;
pub mod sse;
pub mod ws;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::RunFault;
use crate::uar::runtime::manager::RunManager;
use std::sync::Arc;

pub fn router() -> Router<Arc<RunManager>> {
    routes::build_router()
}

impl IntoResponse for RunFault {
    fn into_response(self) -> Response {
        let status = match &self {
            RunFault::Validation(_) | RunFault::Expression(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RunFault::NotFound(_) => StatusCode::NOT_FOUND,
            RunFault::Cancelled { .. }
            | RunFault::Execution(_)
            | RunFault::Timeout(_)
            | RunFault::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
