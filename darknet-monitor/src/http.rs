//! HTTP surface over [`QueryService`].

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::{
    error::QueryError,
    query::{QueryService, parse_covering_prefix},
};

pub const ALIVE_MESSAGE: &str = "Hi, I am alive!";

pub fn router(service: QueryService) -> Router {
    Router::new()
        .route("/", get(alive))
        .route("/inactive", get(inactive))
        .route("/info", get(info))
        .fallback(|| async {
            ApiError::new(StatusCode::NOT_FOUND, "no such endpoint")
        })
        .method_not_allowed_fallback(|| async {
            ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "endpoint only supports GET")
        })
        .with_state(service)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn alive() -> &'static str {
    ALIVE_MESSAGE
}

#[derive(Debug, Deserialize)]
struct InactiveParams {
    prefix: Option<String>,
}

#[derive(Debug, Serialize)]
struct InactiveResponse {
    inactive_prefixes: Vec<String>,
}

async fn inactive(
    State(service): State<QueryService>,
    params: Result<Query<InactiveParams>, QueryRejection>,
) -> Result<Json<InactiveResponse>, ApiError> {
    let Query(params) =
        params.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    // An empty `prefix=` means no restriction.
    let covering = match params.prefix.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_covering_prefix(raw)?),
    };

    let prefixes = service.inactive_prefixes(covering).await;
    Ok(Json(InactiveResponse {
        inactive_prefixes: prefixes.iter().map(ToString::to_string).collect(),
    }))
}

async fn info(State(service): State<QueryService>) -> Result<Json<Value>, ApiError> {
    let info = service.general_info().await?;
    let rows: Vec<Value> = info.rows.iter().map(|row| row.to_row()).collect();
    Ok(Json(json!({
        "info": rows,
        "headers": info.headers,
    })))
}

/// Error response rendered as `{"code", "name", "description"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    description: String,
}

impl ApiError {
    pub fn new(status: StatusCode, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidPrefix(_) | QueryError::UnsupportedFamily(_) => {
                debug!(error = %err, "rejected query");
                ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            QueryError::DataPlane(_) => {
                warn!(error = %err, "table metadata unavailable");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.status.as_u16(),
            "name": self.status.canonical_reason().unwrap_or("Unknown"),
            "description": self.description,
        });
        (self.status, Json(body)).into_response()
    }
}
