//! The backend's HTTP API: resource fetching and registration, the resource
//! stream, and the bridge status page.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use ferry_api::registry::{RegistryError, ResourceRegistry};
use ferry_api::stream::RawDiff;
use ferry_core::{hash_fingerprint, BackendResources, ResourceRequest};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request carries no `Authorization` header")]
    MissingAuthorization,
    #[error("malformed `Authorization` header")]
    MalformedAuthorization,
    #[error("invalid bearer token")]
    Unauthorized,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no `id` parameter given")]
    MissingId,
    #[error("`id` parameter is not a valid fingerprint")]
    BadFingerprint,
    #[error("no resource matches the given id")]
    NotFound,
    #[error("an error occurred while processing the request")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingAuthorization
            | ApiError::MalformedAuthorization
            | ApiError::Registry(_)
            | ApiError::MissingId
            | ApiError::BadFingerprint => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Extracts the bearer token from the request's `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(ApiError::MissingAuthorization)?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::MalformedAuthorization)?;
    value
        .strip_prefix("Bearer ")
        .ok_or(ApiError::MalformedAuthorization)
}

#[derive(Clone)]
pub struct ApiConfig {
    resources: Arc<BackendResources>,
    registry: Arc<ResourceRegistry>,
    api_tokens: Arc<HashMap<String, String>>,
}

impl ApiConfig {
    pub fn new(resources: Arc<BackendResources>, api_tokens: HashMap<String, String>) -> Self {
        Self {
            resources,
            registry: Arc::new(ResourceRegistry::new()),
            api_tokens: Arc::new(api_tokens),
        }
    }

    /// Checks the given headers against the token configured for the given
    /// distributor.
    fn authorize(&self, headers: &HeaderMap, dist_name: &str) -> Result<(), ApiError> {
        let token = bearer_token(headers)?;
        match self.api_tokens.get(dist_name) {
            Some(expected) if expected == token => Ok(()),
            _ => Err(ApiError::Unauthorized),
        }
    }

    /// Checks the given headers against all configured tokens.  Used for
    /// endpoints whose callers are not distributors, e.g. proxies
    /// registering themselves.
    fn authorize_any(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let token = bearer_token(headers)?;
        if self.api_tokens.values().any(|expected| expected == token) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    pub fn into_router(
        self,
        resources_endpoint: &str,
        resource_stream_endpoint: &str,
        status_endpoint: &str,
    ) -> Router {
        Router::new()
            .route(
                resources_endpoint,
                get(get_resources).post(post_resources),
            )
            .route(resource_stream_endpoint, get(resource_stream))
            .route(status_endpoint, get(status))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

/// Serves the resources that the requesting distributor currently owns.
async fn get_resources(
    State(config): State<ApiConfig>,
    headers: HeaderMap,
    Json(request): Json<ResourceRequest>,
) -> Result<Json<Vec<Value>>, ApiError> {
    config.authorize(&headers, &request.request_origin)?;

    let mut values = Vec::new();
    for type_tag in &request.resource_types {
        for r in config.resources.get(&request.request_origin, type_tag).await {
            values.push(r.to_value().map_err(|_| ApiError::Internal)?);
        }
    }
    Ok(Json(values))
}

/// Accepts a batch of resource envelopes, e.g. from proxies registering
/// themselves.  Any malformed or invalid envelope rejects the whole batch.
async fn post_resources(
    State(config): State<ApiConfig>,
    headers: HeaderMap,
    Json(values): Json<Vec<Value>>,
) -> Result<StatusCode, ApiError> {
    config.authorize_any(&headers)?;

    let resources = config.registry.decode_all(values)?;
    tracing::info!(num = resources.len(), "accepting registered resources");
    for r in resources {
        config.resources.add(r).await;
    }
    Ok(StatusCode::OK)
}

/// Upgrades to a chunked response carrying the resource stream: a full
/// snapshot first, then one frame per diff, each terminated by a single
/// carriage-return byte.
async fn resource_stream(
    State(config): State<ApiConfig>,
    headers: HeaderMap,
    Json(request): Json<ResourceRequest>,
) -> Result<Response, ApiError> {
    config.authorize(&headers, &request.request_origin)?;

    let (tx, rx) = mpsc::unbounded_channel();
    config.resources.register(request.clone(), tx).await;

    let snapshot = config.resources.snapshot(&request).await;
    let first = RawDiff::encode(&snapshot)
        .and_then(|raw| raw.to_frame())
        .map_err(|_| ApiError::Internal)?;
    let first = futures_util::stream::once(async move { Ok::<_, Infallible>(Bytes::from(first)) });

    let updates = UnboundedReceiverStream::new(rx).filter_map(|diff| async move {
        match RawDiff::encode(&diff).and_then(|raw| raw.to_frame()) {
            Ok(frame) => Some(Ok::<_, Infallible>(Bytes::from(frame))),
            Err(err) => {
                tracing::error!(%err, "cannot encode diff frame");
                None
            }
        }
    });

    // When the subscriber disconnects, the receiver is dropped and the next
    // propagation prunes its channel.
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(first.chain(updates)))
        .map_err(|_| ApiError::Internal)
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    id: Option<String>,
}

/// A plain-text status report for the bridge with the given (raw or
/// SHA-1-hashed) fingerprint.
async fn status(
    State(config): State<ApiConfig>,
    Query(params): Query<StatusParams>,
) -> Result<String, ApiError> {
    let id = params.id.ok_or(ApiError::MissingId)?;
    let id_upper = id.trim().to_uppercase();
    let hashed_id = hash_fingerprint(&id).map_err(|_| ApiError::BadFingerprint)?;

    let mut lines = Vec::new();
    for type_tag in config.resources.resource_types() {
        for r in config.resources.get_all(&type_tag).await {
            let Some(fingerprint) = r.fingerprint() else {
                continue;
            };
            let Ok(hashed) = hash_fingerprint(fingerprint) else {
                continue;
            };
            if hashed != id_upper && hashed != hashed_id {
                continue;
            }

            let test = r.test();
            let mut line = format!("{type_tag}: {}", test.state);
            if let Some(last_tested) = test.last_tested {
                line.push_str(&format!(", last tested {}", last_tested.to_rfc3339()));
            }
            if let Some(error) = &test.error {
                line.push_str(&format!(", error: {error}"));
            }
            lines.push(line);
        }
    }

    if lines.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(lines.join("\n") + "\n")
}
