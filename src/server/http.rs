//! HTTP surface of the ingestion gateway.
//!
//! | Route                              | Gateway operation    |
//! |------------------------------------|----------------------|
//! | `POST /updates/`                   | `ingest_batch`       |
//! | `POST /update/`                    | `update_one`         |
//! | `POST /update/{type}/{name}/{val}` | `update_from_path`   |
//! | `GET  /value/{type}/{name}`        | `get_one`            |
//! | `POST /value/` (also `GET`)        | `get_value_json`     |
//! | `GET  /`                           | `get_all` as HTML    |
//! | `GET  /ping`                       | `ping`               |

use std::borrow::Cow;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::error::{GatewayError, StorageError};
use crate::gateway::{IngestRequest, IngestionGateway};
use crate::model::{MetricKind, MetricSample};
use crate::{CONTENT_TYPE_JSON, HEADER_ENCRYPTED, HEADER_REAL_IP, HEADER_SIGNATURE};

type SharedGateway = Arc<IngestionGateway>;

pub fn router(gateway: SharedGateway) -> Router {
    Router::new()
        .route("/", get(list_metrics))
        .route("/ping", get(ping))
        .route("/updates/", post(update_batch))
        .route("/update/", post(update_json))
        .route("/update/:kind/:id/:value", post(update_path))
        .route("/value/", post(value_json).get(value_json))
        .route("/value/:kind/:id", get(value_path))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Gateway(e) => status_for(e),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,
        GatewayError::Decompress { .. }
        | GatewayError::Decryption(_)
        | GatewayError::Signature(_)
        | GatewayError::MalformedBody { .. }
        | GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
        GatewayError::Storage(StorageError::UnknownKind { .. } | StorageError::Invalid(_)) => StatusCode::BAD_REQUEST,
        GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "Error")]
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(target: "synapse::server::http", error = %self, "Request failed");
        } else {
            warn!(target: "synapse::server::http", status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run a blocking gateway call off the async executor
async fn blocking<T, F>(gateway: &SharedGateway, call: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&IngestionGateway) -> Result<T, GatewayError> + Send + 'static,
{
    let gateway = gateway.clone();
    tokio::task::spawn_blocking(move || call(&gateway))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

// ----------------------------------------------------------------------------
// Request and response helpers
// ----------------------------------------------------------------------------

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

pub fn ingest_request(headers: &HeaderMap, body: Bytes) -> IngestRequest {
    let gzip = headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|enc| enc.trim().eq_ignore_ascii_case("gzip")));

    IngestRequest {
        body: body.to_vec(),
        gzip,
        encrypted: header(headers, HEADER_ENCRYPTED).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        signature: header(headers, HEADER_SIGNATURE).map(str::to_string),
        real_ip: header(headers, HEADER_REAL_IP).map(str::to_string),
    }
}

/// JSON response carrying `HashSHA256` when the server has a key
fn signed_json<T: Serialize>(gateway: &IngestionGateway, value: &T) -> ApiResult<Response> {
    let body = serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    let signature = gateway.response_signature(&body);

    let mut response = (StatusCode::OK, [(CONTENT_TYPE, CONTENT_TYPE_JSON)], body).into_response();
    if let Some(value) = signature.and_then(|s| HeaderValue::from_str(&s).ok()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("hashsha256"), value);
    }
    Ok(response)
}

pub fn render_listing(samples: &[MetricSample]) -> String {
    let mut html = String::from("<html><body><h1>Metrics</h1><ul>");
    for sample in samples {
        let id = escape_html(&sample.id);
        let _ = match sample.kind {
            MetricKind::Gauge => write!(html, "<li> Gauge: {} - {:.6}</li>", id, sample.value.unwrap_or_default()),
            MetricKind::Counter => write!(html, "<li> Counter: {} - {}</li>", id, sample.delta.unwrap_or_default()),
        };
    }
    html.push_str("</ul></body></html>");
    html
}

fn escape_html(text: &str) -> Cow<'_, str> {
    if !text.contains(['<', '>', '&', '"']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

async fn update_batch(State(gateway): State<SharedGateway>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let request = ingest_request(&headers, body);
    let batch = blocking(&gateway, move |g| g.ingest_batch(request)).await?;
    debug!(target: "synapse::server::http", metrics = batch.len(), "Batch stored");
    signed_json(&gateway, &batch)
}

async fn update_json(State(gateway): State<SharedGateway>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let request = ingest_request(&headers, body);
    let sample = blocking(&gateway, move |g| g.update_one(request)).await?;
    signed_json(&gateway, &sample)
}

async fn update_path(
    State(gateway): State<SharedGateway>,
    Path((kind, id, value)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let real_ip = header(&headers, HEADER_REAL_IP).map(str::to_string);
    blocking(&gateway, move |g| g.update_from_path(&kind, &id, &value, real_ip.as_deref())).await?;
    Ok(StatusCode::OK)
}

async fn value_path(
    State(gateway): State<SharedGateway>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<String> {
    let sample = blocking(&gateway, move |g| g.get_one(&kind, &id)).await?;
    Ok(sample.value_string())
}

async fn value_json(State(gateway): State<SharedGateway>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let request = ingest_request(&headers, body);
    let sample = blocking(&gateway, move |g| g.get_value_json(request)).await?;
    signed_json(&gateway, &sample)
}

async fn list_metrics(State(gateway): State<SharedGateway>) -> ApiResult<Html<String>> {
    let samples = blocking(&gateway, |g| Ok(g.get_all()?)).await?;
    Ok(Html(render_listing(&samples)))
}

async fn ping(State(gateway): State<SharedGateway>) -> ApiResult<&'static str> {
    blocking(&gateway, |g| Ok(g.ping()?)).await?;
    Ok("pong")
}
