//! HTTP surface for the trust core.
//!
//! Transport-agnostic by design: the handlers are thin shims over
//! [`CapEngine`]; every policy decision happens behind that boundary.
//! The core does not authenticate callers. In the demonstration
//! deployment, CORS restricts browser callers to loopback origins plus
//! one configured extension origin, and bodies above 256 KiB are
//! rejected to bound canonicalization cost.

use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::cap::types::{Capability, IssueRequest, Receipt, SpendRequest, ToolCallRequest};
use crate::cap::{CapEngine, CapError};
use crate::config::ServerConfig;

/// Request bodies above this size are rejected outright.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

const DEFAULT_RECEIPT_LIMIT: usize = 100;
const MAX_RECEIPT_LIMIT: usize = 1000;

/// Build the API router.
pub fn router(engine: Arc<CapEngine>, extension_origin: Option<&str>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/caps/spend", post(issue_spend))
        .route("/api/v1/caps/tool_call", post(issue_tool_call))
        .route("/api/v1/enforce/spend", post(enforce_spend))
        .route("/api/v1/enforce/tool_call", post(enforce_tool_call))
        .route("/api/v1/caps/{cap_id}/revoke", post(revoke))
        .route("/api/v1/caps", get(list_capabilities))
        .route("/api/v1/receipts", get(list_receipts))
        .layer(cors_layer(extension_origin))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(engine)
}

/// Bind and serve until shutdown.
pub async fn serve(config: ServerConfig, engine: Arc<CapEngine>) -> anyhow::Result<()> {
    let app = router(engine, config.extension_origin.as_deref());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("HTTP API listening on {}", config.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(extension_origin: Option<&str>) -> CorsLayer {
    let extension = extension_origin.and_then(|o| HeaderValue::from_str(o).ok());
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            origin_allowed(origin, extension.as_ref())
        }))
        .allow_methods(Any)
        .allow_headers(Any)
}

fn origin_allowed(origin: &HeaderValue, extension: Option<&HeaderValue>) -> bool {
    if Some(origin) == extension {
        return true;
    }
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    ["http://127.0.0.1", "http://localhost", "http://[::1]"]
        .iter()
        .any(|base| {
            origin == *base
                || origin
                    .strip_prefix(base)
                    .is_some_and(|rest| rest.starts_with(':'))
        })
}

// ─── Request/Response Types ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    issuer_id: String,
    capabilities: usize,
    revoked: usize,
    uptime_secs: u64,
}

/// A capability as the admin UI sees it, tagged with its revocation flag.
#[derive(Debug, Serialize)]
struct CapabilityStatus {
    #[serde(flatten)]
    capability: Capability,
    is_revoked: bool,
}

#[derive(Debug, Serialize)]
struct RevokeResponse {
    status: &'static str,
    cap_id: String,
    receipt_id: String,
}

#[derive(Debug, Deserialize)]
struct ReceiptQuery {
    limit: Option<usize>,
    since: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Map a core error to its transport shape. Structural errors carry
/// detail; core faults are logged and surfaced as opaque codes.
fn error_response(err: CapError) -> Response {
    if err.is_fault() {
        tracing::error!(error = %err, "core fault");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: err.code(),
                detail: None,
            }),
        )
            .into_response();
    }
    let status = match err {
        CapError::CapNotFound => StatusCode::NOT_FOUND,
        CapError::AlreadyRevoked => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorBody {
            error: err.code(),
            detail: Some(err.to_string()),
        }),
    )
        .into_response()
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Server start time (set once on first call).
static START_TIME: std::sync::OnceLock<SystemTime> = std::sync::OnceLock::new();

async fn health(State(engine): State<Arc<CapEngine>>) -> Json<HealthResponse> {
    let start = START_TIME.get_or_init(SystemTime::now);
    let caps = engine.list_capabilities();
    let revoked = caps.iter().filter(|(_, revoked)| *revoked).count();
    Json(HealthResponse {
        status: "ok",
        issuer_id: engine.issuer_id().to_string(),
        capabilities: caps.len(),
        revoked,
        uptime_secs: start.elapsed().unwrap_or_default().as_secs(),
    })
}

async fn issue_spend(
    State(engine): State<Arc<CapEngine>>,
    Json(req): Json<IssueRequest>,
) -> Response {
    match engine.issue_spend_capability(req) {
        Ok(cap) => Json(cap).into_response(),
        Err(e) => error_response(e),
    }
}

async fn issue_tool_call(
    State(engine): State<Arc<CapEngine>>,
    Json(req): Json<IssueRequest>,
) -> Response {
    match engine.issue_tool_call_capability(req) {
        Ok(cap) => Json(cap).into_response(),
        Err(e) => error_response(e),
    }
}

async fn enforce_spend(
    State(engine): State<Arc<CapEngine>>,
    Json(req): Json<SpendRequest>,
) -> Response {
    match engine.enforce_spend(req) {
        // Denials are normal outcomes; both verdicts are 200.
        Ok(decision) => Json(decision).into_response(),
        Err(e) => error_response(e),
    }
}

async fn enforce_tool_call(
    State(engine): State<Arc<CapEngine>>,
    Json(req): Json<ToolCallRequest>,
) -> Response {
    match engine.enforce_tool_call(req) {
        Ok(decision) => Json(decision).into_response(),
        Err(e) => error_response(e),
    }
}

async fn revoke(
    State(engine): State<Arc<CapEngine>>,
    Path(cap_id): Path<String>,
) -> Response {
    match engine.revoke(&cap_id) {
        Ok(receipt) => Json(RevokeResponse {
            status: "revoked",
            cap_id,
            receipt_id: receipt.receipt_id,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_capabilities(State(engine): State<Arc<CapEngine>>) -> Json<Vec<CapabilityStatus>> {
    let caps = engine
        .list_capabilities()
        .into_iter()
        .map(|(capability, is_revoked)| CapabilityStatus {
            capability,
            is_revoked,
        })
        .collect();
    Json(caps)
}

async fn list_receipts(
    State(engine): State<Arc<CapEngine>>,
    Query(query): Query<ReceiptQuery>,
) -> Result<Json<Vec<Receipt>>, Response> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECEIPT_LIMIT)
        .min(MAX_RECEIPT_LIMIT);
    engine
        .list_receipts(limit, query.since.as_deref())
        .map(Json)
        .map_err(error_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_origins_allowed() {
        for origin in [
            "http://127.0.0.1",
            "http://127.0.0.1:3000",
            "http://localhost:5173",
            "http://[::1]:8080",
        ] {
            assert!(
                origin_allowed(&HeaderValue::from_static(origin), None),
                "{origin} should be allowed"
            );
        }
    }

    #[test]
    fn test_foreign_origins_rejected() {
        for origin in [
            "https://evil.example.com",
            "http://localhost.example.com",
            "http://127.0.0.1.evil.net",
        ] {
            assert!(
                !origin_allowed(&HeaderValue::from_static(origin), None),
                "{origin} should be rejected"
            );
        }
    }

    #[test]
    fn test_extension_origin_allowed_when_configured() {
        let ext = HeaderValue::from_static("chrome-extension://abcdef");
        assert!(origin_allowed(&ext, Some(&ext)));
        assert!(!origin_allowed(&ext, None));
    }
}
