//! Admin API for credentials and jobs
//!
//! Served on the same listener as `/health` and `/metrics`. Intended for
//! operators only; bind it to a private address.
//!
//! Endpoints:
//! - GET    /admin/credentials              list credential stats (never tokens)
//! - POST   /admin/credentials              add a token, body `{"token": "..", "id": ".."}`
//! - DELETE /admin/credentials/{id}         remove a credential
//! - GET    /admin/jobs                     list registered jobs
//! - POST   /admin/jobs/{name}/trigger      run a job now and return its outcome
//! - POST   /admin/jobs/{name}/enable
//! - POST   /admin/jobs/{name}/disable

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use credential_pool::Credential;
use metrics_exporter_prometheus::PrometheusHandle;
use orchestration::{CollectError, JobError};
use serde::Deserialize;
use tracing::{info, warn};

use crate::app::Harvester;

/// Shared state for every HTTP handler.
#[derive(Clone)]
pub struct AdminState {
    pub harvester: Arc<Harvester>,
    pub prometheus: PrometheusHandle,
}

impl AdminState {
    pub fn new(harvester: Arc<Harvester>, prometheus: PrometheusHandle) -> Self {
        Self {
            harvester,
            prometheus,
        }
    }
}

fn json(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

/// Admin routes, left stateless so `main` can merge them with its own.
pub fn routes() -> Router<AdminState> {
    Router::new()
        .route("/admin/credentials", get(list_credentials).post(add_credential))
        .route("/admin/credentials/{id}", delete(remove_credential))
        .route("/admin/jobs", get(list_jobs))
        .route("/admin/jobs/{name}/trigger", post(trigger_job))
        .route("/admin/jobs/{name}/enable", post(enable_job))
        .route("/admin/jobs/{name}/disable", post(disable_job))
}

async fn list_credentials(State(state): State<AdminState>) -> impl IntoResponse {
    let stats = state.harvester.pool().get_stats().await;
    json(StatusCode::OK, serde_json::json!(stats))
}

#[derive(Deserialize)]
struct AddCredentialRequest {
    token: String,
    #[serde(default)]
    id: Option<String>,
}

async fn add_credential(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddCredentialRequest>,
) -> impl IntoResponse {
    let token = body.token.trim();
    if token.is_empty() {
        return json(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "token must not be empty" }),
        );
    }
    let credential = match body.id {
        Some(id) => Credential::new(id, token),
        None => Credential::from_token(token),
    };
    let id = credential.id().to_string();
    let added = state.harvester.pool().add_credential(credential).await;

    let (status, outcome) = if added {
        (StatusCode::CREATED, "added")
    } else {
        (StatusCode::OK, "replaced")
    };
    json(status, serde_json::json!({ "id": id, "status": outcome }))
}

async fn remove_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.harvester.pool().remove_credential(&id).await {
        Ok(()) => json(
            StatusCode::OK,
            serde_json::json!({ "id": id, "status": "removed" }),
        ),
        Err(e @ credential_pool::Error::NotFound(_)) => json(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": e.to_string() }),
        ),
        Err(e @ credential_pool::Error::LastCredential(_)) => json(
            StatusCode::CONFLICT,
            serde_json::json!({ "error": e.to_string() }),
        ),
        Err(e) => json(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

async fn list_jobs(State(state): State<AdminState>) -> impl IntoResponse {
    let jobs = state.harvester.scheduler().list_jobs().await;
    json(StatusCode::OK, serde_json::json!({ "jobs": jobs }))
}

/// POST /admin/jobs/{name}/trigger
///
/// The optional JSON body overrides the job's scope (`resources`,
/// `start_date`, `end_date`, `lookback_days`). Blocks until the run ends.
async fn trigger_job(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(params) => params,
            Err(e) => {
                return json(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "error": format!("invalid JSON body: {e}") }),
                );
            }
        }
    };

    let run_id = format!("run_{}", uuid::Uuid::new_v4().as_simple());
    info!(run_id, job = %name, "manual trigger received");

    match state
        .harvester
        .trigger_manual_collection(&name, params)
        .await
    {
        Ok(outcome) => {
            let status = if outcome.success {
                crate::metrics::record_manual_trigger(&name, "success");
                StatusCode::OK
            } else {
                crate::metrics::record_manual_trigger(&name, "failed");
                warn!(run_id, job = %name, errors = %outcome.error_summary().unwrap_or_default(), "manual run failed");
                StatusCode::BAD_GATEWAY
            };
            json(
                status,
                serde_json::json!({ "run_id": run_id, "job": name, "outcome": outcome }),
            )
        }
        Err(e) => {
            let status = match &e {
                JobError::UnknownJob(_) => StatusCode::NOT_FOUND,
                JobError::Collect(CollectError::InvalidScope(_)) => StatusCode::BAD_REQUEST,
                JobError::Collect(CollectError::Context(_)) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            if status != StatusCode::NOT_FOUND {
                crate::metrics::record_manual_trigger(&name, "error");
            }
            warn!(run_id, job = %name, error = %e, "manual run errored");
            json(
                status,
                serde_json::json!({ "run_id": run_id, "job": name, "error": e.to_string() }),
            )
        }
    }
}

async fn set_job_enabled(state: AdminState, name: String, enabled: bool) -> impl IntoResponse {
    match state.harvester.scheduler().set_enabled(&name, enabled).await {
        Ok(()) => json(
            StatusCode::OK,
            serde_json::json!({ "job": name, "enabled": enabled }),
        ),
        Err(e) => json(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

async fn enable_job(State(state): State<AdminState>, Path(name): Path<String>) -> impl IntoResponse {
    set_job_enabled(state, name, true).await
}

async fn disable_job(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    set_job_enabled(state, name, false).await
}
