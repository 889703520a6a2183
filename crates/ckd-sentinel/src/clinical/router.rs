//! HTTP surface for snapshot computation and the rule versioning workflow.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::domain::{AlertId, DoctorId, PatientId, RuleVersionId, Severity};
use super::repository::RepositoryError;
use super::rules::RuleExpression;
use super::service::{SnapshotError, SnapshotService};
use super::versioning::{RuleVersioningService, VersioningError};

/// Shared state handed to every handler.
pub struct ClinicalApi {
    pub snapshots: SnapshotService,
    pub versioning: RuleVersioningService,
    /// Default hard bound on preview scans when a request does not set one.
    pub preview_scan_cap: usize,
}

/// Router builder exposing the evaluation and governance endpoints.
pub fn clinical_router(api: Arc<ClinicalApi>) -> Router {
    Router::new()
        .route(
            "/api/v1/patients/:patient_id/snapshot",
            get(latest_snapshot_handler).post(compute_snapshot_handler),
        )
        .route(
            "/api/v1/patients/:patient_id/review",
            post(doctor_review_handler),
        )
        .route("/api/v1/alerts/preview", post(preview_handler))
        .route(
            "/api/v1/alerts/pending-approvals",
            get(pending_approvals_handler),
        )
        .route(
            "/api/v1/alerts/:alert_id/versions",
            get(alert_versions_handler).post(create_version_handler),
        )
        .route(
            "/api/v1/alerts/versions/:version_id/approve",
            post(approve_version_handler),
        )
        .route("/api/v1/alerts/:alert_id/rollback", post(rollback_handler))
        .route("/api/v1/alerts/:alert_id/audit", get(audit_trail_handler))
        .with_state(api)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ComputeSnapshotRequest {
    pub(crate) doctor_id: String,
    #[serde(default = "default_persist")]
    pub(crate) persist: bool,
    /// Reference instant override for deterministic evaluation; defaults to
    /// the server clock.
    #[serde(default)]
    pub(crate) as_of: Option<DateTime<Utc>>,
}

fn default_persist() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub(crate) struct PreviewRequest {
    pub(crate) rule_expression: RuleExpression,
    /// Accepted for wire compatibility; severity does not change which
    /// patients a candidate expression matches.
    #[serde(default)]
    pub(crate) severity: Option<Severity>,
    #[serde(default)]
    pub(crate) scan_cap: Option<usize>,
    #[serde(default)]
    pub(crate) as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateVersionRequest {
    pub(crate) rule_expression: RuleExpression,
    pub(crate) severity: Severity,
    pub(crate) change_reason: String,
    pub(crate) created_by: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateVersionResponse {
    pub(crate) version_id: RuleVersionId,
    pub(crate) version: u32,
    pub(crate) requires_approval: bool,
    pub(crate) state: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApproveVersionRequest {
    pub(crate) approved_by: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RollbackRequest {
    pub(crate) target_version: u32,
    pub(crate) rolled_back_by: String,
    pub(crate) reason: String,
}

pub(crate) async fn latest_snapshot_handler(
    State(api): State<Arc<ClinicalApi>>,
    Path(patient_id): Path<String>,
) -> Response {
    match api.snapshots.latest_snapshot(&PatientId(patient_id)) {
        Ok(snapshot) => (StatusCode::OK, axum::Json(snapshot)).into_response(),
        Err(err) => snapshot_error_response(err),
    }
}

pub(crate) async fn compute_snapshot_handler(
    State(api): State<Arc<ClinicalApi>>,
    Path(patient_id): Path<String>,
    axum::Json(request): axum::Json<ComputeSnapshotRequest>,
) -> Response {
    let now = request.as_of.unwrap_or_else(Utc::now);
    match api.snapshots.compute_snapshot(
        &PatientId(patient_id),
        &DoctorId(request.doctor_id),
        request.persist,
        now,
    ) {
        Ok(snapshot) => (StatusCode::CREATED, axum::Json(snapshot)).into_response(),
        Err(err) => snapshot_error_response(err),
    }
}

pub(crate) async fn doctor_review_handler(
    State(api): State<Arc<ClinicalApi>>,
    Path(patient_id): Path<String>,
) -> Response {
    match api
        .snapshots
        .mark_doctor_reviewed(&PatientId(patient_id), Utc::now())
    {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(json!({ "success": true })),
        )
            .into_response(),
        Err(err) => snapshot_error_response(err),
    }
}

pub(crate) async fn preview_handler(
    State(api): State<Arc<ClinicalApi>>,
    axum::Json(request): axum::Json<PreviewRequest>,
) -> Response {
    let now = request.as_of.unwrap_or_else(Utc::now);
    let scan_cap = request
        .scan_cap
        .unwrap_or(api.preview_scan_cap)
        .min(api.preview_scan_cap);
    let _ = request.severity;
    match api
        .snapshots
        .preview_impact(&request.rule_expression, scan_cap, now)
    {
        Ok(impact) => (StatusCode::OK, axum::Json(impact)).into_response(),
        Err(err) => snapshot_error_response(err),
    }
}

pub(crate) async fn create_version_handler(
    State(api): State<Arc<ClinicalApi>>,
    Path(alert_id): Path<String>,
    axum::Json(request): axum::Json<CreateVersionRequest>,
) -> Response {
    match api.versioning.create_version(
        &AlertId(alert_id),
        request.rule_expression,
        request.severity,
        request.change_reason,
        request.created_by,
        Utc::now(),
    ) {
        Ok(created) => (
            StatusCode::CREATED,
            axum::Json(CreateVersionResponse {
                version_id: created.version.id.clone(),
                version: created.version.version,
                requires_approval: created.requires_approval,
                state: created.version.state().label(),
            }),
        )
            .into_response(),
        Err(err) => versioning_error_response(err),
    }
}

pub(crate) async fn approve_version_handler(
    State(api): State<Arc<ClinicalApi>>,
    Path(version_id): Path<String>,
    axum::Json(request): axum::Json<ApproveVersionRequest>,
) -> Response {
    match api.versioning.approve_version(
        &RuleVersionId(version_id),
        request.approved_by,
        Utc::now(),
    ) {
        Ok(version) => (
            StatusCode::OK,
            axum::Json(json!({
                "success": true,
                "message": format!(
                    "version {} of alert {} is now active",
                    version.version, version.alert_id.0
                ),
            })),
        )
            .into_response(),
        Err(err) => versioning_error_response(err),
    }
}

pub(crate) async fn rollback_handler(
    State(api): State<Arc<ClinicalApi>>,
    Path(alert_id): Path<String>,
    axum::Json(request): axum::Json<RollbackRequest>,
) -> Response {
    match api.versioning.rollback(
        &AlertId(alert_id),
        request.target_version,
        request.rolled_back_by,
        request.reason,
        Utc::now(),
    ) {
        Ok(created) => {
            let message = if created.requires_approval {
                format!(
                    "rollback recorded as version {}, awaiting approval",
                    created.version.version
                )
            } else {
                format!(
                    "rollback recorded as version {} and activated",
                    created.version.version
                )
            };
            (
                StatusCode::CREATED,
                axum::Json(json!({
                    "version_id": created.version.id,
                    "version": created.version.version,
                    "requires_approval": created.requires_approval,
                    "message": message,
                })),
            )
                .into_response()
        }
        Err(err) => versioning_error_response(err),
    }
}

pub(crate) async fn alert_versions_handler(
    State(api): State<Arc<ClinicalApi>>,
    Path(alert_id): Path<String>,
) -> Response {
    match api.versioning.alert_versions(&AlertId(alert_id)) {
        Ok(versions) => (StatusCode::OK, axum::Json(versions)).into_response(),
        Err(err) => versioning_error_response(err),
    }
}

pub(crate) async fn pending_approvals_handler(State(api): State<Arc<ClinicalApi>>) -> Response {
    match api.versioning.pending_approvals() {
        Ok(versions) => (StatusCode::OK, axum::Json(versions)).into_response(),
        Err(err) => versioning_error_response(err),
    }
}

pub(crate) async fn audit_trail_handler(
    State(api): State<Arc<ClinicalApi>>,
    Path(alert_id): Path<String>,
) -> Response {
    match api.versioning.audit_trail(&AlertId(alert_id)) {
        Ok(events) => (StatusCode::OK, axum::Json(events)).into_response(),
        Err(err) => versioning_error_response(err),
    }
}

fn snapshot_error_response(err: SnapshotError) -> Response {
    let (status, message) = match &err {
        SnapshotError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SnapshotError::Context(_) | SnapshotError::Directory(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        SnapshotError::Repository(RepositoryError::Unavailable(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        SnapshotError::Repository(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    (status, axum::Json(json!({ "error": message }))).into_response()
}

fn versioning_error_response(err: VersioningError) -> Response {
    let (status, message) = match &err {
        VersioningError::MalformedRule(_) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        VersioningError::VersionNotFound(_) | VersioningError::UnknownTargetVersion { .. } => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        VersioningError::NotPending { .. } => (StatusCode::CONFLICT, err.to_string()),
        VersioningError::Repository(RepositoryError::Unavailable(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        VersioningError::Repository(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    (status, axum::Json(json!({ "error": message }))).into_response()
}
