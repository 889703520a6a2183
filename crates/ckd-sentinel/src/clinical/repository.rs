//! Persistence seams for rule versions and snapshots.
//!
//! Storage is append-only except for the documented narrow updates: the
//! enabled/deprecated/approval fields during a lifecycle transition, and
//! `last_doctor_reviewed_at` on a snapshot row. Write ordering for a
//! snapshot's three related inserts is rule set first, snapshot second, alert
//! events third: a crash may orphan a rule-set row (acceptable append-only
//! garbage) but can never leave a snapshot referencing a rule set that does
//! not exist.

use chrono::{DateTime, Utc};

use super::domain::{
    AlertEvent, AlertId, AuditEvent, PatientId, PatientSnapshot, RuleSetId, RuleVersion,
    RuleVersionId, Severity,
};
use super::rules::RuleExpression;

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Approval stamp applied when a gated version is activated.
#[derive(Debug, Clone, PartialEq)]
pub struct Approval {
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

/// A version row before the store has numbered it. The sequential version
/// number is assigned inside [`RuleVersionRepository::insert`], under the
/// store's own synchronization, so two concurrent creates on the same alert
/// cannot both claim the same number.
#[derive(Debug, Clone)]
pub struct NewRuleVersion {
    pub id: RuleVersionId,
    pub alert_id: AlertId,
    pub rule_expression: RuleExpression,
    pub severity: Severity,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub change_reason: String,
}

/// Storage for the versioned rule definitions and their audit trail.
pub trait RuleVersionRepository: Send + Sync {
    /// Number and store a new version row: `version` is assigned as one past
    /// the highest existing number in the alert's lineage, atomically with
    /// the write.
    fn insert(&self, draft: NewRuleVersion) -> Result<RuleVersion, RepositoryError>;

    fn fetch(&self, id: &RuleVersionId) -> Result<Option<RuleVersion>, RepositoryError>;

    /// All versions for one alert lineage, version ascending.
    fn versions_for_alert(&self, alert: &AlertId) -> Result<Vec<RuleVersion>, RepositoryError>;

    /// Currently active versions across all alerts (enabled and not
    /// deprecated). Captured once at the start of a snapshot computation.
    fn active_versions(&self) -> Result<Vec<RuleVersion>, RepositoryError>;

    fn pending_approvals(&self) -> Result<Vec<RuleVersion>, RepositoryError>;

    /// Single transition that flips the version active and deprecates the
    /// previously active version of the same alert, so the at-most-one-active
    /// invariant cannot be violated between two calls.
    fn activate(
        &self,
        id: &RuleVersionId,
        approval: Option<Approval>,
        effective_from: DateTime<Utc>,
    ) -> Result<RuleVersion, RepositoryError>;

    fn append_audit(&self, event: AuditEvent) -> Result<(), RepositoryError>;

    fn audit_trail(&self, alert: &AlertId) -> Result<Vec<AuditEvent>, RepositoryError>;
}

/// Storage for snapshots, captured rule sets, and fired alert events.
pub trait SnapshotRepository: Send + Sync {
    /// Persist the exact set of rule version ids used for one evaluation.
    fn insert_rule_set(&self, versions: &[RuleVersionId]) -> Result<RuleSetId, RepositoryError>;

    fn insert_snapshot(&self, snapshot: PatientSnapshot) -> Result<(), RepositoryError>;

    fn insert_alert_events(&self, events: &[AlertEvent]) -> Result<(), RepositoryError>;

    /// Most recently evaluated snapshot for a patient.
    fn latest_snapshot(&self, patient: &PatientId)
        -> Result<Option<PatientSnapshot>, RepositoryError>;

    /// The one permitted snapshot mutation, driven by an explicit
    /// doctor-review action.
    fn mark_doctor_reviewed(
        &self,
        patient: &PatientId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Best-effort refresh of a materialized "current snapshot" view. A
    /// failure here must not fail the computation that triggered it.
    fn refresh_current_view(&self) -> Result<(), RepositoryError>;
}
