//! Rule lifecycle: draft creation, severity-gated approval, activation,
//! rollback, and the append-only audit trail.
//!
//! A lineage only ever grows: edits and rollbacks create new version rows,
//! never mutate history. High/critical severity versions stay pending until
//! approved; lower severities activate immediately, deprecating the prior
//! active version of the same alert.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::domain::{
    AlertId, AuditAction, AuditEvent, RuleVersion, RuleVersionId, Severity, VersionState,
};
use super::repository::{Approval, NewRuleVersion, RepositoryError, RuleVersionRepository};
use super::rules::{self, RuleExpression};

static VERSION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_version_id() -> RuleVersionId {
    let id = VERSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    RuleVersionId(format!("rv-{id:06}"))
}

/// Outcome of creating a version: the stored row plus whether it is waiting
/// on approval.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedVersion {
    pub version: RuleVersion,
    pub requires_approval: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum VersioningError {
    #[error("malformed rule expression: {0}")]
    MalformedRule(String),
    #[error("rule version {0} not found")]
    VersionNotFound(String),
    #[error("alert {alert} has no version {version}")]
    UnknownTargetVersion { alert: String, version: u32 },
    #[error("rule version {version} is {state}, expected pending-approval")]
    NotPending { version: String, state: &'static str },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Service driving the versioned rule workflow over the version repository.
#[derive(Clone)]
pub struct RuleVersioningService {
    repository: Arc<dyn RuleVersionRepository>,
}

impl RuleVersioningService {
    pub fn new(repository: Arc<dyn RuleVersionRepository>) -> Self {
        Self { repository }
    }

    /// Insert the next sequential version for an alert. The repository
    /// numbers the row atomically with the write, so concurrent creates on
    /// the same alert get distinct numbers. High/critical severities are
    /// left pending approval; others activate immediately.
    pub fn create_version(
        &self,
        alert: &AlertId,
        expression: RuleExpression,
        severity: Severity,
        change_reason: String,
        created_by: String,
        now: DateTime<Utc>,
    ) -> Result<CreatedVersion, VersioningError> {
        rules::validate(&expression).map_err(VersioningError::MalformedRule)?;

        let stored = self.repository.insert(NewRuleVersion {
            id: next_version_id(),
            alert_id: alert.clone(),
            rule_expression: expression,
            severity,
            created_by: created_by.clone(),
            created_at: now,
            change_reason,
        })?;
        self.audit(
            &stored,
            AuditAction::Created,
            &created_by,
            format!("version {} created ({})", stored.version, severity.label()),
            now,
        )?;

        if severity.requires_approval() {
            tracing::info!(
                alert = %alert.0,
                version = stored.version,
                severity = severity.label(),
                "rule version pending approval"
            );
            return Ok(CreatedVersion {
                version: stored,
                requires_approval: true,
            });
        }

        let activated = self.repository.activate(&stored.id, None, now)?;
        self.audit(
            &activated,
            AuditAction::Activated,
            &created_by,
            format!("version {} activated without approval gate", activated.version),
            now,
        )?;
        tracing::info!(
            alert = %alert.0,
            version = activated.version,
            "rule version activated"
        );

        Ok(CreatedVersion {
            version: activated,
            requires_approval: false,
        })
    }

    /// Approve a pending version and activate it, deprecating whatever was
    /// previously active for the alert. Rejected unless the version is in
    /// the pending-approval state.
    pub fn approve_version(
        &self,
        id: &RuleVersionId,
        approved_by: String,
        now: DateTime<Utc>,
    ) -> Result<RuleVersion, VersioningError> {
        let version = self
            .repository
            .fetch(id)?
            .ok_or_else(|| VersioningError::VersionNotFound(id.0.clone()))?;

        if version.state() != VersionState::PendingApproval {
            return Err(VersioningError::NotPending {
                version: id.0.clone(),
                state: version.state().label(),
            });
        }

        let activated = self.repository.activate(
            id,
            Some(Approval {
                approved_by: approved_by.clone(),
                approved_at: now,
            }),
            now,
        )?;
        self.audit(
            &activated,
            AuditAction::Approved,
            &approved_by,
            format!("version {} approved and activated", activated.version),
            now,
        )?;
        tracing::info!(
            alert = %activated.alert_id.0,
            version = activated.version,
            approved_by = %approved_by,
            "rule version approved"
        );

        Ok(activated)
    }

    /// Roll an alert back to the content of a historical version. The target
    /// content is copied into a brand-new version row that goes through the
    /// same severity gate; history itself is never touched.
    pub fn rollback(
        &self,
        alert: &AlertId,
        target_version: u32,
        rolled_back_by: String,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<CreatedVersion, VersioningError> {
        let target = self
            .repository
            .versions_for_alert(alert)?
            .into_iter()
            .find(|version| version.version == target_version)
            .ok_or_else(|| VersioningError::UnknownTargetVersion {
                alert: alert.0.clone(),
                version: target_version,
            })?;

        let change_reason = format!("rollback to version {target_version}: {reason}");
        let created = self.create_version(
            alert,
            target.rule_expression.clone(),
            target.severity,
            change_reason,
            rolled_back_by.clone(),
            now,
        )?;
        self.audit(
            &created.version,
            AuditAction::RolledBack,
            &rolled_back_by,
            format!(
                "version {} restores content of version {target_version}",
                created.version.version
            ),
            now,
        )?;

        Ok(created)
    }

    pub fn pending_approvals(&self) -> Result<Vec<RuleVersion>, VersioningError> {
        Ok(self.repository.pending_approvals()?)
    }

    pub fn alert_versions(&self, alert: &AlertId) -> Result<Vec<RuleVersion>, VersioningError> {
        Ok(self.repository.versions_for_alert(alert)?)
    }

    pub fn audit_trail(&self, alert: &AlertId) -> Result<Vec<AuditEvent>, VersioningError> {
        Ok(self.repository.audit_trail(alert)?)
    }

    fn audit(
        &self,
        version: &RuleVersion,
        action: AuditAction,
        actor: &str,
        detail: String,
        at: DateTime<Utc>,
    ) -> Result<(), VersioningError> {
        self.repository.append_audit(AuditEvent {
            alert_id: version.alert_id.clone(),
            rule_version_id: version.id.clone(),
            action,
            actor: actor.to_string(),
            detail,
            at,
        })?;
        Ok(())
    }
}
