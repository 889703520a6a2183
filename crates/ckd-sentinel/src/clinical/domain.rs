//! Identifiers, classifications, and persisted record shapes shared across
//! the rule engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::RuleExpression;

/// Identifier wrapper for patients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatientId(pub String);

/// Identifier wrapper for the doctor owning a care relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DoctorId(pub String);

/// Groups every version of the same logical alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertId(pub String);

/// Identifier for one persisted rule version row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleVersionId(pub String);

/// Identifier for an immutable captured set of rule version ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSetId(pub String);

/// Alert severity with a total order; approval gating keys off the top two.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Review,
    High,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Review => "review",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// High and critical rule changes must be approved before activation.
    pub fn requires_approval(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

/// Coarse three-level patient classification feeding into the action state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskTier {
    Stable,
    Watch,
    HighRisk,
}

impl RiskTier {
    pub fn label(&self) -> &'static str {
        match self {
            RiskTier::Stable => "stable",
            RiskTier::Watch => "watch",
            RiskTier::HighRisk => "high-risk",
        }
    }
}

/// Three-level urgency classification governing whether a clinician must act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionState {
    NoAction,
    Review,
    Immediate,
}

impl ActionState {
    pub fn label(&self) -> &'static str {
        match self {
            ActionState::NoAction => "no-action",
            ActionState::Review => "review",
            ActionState::Immediate => "immediate",
        }
    }
}

/// KDIGO-style CKD stage derived from the latest eGFR. A pure lookup, not
/// inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CkdStage {
    Stage1,
    Stage2,
    Stage3a,
    Stage3b,
    Stage4,
    Stage5,
    Unknown,
}

impl CkdStage {
    pub fn label(&self) -> &'static str {
        match self {
            CkdStage::Stage1 => "stage1",
            CkdStage::Stage2 => "stage2",
            CkdStage::Stage3a => "stage3a",
            CkdStage::Stage3b => "stage3b",
            CkdStage::Stage4 => "stage4",
            CkdStage::Stage5 => "stage5",
            CkdStage::Unknown => "unknown",
        }
    }
}

/// Etiology is taken from doctor-entered history text only, never inferred
/// from lab values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Etiology {
    Diabetes,
    Hypertension,
    Unknown,
}

impl Etiology {
    pub fn label(&self) -> &'static str {
        match self {
            Etiology::Diabetes => "diabetes",
            Etiology::Hypertension => "hypertension",
            Etiology::Unknown => "unknown",
        }
    }
}

/// One rule that fired during a snapshot computation, as recorded on the
/// snapshot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub rule_version_id: RuleVersionId,
    pub alert_id: AlertId,
    pub severity: Severity,
    pub reason: String,
}

/// Immutable, append-only point-in-time evaluation result for one patient.
///
/// Inserted once and never updated, with one deliberate narrow exception:
/// `last_doctor_reviewed_at` is set by an explicit doctor-review action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSnapshot {
    pub patient_id: PatientId,
    pub evaluated_at: DateTime<Utc>,
    pub ckd_stage: CkdStage,
    pub etiology: Etiology,
    pub risk_tier: RiskTier,
    /// Field names of high/critical matches, capped at five entries.
    pub abnormal_trends: Vec<String>,
    /// Binary signal (0 or 1) preserved from the observed upstream design.
    pub pending_lab_count: u8,
    pub unreviewed_high_message_count: u32,
    pub action_state: ActionState,
    pub action_reason: String,
    pub last_doctor_reviewed_at: Option<DateTime<Utc>>,
    /// Present once the snapshot has been persisted against a captured rule set.
    pub rule_set_id: Option<RuleSetId>,
    pub matched_rules: Vec<MatchedRule>,
}

/// One row per (patient, rule version, firing time). Append-only audit data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub patient_id: PatientId,
    pub rule_version_id: RuleVersionId,
    pub alert_id: AlertId,
    pub severity: Severity,
    pub reason: String,
    pub fired_at: DateTime<Utc>,
}

/// Lifecycle state derived from the persisted flag pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionState {
    PendingApproval,
    Active,
    Deprecated,
}

impl VersionState {
    pub fn label(&self) -> &'static str {
        match self {
            VersionState::PendingApproval => "pending-approval",
            VersionState::Active => "active",
            VersionState::Deprecated => "deprecated",
        }
    }
}

/// Persisted, versioned rule definition. Rows are never deleted; lifecycle
/// transitions only touch the enabled/deprecated/approval fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleVersion {
    pub id: RuleVersionId,
    pub alert_id: AlertId,
    /// Monotonically increasing per alert, starting at 1.
    pub version: u32,
    pub rule_expression: RuleExpression,
    pub severity: Severity,
    pub enabled: bool,
    pub effective_from: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub change_reason: String,
    pub deprecated: bool,
}

impl RuleVersion {
    pub fn state(&self) -> VersionState {
        if self.deprecated {
            VersionState::Deprecated
        } else if self.enabled {
            VersionState::Active
        } else {
            VersionState::PendingApproval
        }
    }
}

/// What happened to a rule lineage, for the append-only audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    Created,
    Activated,
    Approved,
    RolledBack,
}

/// Append-only audit record for a versioning transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub alert_id: AlertId,
    pub rule_version_id: RuleVersionId,
    pub action: AuditAction,
    pub actor: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}
