//! Clinical rule engine: expressions, patient contexts, snapshots, and the
//! versioned rule governance workflow.

pub mod context;
pub mod domain;
pub mod repository;
pub mod router;
pub mod rules;
pub mod service;
pub mod snapshot;
pub mod versioning;

#[cfg(test)]
mod tests;

pub use context::{
    ContextBuilder, ContextError, ConversationMessage, LabPoint, LabSeries, LabStore,
    MedicationStore, MessageRecord, MessageSender, MessageStore, PatientDataContext, ProfileStore,
    StoreError, VitalsStore,
};
pub use domain::{
    ActionState, AlertEvent, AlertId, AuditAction, AuditEvent, CkdStage, DoctorId, Etiology,
    MatchedRule, PatientId, PatientSnapshot, RiskTier, RuleSetId, RuleVersion, RuleVersionId,
    Severity, VersionState,
};
pub use repository::{
    Approval, NewRuleVersion, RepositoryError, RuleVersionRepository, SnapshotRepository,
};
pub use router::{clinical_router, ClinicalApi};
pub use rules::{evaluate, EvaluationResult, RuleExpression};
pub use service::{PreviewImpact, SnapshotError, SnapshotService, PREVIEW_SAMPLE_LIMIT};
pub use snapshot::RuleMatch;
pub use versioning::{CreatedVersion, RuleVersioningService, VersioningError};
