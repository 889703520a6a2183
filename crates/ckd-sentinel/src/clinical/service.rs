//! Snapshot computation and population preview.
//!
//! The computation is self-contained per patient: the active rule set is
//! captured once at the start, the context is built fresh, and the same set
//! of rule version ids that drove matching is the set persisted with the
//! snapshot. Preview dry-runs reuse this exact evaluator path so that a
//! preview accurately predicts production impact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::{ContextBuilder, ContextError, ProfileStore, StoreError};
use super::domain::{DoctorId, Etiology, PatientId, PatientSnapshot, RuleVersion};
use super::repository::{RepositoryError, RuleVersionRepository, SnapshotRepository};
use super::rules::{evaluate, RuleExpression};
use super::snapshot::{self, RuleMatch};

/// Upper bound on matched patient ids echoed back from a preview.
pub const PREVIEW_SAMPLE_LIMIT: usize = 25;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("no context available: {0}")]
    Context(#[from] ContextError),
    #[error("no snapshot recorded for patient {0}")]
    NotFound(String),
    #[error("patient directory unavailable: {0}")]
    Directory(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of a population dry-run for a candidate rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewImpact {
    /// Patients actually evaluated; the scan cap bounds this, and with it the
    /// work performed.
    pub evaluated_patients: usize,
    pub matched_count: usize,
    pub sample_patient_ids: Vec<PatientId>,
}

/// Orchestrates context building, rule evaluation, snapshot derivation, and
/// persistence.
#[derive(Clone)]
pub struct SnapshotService {
    context: ContextBuilder,
    profiles: Arc<dyn ProfileStore>,
    rules: Arc<dyn RuleVersionRepository>,
    snapshots: Arc<dyn SnapshotRepository>,
}

impl SnapshotService {
    pub fn new(
        context: ContextBuilder,
        profiles: Arc<dyn ProfileStore>,
        rules: Arc<dyn RuleVersionRepository>,
        snapshots: Arc<dyn SnapshotRepository>,
    ) -> Self {
        Self {
            context,
            profiles,
            rules,
            snapshots,
        }
    }

    /// Evaluate all active rules for one patient and derive a snapshot.
    /// With `persist`, the rule set is written first, then the snapshot, then
    /// one alert event per match; the cached current-view refresh afterwards
    /// is best-effort.
    pub fn compute_snapshot(
        &self,
        patient: &PatientId,
        doctor: &DoctorId,
        persist: bool,
        now: DateTime<Utc>,
    ) -> Result<PatientSnapshot, SnapshotError> {
        // capture-once-at-start: this exact set is evaluated and persisted,
        // even if an approval lands mid-computation
        let active = self.rules.active_versions()?;

        let context = self.context.build(patient, Some(doctor), now)?;

        let mut matches: Vec<RuleMatch> = active
            .iter()
            .filter_map(|version| {
                let result = evaluate(&version.rule_expression, &context);
                result.matched.then(|| RuleMatch {
                    rule_version_id: version.id.clone(),
                    alert_id: version.alert_id.clone(),
                    severity: version.severity,
                    result,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.severity.cmp(&a.severity));

        let etiology = match self.profiles.medical_history(patient) {
            Ok(history) => snapshot::etiology_from_history(&history),
            Err(err) => {
                tracing::warn!(patient = %patient.0, %err, "history fetch failed, etiology unknown");
                Etiology::Unknown
            }
        };

        let mut derived = snapshot::derive(patient, &context, etiology, &matches);

        if persist {
            let version_ids: Vec<_> = active.iter().map(|version| version.id.clone()).collect();
            let rule_set_id = self.snapshots.insert_rule_set(&version_ids)?;
            derived.rule_set_id = Some(rule_set_id);
            self.snapshots.insert_snapshot(derived.clone())?;
            let events: Vec<_> = matches
                .iter()
                .map(|matched| matched.to_alert_event(patient, now))
                .collect();
            self.snapshots.insert_alert_events(&events)?;
            if let Err(err) = self.snapshots.refresh_current_view() {
                tracing::warn!(%err, "current snapshot view refresh failed, continuing");
            }
            tracing::info!(
                patient = %patient.0,
                risk_tier = derived.risk_tier.label(),
                action_state = derived.action_state.label(),
                matched = matches.len(),
                "snapshot persisted"
            );
        }

        Ok(derived)
    }

    /// Most recently evaluated snapshot for a patient.
    pub fn latest_snapshot(&self, patient: &PatientId) -> Result<PatientSnapshot, SnapshotError> {
        self.snapshots
            .latest_snapshot(patient)?
            .ok_or_else(|| SnapshotError::NotFound(patient.0.clone()))
    }

    /// Record an explicit doctor-review action on the current snapshot.
    pub fn mark_doctor_reviewed(
        &self,
        patient: &PatientId,
        at: DateTime<Utc>,
    ) -> Result<(), SnapshotError> {
        match self.snapshots.mark_doctor_reviewed(patient, at) {
            Ok(()) => Ok(()),
            Err(RepositoryError::NotFound) => Err(SnapshotError::NotFound(patient.0.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Dry-run a candidate expression against the population. `scan_cap` is a
    /// hard bound on patient fetches, not just on returned results; nothing
    /// is persisted. A patient whose context cannot be built is skipped.
    pub fn preview_impact(
        &self,
        expression: &RuleExpression,
        scan_cap: usize,
        now: DateTime<Utc>,
    ) -> Result<PreviewImpact, SnapshotError> {
        let patients = self.profiles.patient_ids(scan_cap)?;

        let mut evaluated = 0usize;
        let mut matched_count = 0usize;
        let mut sample = Vec::new();

        for patient in patients {
            let context = match self.context.build(&patient, None, now) {
                Ok(context) => context,
                Err(err) => {
                    tracing::warn!(patient = %patient.0, %err, "skipping patient in preview");
                    continue;
                }
            };
            evaluated += 1;
            // the production evaluator, not a simplified preview path
            if evaluate(expression, &context).matched {
                matched_count += 1;
                if sample.len() < PREVIEW_SAMPLE_LIMIT {
                    sample.push(patient);
                }
            }
        }

        Ok(PreviewImpact {
            evaluated_patients: evaluated,
            matched_count,
            sample_patient_ids: sample,
        })
    }

    /// The active versions a computation would run with, exposed for
    /// listings and diagnostics.
    pub fn active_rule_versions(&self) -> Result<Vec<RuleVersion>, SnapshotError> {
        Ok(self.rules.active_versions()?)
    }
}
