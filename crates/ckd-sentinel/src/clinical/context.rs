//! Read-only patient data context assembled per evaluation.
//!
//! The context is built fresh for every evaluation request, never mutated and
//! never persisted. The reference instant `now` is injected by the caller so
//! that every time-windowed operator is deterministic under test; nothing in
//! the engine reads a system clock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{DoctorId, PatientId};
use super::rules::FieldPath;

/// One dated lab observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabPoint {
    pub date: DateTime<Utc>,
    pub value: f64,
}

/// Ordered value series for one test type, date ascending. Duplicate dates
/// are possible and not deduplicated; most-recent-wins is the caller's call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LabSeries {
    pub ordered_values: Vec<LabPoint>,
    pub latest_value: Option<f64>,
    pub latest_date: Option<DateTime<Utc>>,
}

impl LabSeries {
    pub fn from_points(mut points: Vec<LabPoint>) -> Self {
        points.sort_by_key(|point| point.date);
        let latest = points.last().copied();
        Self {
            latest_value: latest.map(|point| point.value),
            latest_date: latest.map(|point| point.date),
            ordered_values: points,
        }
    }
}

/// Who authored a message in a doctor/patient conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    Patient,
    Doctor,
}

/// Message as returned by the messaging collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub sender: MessageSender,
    pub text: String,
    pub is_urgent: bool,
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

/// Patient-authored message as seen by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub text: String,
    pub is_urgent: bool,
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

/// Flat snapshot-in-time view of one patient's data, consumed by the
/// evaluator through the field-path resolver and by the snapshot derivations.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientDataContext {
    pub labs: BTreeMap<String, LabSeries>,
    pub vitals: BTreeMap<String, f64>,
    /// Active medication names, lowercased.
    pub medications: BTreeSet<String>,
    pub messages: Vec<MessageRecord>,
    pub now: DateTime<Utc>,
}

impl PatientDataContext {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            labs: BTreeMap::new(),
            vitals: BTreeMap::new(),
            medications: BTreeSet::new(),
            messages: Vec::new(),
            now,
        }
    }

    /// Latest scalar for a field path, the single seam the evaluator reads
    /// scalars through. No I/O happens here.
    pub(crate) fn latest_scalar(&self, field: &FieldPath) -> Option<f64> {
        match field {
            FieldPath::Lab { test_type } => {
                self.labs.get(test_type).and_then(|series| series.latest_value)
            }
            FieldPath::Vital(name) => self.vitals.get(name).copied(),
            FieldPath::Medications | FieldPath::Messages | FieldPath::Unknown(_) => None,
        }
    }

    /// Ordered value series for a field path; empty for non-series fields.
    pub(crate) fn series(&self, field: &FieldPath) -> &[LabPoint] {
        match field {
            FieldPath::Lab { test_type } => self
                .labs
                .get(test_type)
                .map(|series| series.ordered_values.as_slice())
                .unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn unread_urgent_count(&self) -> u32 {
        self.messages
            .iter()
            .filter(|message| message.is_urgent && !message.is_read)
            .count() as u32
    }

    /// Most recent lab date across every series, for the pending-lab cadence.
    pub fn latest_lab_date(&self) -> Option<DateTime<Utc>> {
        self.labs
            .values()
            .filter_map(|series| series.latest_date)
            .max()
    }
}

/// Failure surfaced by a downstream data collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Lab results collaborator: time series by test type per patient.
pub trait LabStore: Send + Sync {
    fn lab_series(&self, patient: &PatientId)
        -> Result<BTreeMap<String, Vec<LabPoint>>, StoreError>;
}

/// Vitals collaborator: latest reading per vital name.
pub trait VitalsStore: Send + Sync {
    fn latest_vitals(&self, patient: &PatientId) -> Result<BTreeMap<String, f64>, StoreError>;
}

/// Medications collaborator: active medication names.
pub trait MedicationStore: Send + Sync {
    fn active_medications(&self, patient: &PatientId) -> Result<Vec<String>, StoreError>;
}

/// Messaging collaborator. `doctor = None` widens the scope to every
/// conversation the patient has, which preview dry-runs rely on.
pub trait MessageStore: Send + Sync {
    fn conversation(
        &self,
        patient: &PatientId,
        doctor: Option<&DoctorId>,
    ) -> Result<Vec<ConversationMessage>, StoreError>;
}

/// Patient profile collaborator: doctor-entered medical history text, plus
/// the id listing preview scans iterate over.
pub trait ProfileStore: Send + Sync {
    fn medical_history(&self, patient: &PatientId) -> Result<Vec<String>, StoreError>;
    fn patient_ids(&self, limit: usize) -> Result<Vec<PatientId>, StoreError>;
}

/// Context construction failure. Only the lab path aborts a build; CKD rules
/// are lab-centric, so a context without labs is not worth evaluating.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("lab data unavailable for patient {patient}: {source}")]
    LabsUnavailable {
        patient: String,
        source: StoreError,
    },
}

/// Assembles a [`PatientDataContext`] from the independent collaborators.
/// Every non-lab sub-fetch is independently fault-isolated: a failure
/// degrades that section to empty rather than failing the whole build.
#[derive(Clone)]
pub struct ContextBuilder {
    labs: Arc<dyn LabStore>,
    vitals: Arc<dyn VitalsStore>,
    medications: Arc<dyn MedicationStore>,
    messages: Arc<dyn MessageStore>,
}

impl ContextBuilder {
    pub fn new(
        labs: Arc<dyn LabStore>,
        vitals: Arc<dyn VitalsStore>,
        medications: Arc<dyn MedicationStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            labs,
            vitals,
            medications,
            messages,
        }
    }

    pub fn build(
        &self,
        patient: &PatientId,
        doctor: Option<&DoctorId>,
        now: DateTime<Utc>,
    ) -> Result<PatientDataContext, ContextError> {
        let labs = self
            .labs
            .lab_series(patient)
            .map_err(|source| ContextError::LabsUnavailable {
                patient: patient.0.clone(),
                source,
            })?
            .into_iter()
            .map(|(test_type, points)| (test_type, LabSeries::from_points(points)))
            .collect();

        let vitals = match self.vitals.latest_vitals(patient) {
            Ok(vitals) => vitals,
            Err(err) => {
                tracing::warn!(patient = %patient.0, %err, "vitals fetch failed, continuing without vitals");
                BTreeMap::new()
            }
        };

        let medications = match self.medications.active_medications(patient) {
            Ok(names) => names
                .into_iter()
                .map(|name| name.to_lowercase())
                .collect(),
            Err(err) => {
                tracing::warn!(patient = %patient.0, %err, "medication fetch failed, continuing without medications");
                BTreeSet::new()
            }
        };

        let messages = match self.messages.conversation(patient, doctor) {
            Ok(messages) => messages
                .into_iter()
                .filter(|message| message.sender == MessageSender::Patient)
                .map(|message| MessageRecord {
                    text: message.text,
                    is_urgent: message.is_urgent,
                    is_read: message.is_read,
                    timestamp: message.timestamp,
                })
                .collect(),
            Err(err) => {
                tracing::warn!(patient = %patient.0, %err, "message fetch failed, continuing without messages");
                Vec::new()
            }
        };

        Ok(PatientDataContext {
            labs,
            vitals,
            medications,
            messages,
            now,
        })
    }
}
