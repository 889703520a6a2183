use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::response::Response;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

use crate::clinical::context::{
    ContextBuilder, ConversationMessage, LabPoint, LabSeries, LabStore, MedicationStore,
    MessageRecord, MessageSender, MessageStore, PatientDataContext, ProfileStore, StoreError,
    VitalsStore,
};
use crate::clinical::domain::{
    AlertEvent, AlertId, AuditEvent, DoctorId, PatientId, PatientSnapshot, RuleSetId, RuleVersion,
    RuleVersionId,
};
use crate::clinical::repository::{
    Approval, NewRuleVersion, RepositoryError, RuleVersionRepository, SnapshotRepository,
};
use crate::clinical::router::{clinical_router, ClinicalApi};
use crate::clinical::rules::RuleExpression;
use crate::clinical::service::SnapshotService;
use crate::clinical::versioning::RuleVersioningService;

/// Fixed reference instant so every windowed computation is reproducible.
pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0)
        .single()
        .expect("valid fixture instant")
}

/// Instant `days` before the fixture `now`.
pub(super) fn days_ago(days: i64) -> DateTime<Utc> {
    now() - Duration::days(days)
}

pub(super) fn point(days: i64, value: f64) -> LabPoint {
    LabPoint {
        date: days_ago(days),
        value,
    }
}

pub(super) fn patient() -> PatientId {
    PatientId("patient-1".to_string())
}

pub(super) fn doctor() -> DoctorId {
    DoctorId("doctor-1".to_string())
}

pub(super) fn alert() -> AlertId {
    AlertId("egfr-decline".to_string())
}

pub(super) fn empty_context() -> PatientDataContext {
    PatientDataContext::empty(now())
}

pub(super) fn context_with_series(test_type: &str, points: Vec<LabPoint>) -> PatientDataContext {
    let mut context = empty_context();
    context
        .labs
        .insert(test_type.to_string(), LabSeries::from_points(points));
    context
}

pub(super) fn urgent_message(days: i64, read: bool) -> MessageRecord {
    MessageRecord {
        text: "feeling dizzy and short of breath".to_string(),
        is_urgent: true,
        is_read: read,
        timestamp: days_ago(days),
    }
}

/// Rule matching a >=20% eGFR drop within 90 days.
pub(super) fn egfr_drop_rule() -> RuleExpression {
    RuleExpression::leaf("pct_drop", "labs.egfr", json!(20)).with_window(90)
}

/// Per-patient record held by the in-memory collaborator stores.
#[derive(Default, Clone)]
pub(super) struct PatientRecord {
    pub(super) labs: BTreeMap<String, Vec<LabPoint>>,
    pub(super) vitals: BTreeMap<String, f64>,
    pub(super) medications: Vec<String>,
    pub(super) messages: Vec<ConversationMessage>,
    pub(super) history: Vec<String>,
}

impl PatientRecord {
    pub(super) fn with_egfr(points: Vec<LabPoint>) -> Self {
        let mut record = Self::default();
        record.labs.insert("egfr".to_string(), points);
        record
    }
}

pub(super) fn patient_message(days: i64, urgent: bool, read: bool) -> ConversationMessage {
    ConversationMessage {
        sender: MessageSender::Patient,
        text: "message from patient".to_string(),
        is_urgent: urgent,
        is_read: read,
        timestamp: days_ago(days),
    }
}

/// One store backing every collaborator trait, with per-section failure
/// switches to exercise degradation paths.
#[derive(Default)]
pub(super) struct MemoryDataStore {
    pub(super) records: Mutex<BTreeMap<PatientId, PatientRecord>>,
    pub(super) fail_labs: AtomicBool,
    pub(super) fail_vitals: AtomicBool,
    pub(super) fail_medications: AtomicBool,
    pub(super) fail_messages: AtomicBool,
    pub(super) fail_history: AtomicBool,
}

impl MemoryDataStore {
    pub(super) fn seed(&self, patient: PatientId, record: PatientRecord) {
        self.records
            .lock()
            .expect("data mutex poisoned")
            .insert(patient, record);
    }

    fn record(&self, patient: &PatientId) -> PatientRecord {
        self.records
            .lock()
            .expect("data mutex poisoned")
            .get(patient)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self, flag: &AtomicBool, section: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable(format!("{section} store offline")))
        } else {
            Ok(())
        }
    }
}

impl LabStore for MemoryDataStore {
    fn lab_series(
        &self,
        patient: &PatientId,
    ) -> Result<BTreeMap<String, Vec<LabPoint>>, StoreError> {
        self.check(&self.fail_labs, "lab")?;
        Ok(self.record(patient).labs)
    }
}

impl VitalsStore for MemoryDataStore {
    fn latest_vitals(&self, patient: &PatientId) -> Result<BTreeMap<String, f64>, StoreError> {
        self.check(&self.fail_vitals, "vitals")?;
        Ok(self.record(patient).vitals)
    }
}

impl MedicationStore for MemoryDataStore {
    fn active_medications(&self, patient: &PatientId) -> Result<Vec<String>, StoreError> {
        self.check(&self.fail_medications, "medication")?;
        Ok(self.record(patient).medications)
    }
}

impl MessageStore for MemoryDataStore {
    fn conversation(
        &self,
        patient: &PatientId,
        _doctor: Option<&DoctorId>,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        self.check(&self.fail_messages, "message")?;
        Ok(self.record(patient).messages)
    }
}

impl ProfileStore for MemoryDataStore {
    fn medical_history(&self, patient: &PatientId) -> Result<Vec<String>, StoreError> {
        self.check(&self.fail_history, "profile")?;
        Ok(self.record(patient).history)
    }

    fn patient_ids(&self, limit: usize) -> Result<Vec<PatientId>, StoreError> {
        Ok(self
            .records
            .lock()
            .expect("data mutex poisoned")
            .keys()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub(super) struct MemoryRuleRepository {
    versions: Mutex<Vec<RuleVersion>>,
    audits: Mutex<Vec<AuditEvent>>,
}

impl RuleVersionRepository for MemoryRuleRepository {
    fn insert(&self, draft: NewRuleVersion) -> Result<RuleVersion, RepositoryError> {
        let mut guard = self.versions.lock().expect("rule mutex poisoned");
        if guard.iter().any(|existing| existing.id == draft.id) {
            return Err(RepositoryError::Conflict);
        }
        let number = guard
            .iter()
            .filter(|existing| existing.alert_id == draft.alert_id)
            .map(|existing| existing.version)
            .max()
            .unwrap_or(0)
            + 1;
        let version = RuleVersion {
            id: draft.id,
            alert_id: draft.alert_id,
            version: number,
            rule_expression: draft.rule_expression,
            severity: draft.severity,
            enabled: false,
            effective_from: None,
            created_by: draft.created_by,
            created_at: draft.created_at,
            approved_by: None,
            approved_at: None,
            change_reason: draft.change_reason,
            deprecated: false,
        };
        guard.push(version.clone());
        Ok(version)
    }

    fn fetch(&self, id: &RuleVersionId) -> Result<Option<RuleVersion>, RepositoryError> {
        let guard = self.versions.lock().expect("rule mutex poisoned");
        Ok(guard.iter().find(|version| &version.id == id).cloned())
    }

    fn versions_for_alert(&self, alert: &AlertId) -> Result<Vec<RuleVersion>, RepositoryError> {
        let guard = self.versions.lock().expect("rule mutex poisoned");
        let mut versions: Vec<RuleVersion> = guard
            .iter()
            .filter(|version| &version.alert_id == alert)
            .cloned()
            .collect();
        versions.sort_by_key(|version| version.version);
        Ok(versions)
    }

    fn active_versions(&self) -> Result<Vec<RuleVersion>, RepositoryError> {
        let guard = self.versions.lock().expect("rule mutex poisoned");
        Ok(guard
            .iter()
            .filter(|version| version.enabled && !version.deprecated)
            .cloned()
            .collect())
    }

    fn pending_approvals(&self) -> Result<Vec<RuleVersion>, RepositoryError> {
        let guard = self.versions.lock().expect("rule mutex poisoned");
        Ok(guard
            .iter()
            .filter(|version| !version.enabled && !version.deprecated)
            .cloned()
            .collect())
    }

    fn activate(
        &self,
        id: &RuleVersionId,
        approval: Option<Approval>,
        effective_from: DateTime<Utc>,
    ) -> Result<RuleVersion, RepositoryError> {
        let mut guard = self.versions.lock().expect("rule mutex poisoned");
        let alert = guard
            .iter()
            .find(|version| &version.id == id)
            .map(|version| version.alert_id.clone())
            .ok_or(RepositoryError::NotFound)?;

        for version in guard.iter_mut() {
            if version.alert_id == alert && &version.id != id && version.enabled {
                version.enabled = false;
                version.deprecated = true;
            }
        }
        let version = guard
            .iter_mut()
            .find(|version| &version.id == id)
            .ok_or(RepositoryError::NotFound)?;
        version.enabled = true;
        version.deprecated = false;
        version.effective_from = Some(effective_from);
        if let Some(approval) = approval {
            version.approved_by = Some(approval.approved_by);
            version.approved_at = Some(approval.approved_at);
        }
        Ok(version.clone())
    }

    fn append_audit(&self, event: AuditEvent) -> Result<(), RepositoryError> {
        self.audits.lock().expect("audit mutex poisoned").push(event);
        Ok(())
    }

    fn audit_trail(&self, alert: &AlertId) -> Result<Vec<AuditEvent>, RepositoryError> {
        let guard = self.audits.lock().expect("audit mutex poisoned");
        Ok(guard
            .iter()
            .filter(|event| &event.alert_id == alert)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub(super) struct MemorySnapshotRepository {
    pub(super) rule_sets: Mutex<Vec<(RuleSetId, Vec<RuleVersionId>)>>,
    pub(super) snapshots: Mutex<Vec<PatientSnapshot>>,
    pub(super) alert_events: Mutex<Vec<AlertEvent>>,
    pub(super) fail_refresh: AtomicBool,
    pub(super) refresh_calls: AtomicBool,
}

impl SnapshotRepository for MemorySnapshotRepository {
    fn insert_rule_set(&self, versions: &[RuleVersionId]) -> Result<RuleSetId, RepositoryError> {
        let mut guard = self.rule_sets.lock().expect("rule set mutex poisoned");
        let id = RuleSetId(format!("rs-{:04}", guard.len() + 1));
        guard.push((id.clone(), versions.to_vec()));
        Ok(id)
    }

    fn insert_snapshot(&self, snapshot: PatientSnapshot) -> Result<(), RepositoryError> {
        self.snapshots
            .lock()
            .expect("snapshot mutex poisoned")
            .push(snapshot);
        Ok(())
    }

    fn insert_alert_events(&self, events: &[AlertEvent]) -> Result<(), RepositoryError> {
        self.alert_events
            .lock()
            .expect("alert event mutex poisoned")
            .extend(events.iter().cloned());
        Ok(())
    }

    fn latest_snapshot(
        &self,
        patient: &PatientId,
    ) -> Result<Option<PatientSnapshot>, RepositoryError> {
        let guard = self.snapshots.lock().expect("snapshot mutex poisoned");
        Ok(guard
            .iter()
            .filter(|snapshot| &snapshot.patient_id == patient)
            .max_by_key(|snapshot| snapshot.evaluated_at)
            .cloned())
    }

    fn mark_doctor_reviewed(
        &self,
        patient: &PatientId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut guard = self.snapshots.lock().expect("snapshot mutex poisoned");
        let snapshot = guard
            .iter_mut()
            .filter(|snapshot| &snapshot.patient_id == patient)
            .max_by_key(|snapshot| snapshot.evaluated_at)
            .ok_or(RepositoryError::NotFound)?;
        snapshot.last_doctor_reviewed_at = Some(at);
        Ok(())
    }

    fn refresh_current_view(&self) -> Result<(), RepositoryError> {
        self.refresh_calls.store(true, Ordering::Relaxed);
        if self.fail_refresh.load(Ordering::Relaxed) {
            Err(RepositoryError::Unavailable(
                "current view refresh offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Fully wired engine over in-memory collaborators.
pub(super) struct Harness {
    pub(super) data: Arc<MemoryDataStore>,
    pub(super) rules: Arc<MemoryRuleRepository>,
    pub(super) snapshots: Arc<MemorySnapshotRepository>,
    pub(super) service: SnapshotService,
    pub(super) versioning: RuleVersioningService,
}

pub(super) fn harness() -> Harness {
    let data = Arc::new(MemoryDataStore::default());
    let rules = Arc::new(MemoryRuleRepository::default());
    let snapshots = Arc::new(MemorySnapshotRepository::default());
    let builder = ContextBuilder::new(
        data.clone(),
        data.clone(),
        data.clone(),
        data.clone(),
    );
    let service = SnapshotService::new(
        builder,
        data.clone(),
        rules.clone(),
        snapshots.clone(),
    );
    let versioning = RuleVersioningService::new(rules.clone());
    Harness {
        data,
        rules,
        snapshots,
        service,
        versioning,
    }
}

pub(super) fn api_router(harness: &Harness) -> axum::Router {
    clinical_router(Arc::new(ClinicalApi {
        snapshots: harness.service.clone(),
        versioning: harness.versioning.clone(),
        preview_scan_cap: 50,
    }))
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
