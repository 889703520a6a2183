use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use ckd_sentinel::clinical::{
    AlertEvent, AlertId, Approval, AuditEvent, ContextBuilder, ConversationMessage, DoctorId,
    LabPoint, LabStore, MedicationStore, MessageSender, MessageStore, NewRuleVersion, PatientId,
    PatientSnapshot, ProfileStore, RepositoryError, RuleSetId, RuleVersion, RuleVersionId,
    RuleVersionRepository,
    RuleVersioningService, SnapshotRepository, SnapshotService, StoreError, VitalsStore,
};
use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Everything the upstream platform knows about one patient, as served by
/// the in-memory collaborator stores.
#[derive(Default, Clone)]
pub(crate) struct PatientSeed {
    pub(crate) labs: BTreeMap<String, Vec<LabPoint>>,
    pub(crate) vitals: BTreeMap<String, f64>,
    pub(crate) medications: Vec<String>,
    pub(crate) messages: Vec<ConversationMessage>,
    pub(crate) history: Vec<String>,
}

/// In-memory stand-in for the lab, vitals, medication, messaging, and
/// profile feeds, backing every collaborator trait from one record set.
#[derive(Default)]
pub(crate) struct InMemoryClinicalDirectory {
    patients: Mutex<BTreeMap<PatientId, PatientSeed>>,
}

impl InMemoryClinicalDirectory {
    pub(crate) fn seed(&self, patient: PatientId, seed: PatientSeed) {
        self.patients
            .lock()
            .expect("directory mutex poisoned")
            .insert(patient, seed);
    }

    fn record(&self, patient: &PatientId) -> PatientSeed {
        self.patients
            .lock()
            .expect("directory mutex poisoned")
            .get(patient)
            .cloned()
            .unwrap_or_default()
    }
}

impl LabStore for InMemoryClinicalDirectory {
    fn lab_series(
        &self,
        patient: &PatientId,
    ) -> Result<BTreeMap<String, Vec<LabPoint>>, StoreError> {
        Ok(self.record(patient).labs)
    }
}

impl VitalsStore for InMemoryClinicalDirectory {
    fn latest_vitals(&self, patient: &PatientId) -> Result<BTreeMap<String, f64>, StoreError> {
        Ok(self.record(patient).vitals)
    }
}

impl MedicationStore for InMemoryClinicalDirectory {
    fn active_medications(&self, patient: &PatientId) -> Result<Vec<String>, StoreError> {
        Ok(self.record(patient).medications)
    }
}

impl MessageStore for InMemoryClinicalDirectory {
    fn conversation(
        &self,
        patient: &PatientId,
        _doctor: Option<&DoctorId>,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        Ok(self.record(patient).messages)
    }
}

impl ProfileStore for InMemoryClinicalDirectory {
    fn medical_history(&self, patient: &PatientId) -> Result<Vec<String>, StoreError> {
        Ok(self.record(patient).history)
    }

    fn patient_ids(&self, limit: usize) -> Result<Vec<PatientId>, StoreError> {
        Ok(self
            .patients
            .lock()
            .expect("directory mutex poisoned")
            .keys()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct InMemoryRuleVersionRepository {
    versions: Mutex<Vec<RuleVersion>>,
    audits: Mutex<Vec<AuditEvent>>,
}

impl RuleVersionRepository for InMemoryRuleVersionRepository {
    fn insert(&self, draft: NewRuleVersion) -> Result<RuleVersion, RepositoryError> {
        let mut guard = self.versions.lock().expect("version mutex poisoned");
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
        let guard = self.versions.lock().expect("version mutex poisoned");
        Ok(guard.iter().find(|version| &version.id == id).cloned())
    }

    fn versions_for_alert(&self, alert: &AlertId) -> Result<Vec<RuleVersion>, RepositoryError> {
        let guard = self.versions.lock().expect("version mutex poisoned");
        let mut versions: Vec<RuleVersion> = guard
            .iter()
            .filter(|version| &version.alert_id == alert)
            .cloned()
            .collect();
        versions.sort_by_key(|version| version.version);
        Ok(versions)
    }

    fn active_versions(&self) -> Result<Vec<RuleVersion>, RepositoryError> {
        let guard = self.versions.lock().expect("version mutex poisoned");
        Ok(guard
            .iter()
            .filter(|version| version.enabled && !version.deprecated)
            .cloned()
            .collect())
    }

    fn pending_approvals(&self) -> Result<Vec<RuleVersion>, RepositoryError> {
        let guard = self.versions.lock().expect("version mutex poisoned");
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
        let mut guard = self.versions.lock().expect("version mutex poisoned");
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
        self.audits
            .lock()
            .expect("audit mutex poisoned")
            .push(event);
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
pub(crate) struct InMemorySnapshotRepository {
    rule_sets: Mutex<Vec<Vec<RuleVersionId>>>,
    snapshots: Mutex<Vec<PatientSnapshot>>,
    events: Mutex<Vec<AlertEvent>>,
}

impl SnapshotRepository for InMemorySnapshotRepository {
    fn insert_rule_set(&self, versions: &[RuleVersionId]) -> Result<RuleSetId, RepositoryError> {
        let mut guard = self.rule_sets.lock().expect("rule set mutex poisoned");
        guard.push(versions.to_vec());
        Ok(RuleSetId(format!("rs-{:06}", guard.len())))
    }

    fn insert_snapshot(&self, snapshot: PatientSnapshot) -> Result<(), RepositoryError> {
        self.snapshots
            .lock()
            .expect("snapshot mutex poisoned")
            .push(snapshot);
        Ok(())
    }

    fn insert_alert_events(&self, events: &[AlertEvent]) -> Result<(), RepositoryError> {
        self.events
            .lock()
            .expect("event mutex poisoned")
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
        // nothing cached in the in-memory repository
        Ok(())
    }
}

/// Wire the evaluation and governance services over one directory.
pub(crate) fn build_engine(
    directory: Arc<InMemoryClinicalDirectory>,
) -> (SnapshotService, RuleVersioningService) {
    let rules = Arc::new(InMemoryRuleVersionRepository::default());
    let snapshots = Arc::new(InMemorySnapshotRepository::default());
    let context = ContextBuilder::new(
        directory.clone(),
        directory.clone(),
        directory.clone(),
        directory.clone(),
    );
    let service = SnapshotService::new(context, directory, rules.clone(), snapshots);
    (service, RuleVersioningService::new(rules))
}

/// Small panel of synthetic patients covering the interesting cases: a
/// declining diabetic with an unread urgent message, a stable follow-up, and
/// an overdue hypertensive patient on an NSAID.
pub(crate) fn seed_demo_population(directory: &InMemoryClinicalDirectory, now: DateTime<Utc>) {
    let point = |days: i64, value: f64| LabPoint {
        date: now - Duration::days(days),
        value,
    };

    let mut declining = PatientSeed::default();
    declining
        .labs
        .insert("egfr".to_string(), vec![point(60, 70.0), point(1, 50.0)]);
    declining
        .labs
        .insert("creatinine".to_string(), vec![point(60, 1.4), point(1, 1.9)]);
    declining.vitals.insert("systolic_bp".to_string(), 158.0);
    declining.medications.push("Metformin 500mg".to_string());
    declining.messages.push(ConversationMessage {
        sender: MessageSender::Patient,
        text: "I have been dizzy since yesterday".to_string(),
        is_urgent: true,
        is_read: false,
        timestamp: now - Duration::days(1),
    });
    declining.history.push("Type 2 DM, CKD stage 3".to_string());
    directory.seed(PatientId("patient-001".to_string()), declining);

    let mut stable = PatientSeed::default();
    stable
        .labs
        .insert("egfr".to_string(), vec![point(40, 74.0), point(10, 75.0)]);
    stable.vitals.insert("systolic_bp".to_string(), 124.0);
    stable.history.push("nephrolithiasis, resolved".to_string());
    directory.seed(PatientId("patient-002".to_string()), stable);

    let mut overdue = PatientSeed::default();
    overdue
        .labs
        .insert("egfr".to_string(), vec![point(120, 38.0)]);
    overdue.medications.push("Lisinopril 10mg".to_string());
    overdue.medications.push("Ibuprofen 400mg".to_string());
    overdue
        .history
        .push("longstanding hypertension".to_string());
    directory.seed(PatientId("patient-003".to_string()), overdue);
}

pub(crate) fn parse_date(raw: &str) -> Result<DateTime<Utc>, String> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))?;
    let midday = date
        .and_hms_opt(12, 0, 0)
        .ok_or_else(|| format!("'{raw}' has no representable midday instant"))?;
    Ok(DateTime::from_naive_utc_and_offset(midday, Utc))
}
