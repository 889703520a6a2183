//! End-to-end workflow over the public crate surface: a governed rule is
//! created, approved, evaluated into a persisted snapshot, previewed, and
//! rolled back, all against in-memory collaborators.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use ckd_sentinel::clinical::{
    ActionState, AlertEvent, AlertId, Approval, AuditEvent, ContextBuilder, ConversationMessage,
    DoctorId, LabPoint, LabStore, MedicationStore, MessageStore, NewRuleVersion, PatientId,
    PatientSnapshot, ProfileStore, RepositoryError, RiskTier, RuleExpression, RuleSetId,
    RuleVersion, RuleVersionId, RuleVersionRepository, RuleVersioningService, Severity,
    SnapshotRepository, SnapshotService, StoreError, VersionState, VitalsStore,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0)
        .single()
        .expect("valid fixture instant")
}

fn days_ago(days: i64) -> DateTime<Utc> {
    now() - Duration::days(days)
}

#[derive(Default)]
struct World {
    labs: Mutex<BTreeMap<PatientId, BTreeMap<String, Vec<LabPoint>>>>,
    histories: Mutex<BTreeMap<PatientId, Vec<String>>>,
}

impl World {
    fn seed_egfr(&self, patient: &PatientId, points: Vec<(i64, f64)>) {
        let points = points
            .into_iter()
            .map(|(days, value)| LabPoint {
                date: days_ago(days),
                value,
            })
            .collect();
        let mut series = BTreeMap::new();
        series.insert("egfr".to_string(), points);
        self.labs
            .lock()
            .expect("lab mutex poisoned")
            .insert(patient.clone(), series);
    }
}

impl LabStore for World {
    fn lab_series(
        &self,
        patient: &PatientId,
    ) -> Result<BTreeMap<String, Vec<LabPoint>>, StoreError> {
        Ok(self
            .labs
            .lock()
            .expect("lab mutex poisoned")
            .get(patient)
            .cloned()
            .unwrap_or_default())
    }
}

impl VitalsStore for World {
    fn latest_vitals(&self, _patient: &PatientId) -> Result<BTreeMap<String, f64>, StoreError> {
        Ok(BTreeMap::new())
    }
}

impl MedicationStore for World {
    fn active_medications(&self, _patient: &PatientId) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

impl MessageStore for World {
    fn conversation(
        &self,
        _patient: &PatientId,
        _doctor: Option<&DoctorId>,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        Ok(Vec::new())
    }
}

impl ProfileStore for World {
    fn medical_history(&self, patient: &PatientId) -> Result<Vec<String>, StoreError> {
        Ok(self
            .histories
            .lock()
            .expect("history mutex poisoned")
            .get(patient)
            .cloned()
            .unwrap_or_default())
    }

    fn patient_ids(&self, limit: usize) -> Result<Vec<PatientId>, StoreError> {
        Ok(self
            .labs
            .lock()
            .expect("lab mutex poisoned")
            .keys()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct Registry {
    versions: Mutex<Vec<RuleVersion>>,
    audits: Mutex<Vec<AuditEvent>>,
}

impl RuleVersionRepository for Registry {
    fn insert(&self, draft: NewRuleVersion) -> Result<RuleVersion, RepositoryError> {
        let mut guard = self.versions.lock().expect("version mutex poisoned");
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
        Ok(self
            .versions
            .lock()
            .expect("version mutex poisoned")
            .iter()
            .find(|version| &version.id == id)
            .cloned())
    }

    fn versions_for_alert(&self, alert: &AlertId) -> Result<Vec<RuleVersion>, RepositoryError> {
        let mut versions: Vec<RuleVersion> = self
            .versions
            .lock()
            .expect("version mutex poisoned")
            .iter()
            .filter(|version| &version.alert_id == alert)
            .cloned()
            .collect();
        versions.sort_by_key(|version| version.version);
        Ok(versions)
    }

    fn active_versions(&self) -> Result<Vec<RuleVersion>, RepositoryError> {
        Ok(self
            .versions
            .lock()
            .expect("version mutex poisoned")
            .iter()
            .filter(|version| version.enabled && !version.deprecated)
            .cloned()
            .collect())
    }

    fn pending_approvals(&self) -> Result<Vec<RuleVersion>, RepositoryError> {
        Ok(self
            .versions
            .lock()
            .expect("version mutex poisoned")
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
        Ok(self
            .audits
            .lock()
            .expect("audit mutex poisoned")
            .iter()
            .filter(|event| &event.alert_id == alert)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct SnapshotStore {
    rule_sets: Mutex<Vec<Vec<RuleVersionId>>>,
    snapshots: Mutex<Vec<PatientSnapshot>>,
    events: Mutex<Vec<AlertEvent>>,
}

impl SnapshotRepository for SnapshotStore {
    fn insert_rule_set(&self, versions: &[RuleVersionId]) -> Result<RuleSetId, RepositoryError> {
        let mut guard = self.rule_sets.lock().expect("rule set mutex poisoned");
        guard.push(versions.to_vec());
        Ok(RuleSetId(format!("rs-{}", guard.len())))
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
        Ok(self
            .snapshots
            .lock()
            .expect("snapshot mutex poisoned")
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
        Ok(())
    }
}

struct Setup {
    service: SnapshotService,
    versioning: RuleVersioningService,
    registry: Arc<Registry>,
    snapshots: Arc<SnapshotStore>,
    world: Arc<World>,
}

fn setup() -> Setup {
    let world = Arc::new(World::default());
    let registry = Arc::new(Registry::default());
    let snapshots = Arc::new(SnapshotStore::default());
    let context = ContextBuilder::new(
        world.clone(),
        world.clone(),
        world.clone(),
        world.clone(),
    );
    let service = SnapshotService::new(
        context,
        world.clone(),
        registry.clone(),
        snapshots.clone(),
    );
    let versioning = RuleVersioningService::new(registry.clone());
    Setup {
        service,
        versioning,
        registry,
        snapshots,
        world,
    }
}

#[test]
fn governed_rule_lifecycle_drives_patient_snapshots() {
    let s = setup();
    let patient = PatientId("patient-1".to_string());
    let doctor = DoctorId("doctor-1".to_string());
    let alert = AlertId("egfr-decline".to_string());
    s.world.seed_egfr(&patient, vec![(60, 70.0), (1, 50.0)]);
    s.world
        .histories
        .lock()
        .expect("history mutex poisoned")
        .insert(patient.clone(), vec!["type 2 dm, CKD stage 3".to_string()]);

    let expression = RuleExpression::leaf("pct_drop", "labs.egfr", json!(20)).with_window(90);

    // a critical rule stays inert until approved
    let created = s
        .versioning
        .create_version(
            &alert,
            expression.clone(),
            Severity::Critical,
            "initial decline rule".to_string(),
            "dr-adams".to_string(),
            days_ago(7),
        )
        .expect("create version");
    assert!(created.requires_approval);

    let before_approval = s
        .service
        .compute_snapshot(&patient, &doctor, true, days_ago(6))
        .expect("compute before approval");
    assert_eq!(before_approval.risk_tier, RiskTier::Stable);
    assert_eq!(before_approval.action_state, ActionState::NoAction);
    assert!(before_approval.matched_rules.is_empty());

    s.versioning
        .approve_version(&created.version.id, "dr-chief".to_string(), days_ago(5))
        .expect("approve version");

    let after_approval = s
        .service
        .compute_snapshot(&patient, &doctor, true, now())
        .expect("compute after approval");
    assert_eq!(after_approval.risk_tier, RiskTier::HighRisk);
    assert_eq!(after_approval.action_state, ActionState::Immediate);
    assert_eq!(after_approval.matched_rules.len(), 1);
    assert_eq!(after_approval.abnormal_trends, vec!["labs.egfr".to_string()]);
    assert!(after_approval.rule_set_id.is_some());

    // the persisted rule set records exactly the evaluated version
    let rule_sets = s.snapshots.rule_sets.lock().expect("rule set mutex poisoned");
    assert_eq!(rule_sets.last(), Some(&vec![created.version.id.clone()]));
    drop(rule_sets);
    let events = s.snapshots.events.lock().expect("event mutex poisoned");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::Critical);
    drop(events);

    // preview of the same expression predicts the production outcome
    let impact = s
        .service
        .preview_impact(&expression, 10, now())
        .expect("preview");
    assert_eq!(impact.evaluated_patients, 1);
    assert_eq!(impact.matched_count, 1);
    assert_eq!(impact.sample_patient_ids, vec![patient.clone()]);

    // rollback goes through the same gate and leaves v1 active meanwhile
    let rolled = s
        .versioning
        .rollback(
            &alert,
            1,
            "dr-chief".to_string(),
            "re-pin the original thresholds".to_string(),
            now(),
        )
        .expect("rollback");
    assert!(rolled.requires_approval);
    assert_eq!(rolled.version.version, 2);
    assert_eq!(rolled.version.state(), VersionState::PendingApproval);
    let active = s.registry.active_versions().expect("active versions");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, created.version.id);

    // the doctor review stamp lands on the newest snapshot
    s.service
        .mark_doctor_reviewed(&patient, now())
        .expect("review");
    let latest = s.service.latest_snapshot(&patient).expect("latest");
    assert_eq!(latest.evaluated_at, now());
    assert_eq!(latest.last_doctor_reviewed_at, Some(now()));
}
