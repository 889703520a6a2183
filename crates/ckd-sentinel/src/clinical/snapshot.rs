//! Pure derivations that reduce evaluator matches and domain heuristics into
//! an immutable [`PatientSnapshot`].
//!
//! The stage thresholds, etiology vocabulary, and lab cadence table are fixed
//! domain heuristics preserved exactly as given; they are lookup tables, not a
//! place for tuning.

use chrono::{DateTime, Utc};

use super::context::PatientDataContext;
use super::domain::{
    ActionState, AlertEvent, AlertId, CkdStage, Etiology, MatchedRule, PatientId, PatientSnapshot,
    RiskTier, RuleVersionId, Severity,
};
use super::rules::EvaluationResult;

/// Snapshots keep at most this many abnormal trend field names.
pub const MAX_ABNORMAL_TRENDS: usize = 5;

/// One active rule that fired, with its full evaluation result. Service-side
/// shape; [`MatchedRule`] is the narrower persisted view.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule_version_id: RuleVersionId,
    pub alert_id: AlertId,
    pub severity: Severity,
    pub result: EvaluationResult,
}

impl RuleMatch {
    pub fn to_matched_rule(&self) -> MatchedRule {
        MatchedRule {
            rule_version_id: self.rule_version_id.clone(),
            alert_id: self.alert_id.clone(),
            severity: self.severity,
            reason: self.result.reason.clone(),
        }
    }

    pub fn to_alert_event(&self, patient: &PatientId, fired_at: DateTime<Utc>) -> AlertEvent {
        AlertEvent {
            patient_id: patient.clone(),
            rule_version_id: self.rule_version_id.clone(),
            alert_id: self.alert_id.clone(),
            severity: self.severity,
            reason: self.result.reason.clone(),
            fired_at,
        }
    }
}

/// KDIGO-style stage lookup from the latest eGFR.
pub fn ckd_stage(latest_egfr: Option<f64>) -> CkdStage {
    match latest_egfr {
        Some(egfr) if egfr >= 90.0 => CkdStage::Stage1,
        Some(egfr) if egfr >= 60.0 => CkdStage::Stage2,
        Some(egfr) if egfr >= 45.0 => CkdStage::Stage3a,
        Some(egfr) if egfr >= 30.0 => CkdStage::Stage3b,
        Some(egfr) if egfr >= 15.0 => CkdStage::Stage4,
        Some(_) => CkdStage::Stage5,
        None => CkdStage::Unknown,
    }
}

/// Keyword match over doctor-entered history text. Diabetes wins over
/// hypertension when both appear, mirroring the upstream ordering.
pub fn etiology_from_history(history: &[String]) -> Etiology {
    let mut hypertension = false;
    for entry in history {
        let lowered = entry.to_lowercase();
        if ["diabetes", "diabetic", "dm type", "type 1 dm", "type 2 dm"]
            .iter()
            .any(|keyword| lowered.contains(keyword))
        {
            return Etiology::Diabetes;
        }
        if ["hypertension", "hypertensive", "htn"]
            .iter()
            .any(|keyword| lowered.contains(keyword))
        {
            hypertension = true;
        }
    }
    if hypertension {
        Etiology::Hypertension
    } else {
        Etiology::Unknown
    }
}

/// Stage-dependent expected lab cadence in days.
pub fn expected_lab_cadence_days(stage: CkdStage) -> i64 {
    match stage {
        CkdStage::Stage5 => 15,
        CkdStage::Stage4 => 30,
        CkdStage::Stage3a | CkdStage::Stage3b => 45,
        CkdStage::Stage2 => 90,
        CkdStage::Stage1 | CkdStage::Unknown => 180,
    }
}

/// Binary pending-lab signal: 1 when the most recent lab (any test type) is
/// older than the stage cadence, or when no lab was ever recorded.
pub fn pending_lab_count(stage: CkdStage, context: &PatientDataContext) -> u8 {
    match context.latest_lab_date() {
        Some(latest) => {
            let days_since = (context.now - latest).num_days();
            if days_since > expected_lab_cadence_days(stage) {
                1
            } else {
                0
            }
        }
        None => 1,
    }
}

/// Risk tier with its generated reason.
pub fn risk_tier(
    matches: &[RuleMatch],
    unread_urgent: u32,
    pending_labs: u8,
) -> (RiskTier, String) {
    if !matches.is_empty() || unread_urgent > 0 {
        let reason = if matches.is_empty() {
            format!("{unread_urgent} unread urgent message(s)")
        } else {
            format!(
                "{} rule(s) matched, highest severity {}",
                matches.len(),
                matches
                    .iter()
                    .map(|m| m.severity)
                    .max()
                    .unwrap_or(Severity::Info)
                    .label()
            )
        };
        (RiskTier::HighRisk, reason)
    } else if pending_labs > 0 {
        (
            RiskTier::Watch,
            "expected lab work is overdue".to_string(),
        )
    } else {
        (RiskTier::Stable, "no abnormal signals".to_string())
    }
}

/// Field names of high/critical matches, deduplicated in severity-descending
/// order and capped at [`MAX_ABNORMAL_TRENDS`].
pub fn abnormal_trends(matches: &[RuleMatch]) -> Vec<String> {
    let mut trends: Vec<String> = Vec::new();
    for matched in matches {
        if matched.severity < Severity::High {
            continue;
        }
        if let Some(field) = matched.result.field.as_ref() {
            if !trends.contains(field) {
                trends.push(field.clone());
            }
        }
        if trends.len() == MAX_ABNORMAL_TRENDS {
            break;
        }
    }
    trends
}

/// Action state derivation. The priority order makes the hard invariant hold
/// by construction: no-action is only reachable when every escalating signal
/// (unread urgent messages, abnormal trends, high-risk tier, watch tier) is
/// absent.
pub fn action_state(
    unread_urgent: u32,
    trends: &[String],
    tier: RiskTier,
    tier_reason: &str,
) -> (ActionState, String) {
    if unread_urgent > 0 {
        return (
            ActionState::Immediate,
            format!("{unread_urgent} unread urgent patient message(s)"),
        );
    }
    if !trends.is_empty() {
        return (
            ActionState::Immediate,
            format!("abnormal trend in {}", trends.join(", ")),
        );
    }
    match tier {
        RiskTier::HighRisk => (
            ActionState::Immediate,
            format!("patient classified high-risk: {tier_reason}"),
        ),
        RiskTier::Watch => (
            ActionState::Review,
            format!("patient on watch: {tier_reason}"),
        ),
        RiskTier::Stable => (ActionState::NoAction, "no action needed".to_string()),
    }
}

/// Assemble the full snapshot record from the evaluated matches and context.
/// `rule_set_id` stays empty; the persistence path fills it in after the rule
/// set row is written.
pub fn derive(
    patient: &PatientId,
    context: &PatientDataContext,
    etiology: Etiology,
    matches: &[RuleMatch],
) -> PatientSnapshot {
    let stage = ckd_stage(
        context
            .labs
            .get("egfr")
            .and_then(|series| series.latest_value),
    );
    let pending = pending_lab_count(stage, context);
    let unread_urgent = context.unread_urgent_count();
    let (tier, tier_reason) = risk_tier(matches, unread_urgent, pending);
    let trends = abnormal_trends(matches);
    let (action, action_reason) = action_state(unread_urgent, &trends, tier, &tier_reason);

    PatientSnapshot {
        patient_id: patient.clone(),
        evaluated_at: context.now,
        ckd_stage: stage,
        etiology,
        risk_tier: tier,
        abnormal_trends: trends,
        pending_lab_count: pending,
        unreviewed_high_message_count: unread_urgent,
        action_state: action,
        action_reason,
        last_doctor_reviewed_at: None,
        rule_set_id: None,
        matched_rules: matches.iter().map(RuleMatch::to_matched_rule).collect(),
    }
}
