use std::sync::Arc;

use chrono::{DateTime, Utc};
use ckd_sentinel::clinical::{
    AlertId, DoctorId, PatientId, PatientSnapshot, RuleExpression, Severity,
};
use ckd_sentinel::error::AppError;
use clap::Args;
use serde_json::json;

use crate::infra::{build_engine, seed_demo_population, InMemoryClinicalDirectory};

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Evaluation instant (YYYY-MM-DD, evaluated at midday UTC). Defaults to now.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) as_of: Option<DateTime<Utc>>,
    /// Scan cap used for the preview dry-run.
    #[arg(long, default_value_t = 50)]
    pub(crate) scan_cap: usize,
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let now = args.as_of.unwrap_or_else(Utc::now);

    let directory = Arc::new(InMemoryClinicalDirectory::default());
    seed_demo_population(&directory, now);
    let (snapshots, versioning) = build_engine(directory);

    println!("CKD Sentinel demo ({})", now.format("%Y-%m-%d"));
    println!();
    println!("== rule governance ==");

    let decline_expression =
        RuleExpression::leaf("pct_drop", "labs.egfr", json!(20)).with_window(90);

    // preview before anything is active: same evaluator, nothing persisted
    let impact = snapshots.preview_impact(&decline_expression, args.scan_cap, now)?;
    println!(
        "preview of eGFR decline rule: {}/{} patients would match",
        impact.matched_count, impact.evaluated_patients
    );
    for patient in &impact.sample_patient_ids {
        println!("  would match: {}", patient.0);
    }

    let decline_alert = AlertId("egfr-rapid-decline".to_string());
    let created = versioning.create_version(
        &decline_alert,
        decline_expression,
        Severity::Critical,
        "initial decline threshold".to_string(),
        "dr-adams".to_string(),
        now,
    )?;
    println!(
        "created {} v{} ({})",
        decline_alert.0,
        created.version.version,
        created.version.state().label()
    );
    if created.requires_approval {
        versioning.approve_version(&created.version.id, "dr-chief".to_string(), now)?;
        println!("approved {} v{}", decline_alert.0, created.version.version);
    }

    let stale_alert = AlertId("stale-labs".to_string());
    let stale = versioning.create_version(
        &stale_alert,
        RuleExpression::leaf("no_recent_data", "labs.egfr", json!(null)).with_window(60),
        Severity::High,
        "stage 3+ patients need labs every 60 days".to_string(),
        "dr-adams".to_string(),
        now,
    )?;
    if stale.requires_approval {
        versioning.approve_version(&stale.version.id, "dr-chief".to_string(), now)?;
    }
    println!("created and approved {} v{}", stale_alert.0, stale.version.version);

    let nsaid_alert = AlertId("nsaid-exposure".to_string());
    let nsaid = versioning.create_version(
        &nsaid_alert,
        RuleExpression::leaf(
            "med_in_list",
            "medications",
            json!(["ibuprofen", "naproxen", "diclofenac"]),
        ),
        Severity::Review,
        "flag nephrotoxic analgesics".to_string(),
        "dr-adams".to_string(),
        now,
    )?;
    println!(
        "created {} v{} (activated without approval gate)",
        nsaid_alert.0, nsaid.version.version
    );

    println!();
    println!("== patient snapshots ==");
    let doctor = DoctorId("dr-adams".to_string());
    for idx in 1..=3 {
        let patient = PatientId(format!("patient-{idx:03}"));
        let snapshot = snapshots.compute_snapshot(&patient, &doctor, true, now)?;
        render_snapshot(&snapshot);
    }

    println!("== audit trail: {} ==", decline_alert.0);
    for event in versioning.audit_trail(&decline_alert)? {
        println!(
            "  {} {} by {}: {}",
            event.at.format("%Y-%m-%d"),
            event.rule_version_id.0,
            event.actor,
            event.detail
        );
    }

    Ok(())
}

fn render_snapshot(snapshot: &PatientSnapshot) {
    println!(
        "{}: stage {}, etiology {}, tier {}, action {}",
        snapshot.patient_id.0,
        snapshot.ckd_stage.label(),
        snapshot.etiology.label(),
        snapshot.risk_tier.label(),
        snapshot.action_state.label()
    );
    println!("  reason: {}", snapshot.action_reason);
    if snapshot.pending_lab_count > 0 {
        println!("  pending lab work is overdue");
    }
    for matched in &snapshot.matched_rules {
        println!(
            "  [{}] {}: {}",
            matched.severity.label(),
            matched.alert_id.0,
            matched.reason
        );
    }
    println!();
}
