//! Pure, synchronous rule evaluation against one patient context.
//!
//! Every operator path degrades to a well-reasoned verdict; the evaluator
//! raises nothing and reads no clocks. Absence of data is domain information
//! (a reasoned non-match, or a reasoned match for `no_recent_data`), not an
//! error condition.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    parse_node, ComparisonOp, CompoundOp, FieldPath, ParseIssue, RuleExpression, RuleNode, TrendOp,
};
use crate::clinical::context::{LabPoint, PatientDataContext};

/// Verdict for one expression, with a human-readable justification trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub matched: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_value: Option<serde_json::Value>,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Evaluate one rule expression against one patient context.
pub fn evaluate(rule: &RuleExpression, context: &PatientDataContext) -> EvaluationResult {
    let node = match parse_node(rule) {
        Ok(node) => node,
        Err(ParseIssue(reason)) => return non_match(rule, reason),
    };

    match node {
        RuleNode::Comparison {
            op,
            field,
            threshold,
        } => evaluate_comparison(rule, context, op, &field, threshold),
        RuleNode::Trend {
            op,
            field,
            threshold,
            within_days,
        } => evaluate_trend(rule, context, op, &field, threshold, within_days),
        RuleNode::NoRecentData { field, within_days } => {
            evaluate_no_recent_data(rule, context, &field, within_days)
        }
        RuleNode::MedInList { targets } => evaluate_med_in_list(rule, context, &targets),
        RuleNode::MessageUnacknowledged => evaluate_message_unacknowledged(rule, context),
        RuleNode::Compound { op, children } => evaluate_compound(rule, context, op, children),
    }
}

fn evaluate_comparison(
    rule: &RuleExpression,
    context: &PatientDataContext,
    op: ComparisonOp,
    field: &FieldPath,
    threshold: f64,
) -> EvaluationResult {
    let display = field_display(rule);
    let Some(actual) = context.latest_scalar(field) else {
        // absence is never a match for simple comparisons
        return non_match(rule, format!("no data available for {display}"));
    };

    if op.holds(actual, threshold) {
        EvaluationResult {
            matched: true,
            reason: format!("{display}: {actual} {} {threshold}", op.symbol()),
            matched_value: Some(json!(actual)),
            operator: rule.operator.clone(),
            field: rule.field.clone(),
        }
    } else {
        non_match(
            rule,
            format!("{display}: {actual} not {} {threshold}", op.symbol()),
        )
    }
}

fn evaluate_trend(
    rule: &RuleExpression,
    context: &PatientDataContext,
    op: TrendOp,
    field: &FieldPath,
    threshold: f64,
    within_days: i64,
) -> EvaluationResult {
    let display = field_display(rule);
    let mut window: Vec<LabPoint> = context
        .series(field)
        .iter()
        .filter(|point| point.date >= context.now - chrono::Duration::days(within_days))
        .copied()
        .collect();
    window.sort_by_key(|point| point.date);

    if window.len() < 2 {
        return non_match(
            rule,
            format!(
                "insufficient data for {display}: {} point(s) in the last {within_days} days",
                window.len()
            ),
        );
    }

    let earliest = window[0];
    let latest = window[window.len() - 1];

    match op {
        TrendOp::PctDrop | TrendOp::PctRise => {
            if earliest.value == 0.0 {
                return non_match(
                    rule,
                    format!("cannot calculate percent change for {display}: earliest value in window is zero"),
                );
            }
            let pct = (latest.value - earliest.value) / earliest.value * 100.0;
            let matched = match op {
                TrendOp::PctDrop => pct <= -threshold,
                _ => pct >= threshold,
            };
            let direction = if op == TrendOp::PctDrop { "drop" } else { "rise" };
            if matched {
                EvaluationResult {
                    matched: true,
                    reason: format!(
                        "{display} changed {pct:.1}% over the last {within_days} days ({} -> {}), {direction} threshold {threshold}%",
                        earliest.value, latest.value
                    ),
                    matched_value: Some(json!(pct)),
                    operator: rule.operator.clone(),
                    field: rule.field.clone(),
                }
            } else {
                non_match(
                    rule,
                    format!(
                        "{display} changed {pct:.1}% over the last {within_days} days, below {direction} threshold {threshold}%"
                    ),
                )
            }
        }
        TrendOp::AbsChange => {
            let delta = (latest.value - earliest.value).abs();
            if delta >= threshold {
                EvaluationResult {
                    matched: true,
                    reason: format!(
                        "{display} changed by {delta} over the last {within_days} days ({} -> {}), threshold {threshold}",
                        earliest.value, latest.value
                    ),
                    matched_value: Some(json!(delta)),
                    operator: rule.operator.clone(),
                    field: rule.field.clone(),
                }
            } else {
                non_match(
                    rule,
                    format!(
                        "{display} changed by {delta} over the last {within_days} days, below threshold {threshold}"
                    ),
                )
            }
        }
    }
}

fn evaluate_no_recent_data(
    rule: &RuleExpression,
    context: &PatientDataContext,
    field: &FieldPath,
    within_days: i64,
) -> EvaluationResult {
    let display = field_display(rule);
    let series = context.series(field);
    let cutoff = context.now - chrono::Duration::days(within_days);
    let recent = series.iter().filter(|point| point.date >= cutoff).count();

    if recent == 0 {
        let reason = match series.last() {
            Some(last) => {
                let days_since = (context.now - last.date).num_days();
                format!(
                    "no {display} result in the last {within_days} days (last value {days_since} days ago)"
                )
            }
            None => format!("no {display} results on record"),
        };
        EvaluationResult {
            matched: true,
            reason,
            matched_value: None,
            operator: rule.operator.clone(),
            field: rule.field.clone(),
        }
    } else {
        let days_since = series
            .last()
            .map(|last| (context.now - last.date).num_days())
            .unwrap_or(0);
        non_match(
            rule,
            format!("most recent {display} value is {days_since} days old, within {within_days} days"),
        )
    }
}

fn evaluate_med_in_list(
    rule: &RuleExpression,
    context: &PatientDataContext,
    targets: &[String],
) -> EvaluationResult {
    // substring match: active "ibuprofen 400mg" hits target "ibuprofen"
    for target in targets {
        let needle = target.to_lowercase();
        if let Some(medication) = context
            .medications
            .iter()
            .find(|medication| medication.contains(&needle))
        {
            return EvaluationResult {
                matched: true,
                reason: format!("active medication '{medication}' matches target '{target}'"),
                matched_value: Some(json!(medication)),
                operator: rule.operator.clone(),
                field: rule.field.clone(),
            };
        }
    }
    non_match(
        rule,
        format!(
            "no active medication matches the target list ({} active, {} targets)",
            context.medications.len(),
            targets.len()
        ),
    )
}

fn evaluate_message_unacknowledged(
    rule: &RuleExpression,
    context: &PatientDataContext,
) -> EvaluationResult {
    let unread = context.unread_urgent_count();
    if unread > 0 {
        EvaluationResult {
            matched: true,
            reason: format!("{unread} urgent message(s) awaiting acknowledgement"),
            matched_value: Some(json!(unread)),
            operator: rule.operator.clone(),
            field: rule.field.clone(),
        }
    } else {
        non_match(rule, "no unacknowledged urgent messages".to_string())
    }
}

fn evaluate_compound(
    rule: &RuleExpression,
    context: &PatientDataContext,
    op: CompoundOp,
    children: &[RuleExpression],
) -> EvaluationResult {
    // every child is evaluated, no short-circuit: the full reason trail is
    // worth more than the saved comparisons
    let results: Vec<EvaluationResult> = children
        .iter()
        .map(|child| evaluate(child, context))
        .collect();
    let matched_count = results.iter().filter(|result| result.matched).count();
    let matched = match op {
        CompoundOp::And => matched_count == results.len(),
        CompoundOp::Or => matched_count > 0,
    };

    let detail: Vec<&str> = results
        .iter()
        .filter(|result| result.matched)
        .map(|result| result.reason.as_str())
        .collect();
    let mut reason = format!(
        "{}: {matched_count}/{} children matched",
        op.label(),
        results.len()
    );
    if !detail.is_empty() {
        reason.push_str(&format!(" [{}]", detail.join("; ")));
    }

    EvaluationResult {
        matched,
        reason,
        matched_value: None,
        operator: rule.operator.clone(),
        field: None,
    }
}

fn field_display(rule: &RuleExpression) -> String {
    rule.field.clone().unwrap_or_else(|| rule.operator.clone())
}

fn non_match(rule: &RuleExpression, reason: String) -> EvaluationResult {
    EvaluationResult {
        matched: false,
        reason,
        matched_value: None,
        operator: rule.operator.clone(),
        field: rule.field.clone(),
    }
}
