//! Structured rule expressions and their deterministic evaluator.
//!
//! `RuleExpression` is the wire form stored as rule content and carried in
//! preview/create requests; its field names (`operator`, `field`, `value`,
//! `within_days`/`withinDays`, `children`) are a compatibility contract.
//! Expressions are parsed once, at the evaluator boundary, into the closed
//! [`RuleNode`] union so that the evaluator core never touches loose strings.
//!
//! A malformed expression is not an error: it evaluates to a reasoned
//! non-match, so one bad rule in a batch never aborts evaluation of the rest.

mod evaluator;

pub use evaluator::{evaluate, EvaluationResult};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default trend window when a trend operator omits `within_days`.
pub const DEFAULT_TREND_WINDOW_DAYS: i64 = 30;
/// Default staleness window for `no_recent_data`.
pub const DEFAULT_PRESENCE_WINDOW_DAYS: i64 = 60;

/// Recursively nestable structured condition, in its JSON-compatible wire
/// shape. Immutable once embedded in a persisted rule version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExpression {
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, alias = "withinDays", skip_serializing_if = "Option::is_none")]
    pub within_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RuleExpression>,
}

impl RuleExpression {
    /// Convenience constructor for a leaf expression.
    pub fn leaf(operator: &str, field: &str, value: Value) -> Self {
        Self {
            operator: operator.to_string(),
            field: Some(field.to_string()),
            value: Some(value),
            within_days: None,
            children: Vec::new(),
        }
    }

    pub fn with_window(mut self, days: i64) -> Self {
        self.within_days = Some(days);
        self
    }

    pub fn all_of(children: Vec<RuleExpression>) -> Self {
        Self {
            operator: "and".to_string(),
            field: None,
            value: None,
            within_days: None,
            children,
        }
    }

    pub fn any_of(children: Vec<RuleExpression>) -> Self {
        Self {
            operator: "or".to_string(),
            field: None,
            value: None,
            within_days: None,
            children,
        }
    }
}

/// Simple numeric comparison against the latest scalar for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComparisonOp {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Ne,
}

impl ComparisonOp {
    pub(crate) fn symbol(&self) -> &'static str {
        match self {
            ComparisonOp::Gt => ">",
            ComparisonOp::Lt => "<",
            ComparisonOp::Gte => ">=",
            ComparisonOp::Lte => "<=",
            ComparisonOp::Eq => "==",
            ComparisonOp::Ne => "!=",
        }
    }

    pub(crate) fn holds(&self, actual: f64, threshold: f64) -> bool {
        match self {
            ComparisonOp::Gt => actual > threshold,
            ComparisonOp::Lt => actual < threshold,
            ComparisonOp::Gte => actual >= threshold,
            ComparisonOp::Lte => actual <= threshold,
            ComparisonOp::Eq => actual == threshold,
            ComparisonOp::Ne => actual != threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrendOp {
    PctDrop,
    PctRise,
    AbsChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompoundOp {
    And,
    Or,
}

impl CompoundOp {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            CompoundOp::And => "and",
            CompoundOp::Or => "or",
        }
    }
}

/// Closed field-path grammar. Unknown prefixes stay representable so the
/// evaluator can degrade them to "not found" instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldPath {
    Lab { test_type: String },
    Vital(String),
    Medications,
    Messages,
    Unknown(String),
}

impl FieldPath {
    pub(crate) fn parse(raw: &str) -> FieldPath {
        let mut parts = raw.split('.');
        match (parts.next(), parts.next()) {
            (Some("labs"), Some(test_type)) if !test_type.is_empty() => FieldPath::Lab {
                // a trailing `.values` selects the series; the scalar/series
                // distinction is decided by the operator, so it is dropped here
                test_type: test_type.to_string(),
            },
            (Some("vitals"), Some(name)) if !name.is_empty() => FieldPath::Vital(name.to_string()),
            (Some("medications"), None) => FieldPath::Medications,
            (Some("messages"), None) => FieldPath::Messages,
            _ => FieldPath::Unknown(raw.to_string()),
        }
    }
}

/// Typed form of one expression node. Compound children stay in wire form so
/// each child degrades independently when malformed.
#[derive(Debug)]
pub(crate) enum RuleNode<'a> {
    Comparison {
        op: ComparisonOp,
        field: FieldPath,
        threshold: f64,
    },
    Trend {
        op: TrendOp,
        field: FieldPath,
        threshold: f64,
        within_days: i64,
    },
    NoRecentData {
        field: FieldPath,
        within_days: i64,
    },
    MedInList {
        targets: Vec<String>,
    },
    MessageUnacknowledged,
    Compound {
        op: CompoundOp,
        children: &'a [RuleExpression],
    },
}

/// Why an expression node could not be parsed. Turned into a reasoned
/// non-match by the evaluator and into a 422 by the create-version path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParseIssue(pub String);

pub(crate) fn parse_node(expr: &RuleExpression) -> Result<RuleNode<'_>, ParseIssue> {
    let comparison = |op: ComparisonOp| -> Result<RuleNode<'_>, ParseIssue> {
        Ok(RuleNode::Comparison {
            op,
            field: require_field(expr)?,
            threshold: require_number(expr)?,
        })
    };
    let trend = |op: TrendOp| -> Result<RuleNode<'_>, ParseIssue> {
        Ok(RuleNode::Trend {
            op,
            field: require_field(expr)?,
            threshold: require_number(expr)?,
            within_days: expr.within_days.unwrap_or(DEFAULT_TREND_WINDOW_DAYS),
        })
    };

    match expr.operator.as_str() {
        "gt" => comparison(ComparisonOp::Gt),
        "lt" => comparison(ComparisonOp::Lt),
        "gte" => comparison(ComparisonOp::Gte),
        "lte" => comparison(ComparisonOp::Lte),
        "eq" => comparison(ComparisonOp::Eq),
        "ne" => comparison(ComparisonOp::Ne),
        "pct_drop" => trend(TrendOp::PctDrop),
        "pct_rise" => trend(TrendOp::PctRise),
        "abs_change" => trend(TrendOp::AbsChange),
        "no_recent_data" => Ok(RuleNode::NoRecentData {
            field: require_field(expr)?,
            within_days: expr.within_days.unwrap_or(DEFAULT_PRESENCE_WINDOW_DAYS),
        }),
        "med_in_list" => Ok(RuleNode::MedInList {
            targets: require_string_list(expr)?,
        }),
        "message_unacknowledged" => Ok(RuleNode::MessageUnacknowledged),
        "and" | "or" => {
            if expr.children.is_empty() {
                return Err(ParseIssue(format!(
                    "operator '{}' requires at least one child expression",
                    expr.operator
                )));
            }
            let op = if expr.operator == "and" {
                CompoundOp::And
            } else {
                CompoundOp::Or
            };
            Ok(RuleNode::Compound {
                op,
                children: &expr.children,
            })
        }
        other => Err(ParseIssue(format!("unknown operator '{other}'"))),
    }
}

fn require_field(expr: &RuleExpression) -> Result<FieldPath, ParseIssue> {
    match expr.field.as_deref() {
        Some(raw) if !raw.is_empty() => Ok(FieldPath::parse(raw)),
        _ => Err(ParseIssue(format!(
            "operator '{}' requires a field path",
            expr.operator
        ))),
    }
}

fn require_number(expr: &RuleExpression) -> Result<f64, ParseIssue> {
    expr.value
        .as_ref()
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            ParseIssue(format!(
                "operator '{}' requires a numeric value",
                expr.operator
            ))
        })
}

fn require_string_list(expr: &RuleExpression) -> Result<Vec<String>, ParseIssue> {
    match expr.value.as_ref() {
        Some(Value::String(single)) if !single.is_empty() => Ok(vec![single.clone()]),
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ParseIssue(format!(
                        "operator '{}' requires a list of strings",
                        expr.operator
                    ))
                })
            })
            .collect(),
        _ => Err(ParseIssue(format!(
            "operator '{}' requires a non-empty list of strings",
            expr.operator
        ))),
    }
}

/// Structural validation for authoring paths (create/rollback). Walks the
/// whole tree so nested compound children are checked too.
pub fn validate(expr: &RuleExpression) -> Result<(), String> {
    let node = parse_node(expr).map_err(|issue| issue.0)?;
    if let RuleNode::Compound { children, .. } = node {
        for child in children {
            validate(child)?;
        }
    }
    Ok(())
}
