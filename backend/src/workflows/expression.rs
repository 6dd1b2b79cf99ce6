//! Condition expression evaluator.
//!
//! Expressions have exactly two forms:
//!   unary:  `<fieldPath> <op>`          op ∈ {is_empty, is_not_empty}
//!   binary: `<fieldPath> <op> <value>`  op ∈ {equals, not_equals, contains,
//!                                             not_contains, gt, lt}
//!
//! Examples:
//!   `contact.email contains '@gmail.com'`
//!   `triggerPayload.status equals 'active'`
//!   `opportunity.amount gt 1000`
//!   `contact.phone is_not_empty`
//!
//! Evaluation never fails: any parse or resolution problem yields `false`.
//! Operand text containing an operator token surrounded by spaces is a
//! documented limitation of the space-delimited grammar.

use serde_json::Value;
use uuid::Uuid;

/// Binary operators, in detection order. The first token found in the
/// expression (surrounded by spaces) wins.
const BINARY_OPERATORS: [&str; 6] = ["equals", "not_equals", "contains", "not_contains", "gt", "lt"];

/// Unary operators, checked before the binary scan since they have no value
/// part. With the leading space neither token is a suffix of the other, so
/// order does not matter here.
const UNARY_OPERATORS: [&str; 2] = ["is_empty", "is_not_empty"];

/// Context an expression is evaluated against. Field paths select a bucket
/// by their first dotted segment: `triggerPayload`, `contact`, `opportunity`.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub account_id: Uuid,
    pub job_id: Uuid,
    pub trigger_payload: Value,
    pub contact: Option<Value>,
    pub opportunity: Option<Value>,
}

impl EvalContext {
    pub fn new(account_id: Uuid, job_id: Uuid, trigger_payload: Value) -> Self {
        Self {
            account_id,
            job_id,
            trigger_payload,
            contact: None,
            opportunity: None,
        }
    }
}

/// Evaluate one expression. Returns `true` when the condition passes;
/// invalid expressions evaluate to `false`, never an error.
pub fn evaluate(expression: &str, context: &EvalContext) -> bool {
    let trimmed = expression.trim();

    // Unary operators first (no value part)
    for op in UNARY_OPERATORS {
        if let Some(field) = trimmed.strip_suffix(&format!(" {op}")) {
            let actual = resolve_field(field.trim(), context);
            return compare(actual.as_ref(), op, "");
        }
    }

    // Binary: "<field> <operator> <value>"
    for op in BINARY_OPERATORS {
        let marker = format!(" {op} ");
        if let Some(idx) = expression.find(&marker) {
            let field = expression[..idx].trim();
            let raw_value = expression[idx + marker.len()..].trim();
            let value = strip_quotes(raw_value);
            let actual = resolve_field(field, context);
            return compare(actual.as_ref(), op, value);
        }
    }

    tracing::debug!(
        "[account:{} job:{}] expression {:?} has no recognized operator",
        context.account_id,
        context.job_id,
        expression
    );
    false
}

/// Strip one layer of surrounding single or double quotes, if present.
fn strip_quotes(raw: &str) -> &str {
    let s = raw.strip_prefix(['\'', '"']).unwrap_or(raw);
    s.strip_suffix(['\'', '"']).unwrap_or(s)
}

/// Walk a dotted field path. The first segment picks the bucket, the rest
/// are nested key lookups; any missing intermediate yields `None`.
fn resolve_field(field_path: &str, context: &EvalContext) -> Option<Value> {
    let mut parts = field_path.split('.');
    let root = parts.next()?;

    let bucket: &Value = match root {
        "triggerPayload" => &context.trigger_payload,
        "contact" => context.contact.as_ref()?,
        "opportunity" => context.opportunity.as_ref()?,
        _ => return None,
    };

    let mut current = bucket;
    for key in parts {
        current = current.as_object()?.get(key)?;
    }
    Some(current.clone())
}

/// String coercion matching the evaluator's equality semantics: JSON strings
/// compare by their content, everything else by its JSON rendering. Trigger
/// filter matching uses the same coercion.
pub(crate) fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(actual: Option<&Value>, operator: &str, expected: &str) -> bool {
    match operator {
        "is_empty" => match actual {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        },
        "is_not_empty" => !compare(actual, "is_empty", expected),
        "equals" => actual.map(coerce_string).as_deref() == Some(expected),
        "not_equals" => actual.map(coerce_string).as_deref() != Some(expected),
        "contains" => matches!(actual, Some(Value::String(s)) if s.contains(expected)),
        "not_contains" => matches!(actual, Some(Value::String(s)) if !s.contains(expected)),
        "gt" => match (actual.and_then(coerce_number), expected.trim().parse::<f64>()) {
            (Some(a), Ok(b)) => a > b,
            _ => false,
        },
        "lt" => match (actual.and_then(coerce_number), expected.trim().parse::<f64>()) {
            (Some(a), Ok(b)) => a < b,
            _ => false,
        },
        _ => false,
    }
}
