//! Parameter validation against a workflow schema.
//!
//! Pure logic, no side effects. Every parameter is checked against every
//! constraint it declares and all violations are collected, so a caller
//! receives the complete list of problems in one round trip.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::{ParameterKind, ParameterSpec, WorkflowDefinition};

/// Parameters after defaults are filled and unknown keys are dropped.
pub type ResolvedParameters = Map<String, Value>;

/// A single violated constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    /// `payload`, `required`, `type`, `min`, `max`, `enum` or `pattern`.
    pub rule_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Every violation found while validating one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrors(pub Vec<FieldViolation>);

impl ValidationErrors {
    pub fn violations(&self) -> &[FieldViolation] {
        &self.0
    }

    /// Whether any violation concerns `field`.
    pub fn mentions(&self, field: &str) -> bool {
        self.0.iter().any(|v| v.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.0.iter().map(|v| v.message.as_str()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Validate `raw` against `definition` and resolve defaults.
pub fn validate_parameters(
    definition: &WorkflowDefinition,
    raw: &Value,
) -> Result<ResolvedParameters, ValidationErrors> {
    let empty = Map::new();
    let supplied = match raw {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(ValidationErrors(vec![FieldViolation {
                field: "parameters".to_string(),
                rule_type: "payload".to_string(),
                message: "parameters must be a JSON object".to_string(),
                value: Some(other.clone()),
            }]));
        }
    };

    for key in supplied.keys() {
        if definition.parameter(key).is_none() {
            tracing::debug!(workflow = %definition.name, parameter = %key, "Dropping unknown parameter");
        }
    }

    let mut resolved = Map::new();
    let mut violations = Vec::new();

    for spec in &definition.parameters {
        match supplied.get(&spec.name).filter(|v| !v.is_null()) {
            Some(value) => {
                let before = violations.len();
                check_value(spec, value, &mut violations);
                if violations.len() == before {
                    resolved.insert(spec.name.clone(), value.clone());
                }
            }
            None => match &spec.default {
                Some(default) => {
                    resolved.insert(spec.name.clone(), default.clone());
                }
                None if spec.required => violations.push(FieldViolation {
                    field: spec.name.clone(),
                    rule_type: "required".to_string(),
                    message: format!("missing required parameter '{}'", spec.name),
                    value: None,
                }),
                None => {}
            },
        }
    }

    if violations.is_empty() {
        Ok(resolved)
    } else {
        Err(ValidationErrors(violations))
    }
}

fn violation(spec: &ParameterSpec, rule_type: &str, message: String, value: &Value) -> FieldViolation {
    FieldViolation {
        field: spec.name.clone(),
        rule_type: rule_type.to_string(),
        message,
        value: Some(value.clone()),
    }
}

fn check_value(spec: &ParameterSpec, value: &Value, out: &mut Vec<FieldViolation>) {
    if !matches_kind(spec.kind, value) {
        out.push(violation(
            spec,
            "type",
            format!("'{}' must be of type {}", spec.name, spec.kind),
            value,
        ));
        return;
    }

    match spec.kind {
        ParameterKind::Integer | ParameterKind::Number => {
            if let Some(n) = value.as_f64() {
                check_bounds(spec, n, &spec.name, value, out);
            }
            check_allowed(spec, value, out);
        }
        ParameterKind::String => {
            if let Some(s) = value.as_str() {
                check_bounds(spec, s.chars().count() as f64, &format!("length of '{}'", spec.name), value, out);
                check_pattern(spec, s, value, out);
            }
            check_allowed(spec, value, out);
        }
        ParameterKind::StringList => {
            let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
            check_bounds(spec, items.len() as f64, &format!("item count of '{}'", spec.name), value, out);
            for item in items {
                check_allowed(spec, item, out);
            }
        }
        ParameterKind::Dimensions => {
            let components = value.as_array().map(Vec::as_slice).unwrap_or_default();
            let subject = format!("each component of '{}'", spec.name);
            // Components are positive even when the schema declares no minimum.
            if spec.min.is_none() && components.iter().any(|n| n.as_u64() == Some(0)) {
                out.push(violation(spec, "min", format!("{subject} must be >= 1"), value));
            }
            for component in components {
                if let Some(n) = component.as_f64() {
                    check_bounds(spec, n, &subject, value, out);
                }
            }
        }
        ParameterKind::Boolean => check_allowed(spec, value, out),
    }
}

fn matches_kind(kind: ParameterKind, value: &Value) -> bool {
    match kind {
        ParameterKind::String => value.is_string(),
        ParameterKind::Integer => value.is_i64() || value.is_u64(),
        ParameterKind::Number => value.is_number(),
        ParameterKind::Boolean => value.is_boolean(),
        ParameterKind::StringList => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string)),
        ParameterKind::Dimensions => value
            .as_array()
            .is_some_and(|items| items.len() == 2 && items.iter().all(Value::is_u64)),
    }
}

fn check_bounds(spec: &ParameterSpec, n: f64, subject: &str, value: &Value, out: &mut Vec<FieldViolation>) {
    if let Some(min) = spec.min {
        if n < min {
            out.push(violation(spec, "min", format!("{subject} must be >= {min}"), value));
        }
    }
    if let Some(max) = spec.max {
        if n > max {
            out.push(violation(spec, "max", format!("{subject} must be <= {max}"), value));
        }
    }
}

fn check_allowed(spec: &ParameterSpec, value: &Value, out: &mut Vec<FieldViolation>) {
    let Some(allowed) = &spec.allowed else {
        return;
    };
    if !allowed.contains(value) {
        let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
        out.push(violation(
            spec,
            "enum",
            format!(
                "'{}' has unknown value {value}; expected one of {}",
                spec.name,
                options.join(", ")
            ),
            value,
        ));
    }
}

fn check_pattern(spec: &ParameterSpec, s: &str, value: &Value, out: &mut Vec<FieldViolation>) {
    let Some(pattern) = &spec.pattern else {
        return;
    };
    match Regex::new(pattern) {
        Ok(re) if re.is_match(s) => {}
        Ok(_) => out.push(violation(
            spec,
            "pattern",
            format!("'{}' must match pattern {pattern}", spec.name),
            value,
        )),
        Err(e) => {
            tracing::warn!(parameter = %spec.name, error = %e, "Ignoring invalid parameter pattern");
        }
    }
}
