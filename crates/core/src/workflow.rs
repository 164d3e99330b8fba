//! Workflow definitions and the in-memory [`WorkflowRegistry`].
//!
//! A workflow is a named, parameterized unit of generation work with a
//! declared schema. The registry is populated once at startup (built-ins
//! plus any definitions loaded from configuration) and is read-mostly
//! afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::validation::{validate_parameters, ResolvedParameters};

/// Value type accepted by a workflow parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Integer,
    Number,
    Boolean,
    /// JSON array of strings.
    StringList,
    /// Two positive integers, `[width, height]`.
    Dimensions,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::StringList => "string_list",
            Self::Dimensions => "dimensions",
        };
        f.write_str(name)
    }
}

/// Schema entry for a single workflow parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Lower bound. Numeric value for numbers, per-component for
    /// dimensions, character count for strings, item count for lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound, same interpretation as `min`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Allowed values (per element for string lists).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Regex a string value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            min: None,
            max: None,
            allowed: None,
            pattern: None,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_allowed<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A registered workflow. Immutable once inside the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier, e.g. `basic_texture`.
    pub name: String,
    /// Human-readable title.
    pub title: String,
    /// Grouping used by discovery filters (`texture`, `material`, ...).
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Ordered parameter schema.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Checkpoints the workflow expects the backend to have.
    #[serde(default)]
    pub required_models: Vec<String>,
}

fn default_category() -> String {
    "general".to_string()
}

impl WorkflowDefinition {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Parse a JSON array of workflow definitions without registering them.
pub fn parse_definitions(json: &str) -> CoreResult<Vec<WorkflowDefinition>> {
    serde_json::from_str(json)
        .map_err(|e| CoreError::Internal(format!("Invalid workflow definitions: {e}")))
}

/// Holds every known [`WorkflowDefinition`], keyed by name.
///
/// Reads take a shared lock only long enough to clone an `Arc`, so
/// concurrent submissions never wait on each other.
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in workflows.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for definition in crate::builtin::builtin_workflows() {
            registry.register(definition);
        }
        registry
    }

    /// Add a definition, replacing any existing one with the same name.
    pub fn register(&self, definition: WorkflowDefinition) {
        let name = definition.name.clone();
        let replaced = self
            .definitions
            .write()
            .insert(name.clone(), Arc::new(definition))
            .is_some();
        tracing::debug!(workflow = %name, replaced, "Registered workflow");
    }

    /// Parse a JSON array of definitions and register each of them.
    ///
    /// Returns the number of definitions registered.
    pub fn register_json(&self, json: &str) -> CoreResult<usize> {
        let definitions = parse_definitions(json)?;
        let count = definitions.len();
        for definition in definitions {
            self.register(definition);
        }
        Ok(count)
    }

    pub fn get(&self, name: &str) -> CoreResult<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::workflow_not_found(name))
    }

    /// Validate `raw` against the named workflow's schema and return the
    /// resolved parameter set (defaults filled, unknown keys dropped).
    pub fn validate(&self, name: &str, raw: &Value) -> CoreResult<ResolvedParameters> {
        let definition = self.get(name)?;
        validate_parameters(&definition, raw).map_err(CoreError::Validation)
    }

    /// All definitions, sorted by name.
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut all: Vec<_> = self.definitions.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn list_by_category(&self, category: &str) -> Vec<Arc<WorkflowDefinition>> {
        self.list()
            .into_iter()
            .filter(|d| d.category == category)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn echo_workflow(title: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "echo".to_string(),
            title: title.to_string(),
            category: "test".to_string(),
            description: String::new(),
            parameters: vec![ParameterSpec::new("text", ParameterKind::String).required()],
            required_models: vec![],
        }
    }

    #[test]
    fn register_replaces_by_name() {
        let registry = WorkflowRegistry::new();
        registry.register(echo_workflow("first"));
        registry.register(echo_workflow("second"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().title, "second");
    }

    #[test]
    fn get_unknown_is_not_found() {
        let registry = WorkflowRegistry::with_builtins();
        assert_matches!(
            registry.get("does_not_exist"),
            Err(CoreError::NotFound { entity: "Workflow", .. })
        );
    }

    #[test]
    fn validate_unknown_workflow_is_not_found() {
        let registry = WorkflowRegistry::with_builtins();
        let result = registry.validate("does_not_exist", &json!({}));
        assert_matches!(result, Err(CoreError::NotFound { .. }));
    }

    #[test]
    fn list_is_sorted_and_filterable() {
        let registry = WorkflowRegistry::with_builtins();
        registry.register(echo_workflow("echo"));

        let names: Vec<_> = registry.list().iter().map(|d| d.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        let test_only = registry.list_by_category("test");
        assert_eq!(test_only.len(), 1);
        assert_eq!(test_only[0].name, "echo");
    }

    #[test]
    fn register_json_loads_definitions() {
        let registry = WorkflowRegistry::new();
        let json = r#"[{
            "name": "upscale",
            "title": "Upscale",
            "category": "texture",
            "parameters": [
                {"name": "factor", "kind": "integer", "default": 2, "min": 2, "max": 4}
            ]
        }]"#;

        assert_eq!(registry.register_json(json).unwrap(), 1);
        let def = registry.get("upscale").unwrap();
        assert_eq!(def.parameters[0].kind, ParameterKind::Integer);
        assert_eq!(def.parameters[0].default, Some(json!(2)));
    }

    #[test]
    fn register_json_rejects_malformed_input() {
        let registry = WorkflowRegistry::new();
        assert_matches!(
            registry.register_json("{not json"),
            Err(CoreError::Internal(_))
        );
        assert!(registry.is_empty());
    }
}
