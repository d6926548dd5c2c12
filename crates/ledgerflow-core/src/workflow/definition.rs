//! Workflow spec parsing, validation, and schema export.
//!
//! Converts between YAML/JSON documents and `WorkflowSpec`, and validates
//! the structural constraints the engine relies on (unique ids, resolvable
//! acyclic dependencies, error policies that carry what they need).

use std::collections::HashSet;
use std::path::Path;

use ledgerflow_types::workflow::{OnError, WorkflowSpec};
use thiserror::Error;

use super::dag::validate_dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a workflow spec.
#[derive(Debug, Error)]
pub enum SpecError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate step ID: '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML workflow spec.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowSpec, SpecError> {
    let spec: WorkflowSpec =
        serde_yaml_ng::from_str(yaml).map_err(|e| SpecError::Parse(e.to_string()))?;
    validate_spec(&spec)?;
    Ok(spec)
}

/// Parse and validate a JSON workflow spec.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowSpec, SpecError> {
    let spec: WorkflowSpec =
        serde_json::from_str(json).map_err(|e| SpecError::Parse(e.to_string()))?;
    validate_spec(&spec)?;
    Ok(spec)
}

pub fn serialize_workflow_yaml(spec: &WorkflowSpec) -> Result<String, SpecError> {
    serde_yaml_ng::to_string(spec).map_err(|e| SpecError::Parse(e.to_string()))
}

/// Load a spec file; `.json` is parsed as JSON, anything else as YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowSpec, SpecError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// JSON Schema describing the `WorkflowSpec` document format.
pub fn workflow_spec_schema() -> schemars::Schema {
    schemars::schema_for!(WorkflowSpec)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowSpec`.
///
/// Checks:
/// - Workflow id is non-empty and at least one step exists
/// - Step ids and skill ids are non-empty, step ids are unique
/// - `depends_on` references existing, non-self steps with no cycles
/// - `fallback_skill` is set iff `on_error` is FALLBACK
/// - `fallback_params` only appears alongside FALLBACK
/// - `retry_policy.max_attempts` >= 1
pub fn validate_spec(spec: &WorkflowSpec) -> Result<(), SpecError> {
    if spec.id.trim().is_empty() {
        return Err(SpecError::Validation(
            "workflow id must not be empty".to_string(),
        ));
    }
    if spec.steps.is_empty() {
        return Err(SpecError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &spec.steps {
        if step.id.trim().is_empty() {
            return Err(SpecError::Validation("step id must not be empty".to_string()));
        }
        if step.skill_id.trim().is_empty() {
            return Err(SpecError::Validation(format!(
                "step '{}' has an empty skill_id",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(SpecError::DuplicateStep(step.id.clone()));
        }
    }

    for step in &spec.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(SpecError::Validation(format!(
                    "step '{}' cannot depend on itself",
                    step.id
                )));
            }
        }

        let is_fallback = step.on_error == OnError::Fallback;
        match (&step.fallback_skill, is_fallback) {
            (None, true) => {
                return Err(SpecError::Validation(format!(
                    "step '{}' uses on_error FALLBACK but has no fallback_skill",
                    step.id
                )));
            }
            (Some(_), false) => {
                return Err(SpecError::Validation(format!(
                    "step '{}' sets fallback_skill without on_error FALLBACK",
                    step.id
                )));
            }
            _ => {}
        }
        if step.fallback_params.is_some() && !is_fallback {
            return Err(SpecError::Validation(format!(
                "step '{}' sets fallback_params without on_error FALLBACK",
                step.id
            )));
        }

        if let Some(policy) = &step.retry_policy {
            if policy.max_attempts == 0 {
                return Err(SpecError::Validation(format!(
                    "step '{}' retry_policy.max_attempts must be >= 1",
                    step.id
                )));
            }
        }
    }

    validate_dag(&spec.steps)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use ledgerflow_types::workflow::{RetryPolicy, StepDescriptor};

    const SAMPLE_YAML: &str = r#"
id: wf-digest
name: daily-digest
steps:
  - id: fetch
    skill_id: http.get
    inputs:
      url: "http://localhost:8080/report"
    on_error: RETRY
    retry_policy:
      max_attempts: 4
      backoff_ms: 5
      on_exhausted: CONTINUE
    timeout_ms: 2000
  - id: summarize
    skill_id: text.summarize
    depends_on: [fetch]
    on_error: FALLBACK
    fallback_skill: text.truncate
    fallback_params:
      max_chars: 200
    estimated_cost_cents: 3
  - id: notify
    skill_id: notify.log
    depends_on: [summarize]
    on_error: continue
    transient: true
"#;

    fn spec_with(steps: Vec<StepDescriptor>) -> WorkflowSpec {
        WorkflowSpec {
            id: "wf".to_string(),
            name: "wf".to_string(),
            steps,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_parse_sample_yaml() {
        let spec = parse_workflow_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(spec.steps.len(), 3);
        assert_eq!(spec.steps[0].on_error, OnError::Retry);
        assert_eq!(spec.steps[0].effective_retry_policy().max_attempts, 4);
        assert_eq!(spec.steps[0].timeout_ms, Some(2000));
        assert_eq!(spec.steps[1].fallback_skill.as_deref(), Some("text.truncate"));
        assert_eq!(spec.steps[1].estimated_cost_cents, 3);
        assert_eq!(spec.steps[2].on_error, OnError::Continue);
        assert!(spec.steps[2].transient);
    }

    #[test]
    fn test_yaml_and_json_agree() {
        let from_yaml = parse_workflow_yaml(SAMPLE_YAML).unwrap();
        let json = serde_json::to_string(&from_yaml).unwrap();
        let from_json = parse_workflow_json(&json).unwrap();
        assert_eq!(from_yaml, from_json);

        let yaml = serialize_workflow_yaml(&from_yaml).unwrap();
        assert_eq!(parse_workflow_yaml(&yaml).unwrap(), from_yaml);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            parse_workflow_yaml("id: [unclosed"),
            Err(SpecError::Parse(_))
        ));
        assert!(matches!(
            parse_workflow_json("{\"id\": 1"),
            Err(SpecError::Parse(_))
        ));
    }

    #[test]
    fn test_load_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("wf.yaml");
        std::fs::write(&yaml_path, SAMPLE_YAML).unwrap();
        let spec = load_workflow_file(&yaml_path).unwrap();

        let json_path = dir.path().join("wf.json");
        std::fs::write(&json_path, serde_json::to_string(&spec).unwrap()).unwrap();
        assert_eq!(load_workflow_file(&json_path).unwrap(), spec);

        assert!(matches!(
            load_workflow_file(&dir.path().join("missing.yaml")),
            Err(SpecError::Io(_))
        ));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(matches!(
            validate_spec(&spec_with(vec![])),
            Err(SpecError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_step_ids() {
        let spec = spec_with(vec![StepDescriptor::new("a", "x"), StepDescriptor::new("a", "y")]);
        assert!(matches!(validate_spec(&spec), Err(SpecError::DuplicateStep(id)) if id == "a"));
    }

    #[test]
    fn test_unknown_and_self_dependency() {
        let mut b = StepDescriptor::new("b", "x");
        b.depends_on = vec!["ghost".to_string()];
        assert!(matches!(
            validate_spec(&spec_with(vec![StepDescriptor::new("a", "x"), b])),
            Err(SpecError::UnknownDependency { .. })
        ));

        let mut c = StepDescriptor::new("c", "x");
        c.depends_on = vec!["c".to_string()];
        assert!(matches!(
            validate_spec(&spec_with(vec![c])),
            Err(SpecError::Validation(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut a = StepDescriptor::new("a", "x");
        a.depends_on = vec!["b".to_string()];
        let mut b = StepDescriptor::new("b", "x");
        b.depends_on = vec!["a".to_string()];
        assert!(matches!(
            validate_spec(&spec_with(vec![a, b])),
            Err(SpecError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_fallback_fields_require_fallback_policy() {
        let mut missing = StepDescriptor::new("a", "x");
        missing.on_error = OnError::Fallback;
        assert!(validate_spec(&spec_with(vec![missing])).is_err());

        let mut stray_skill = StepDescriptor::new("a", "x");
        stray_skill.fallback_skill = Some("y".to_string());
        assert!(validate_spec(&spec_with(vec![stray_skill])).is_err());

        let mut stray_params = StepDescriptor::new("a", "x");
        stray_params.fallback_params = Some(BTreeMap::new());
        assert!(validate_spec(&spec_with(vec![stray_params])).is_err());

        let mut ok = StepDescriptor::new("a", "x");
        ok.on_error = OnError::Fallback;
        ok.fallback_skill = Some("y".to_string());
        ok.fallback_params = Some(BTreeMap::new());
        assert!(validate_spec(&spec_with(vec![ok])).is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut step = StepDescriptor::new("a", "x");
        step.on_error = OnError::Retry;
        step.retry_policy = Some(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        });
        assert!(validate_spec(&spec_with(vec![step])).is_err());
    }

    #[test]
    fn test_schema_describes_steps() {
        let schema = serde_json::to_value(workflow_spec_schema()).unwrap();
        let text = schema.to_string();
        assert!(text.contains("steps"));
        assert!(text.contains("skill_id"));
        assert!(text.contains("FALLBACK"));
    }
}
