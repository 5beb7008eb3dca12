use crate::{
    error::{OrchestratorError, Result},
    models::WorkflowSpec,
};
use std::collections::{HashMap, HashSet};

/// Validation utilities for workflow definitions.
///
/// Invalid definitions fail synchronously and are never stored or enqueued.
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Validate the shape of a workflow definition.
    ///
    /// Checks that the name is non-empty, step ids are unique within the
    /// workflow, every step names an agent and an action, every `depends_on`
    /// entry resolves to a step id in the same workflow, and the dependency
    /// graph is acyclic. A workflow with zero steps is valid (it completes
    /// immediately when executed).
    ///
    /// # Returns
    /// * `Ok(())` - If the definition is valid
    /// * `Err(OrchestratorError::Validation)` - Describing the first problem found
    pub fn validate(spec: &WorkflowSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(OrchestratorError::empty_field("name"));
        }

        let mut seen = HashSet::new();
        for step in &spec.steps {
            if step.id.trim().is_empty() {
                return Err(OrchestratorError::empty_field("step.id"));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(OrchestratorError::Validation(format!(
                    "Duplicate step id '{}'",
                    step.id
                )));
            }
            if step.agent.trim().is_empty() {
                return Err(OrchestratorError::Validation(format!(
                    "Step '{}' has no agent",
                    step.id
                )));
            }
            if step.action.trim().is_empty() {
                return Err(OrchestratorError::Validation(format!(
                    "Step '{}' has no action",
                    step.id
                )));
            }
        }

        for step in &spec.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(OrchestratorError::Validation(format!(
                        "Step '{}' depends on unknown step '{dep}'",
                        step.id
                    )));
                }
                if dep == &step.id {
                    return Err(OrchestratorError::Validation(format!(
                        "Step '{}' depends on itself",
                        step.id
                    )));
                }
            }
        }

        Self::check_acyclic(spec)
    }

    /// Detect cycles with an iterative three-color depth-first search.
    fn check_acyclic(spec: &WorkflowSpec) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let edges: HashMap<&str, &[String]> = spec
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
            .collect();
        let mut colors: HashMap<&str, Color> =
            spec.steps.iter().map(|s| (s.id.as_str(), Color::White)).collect();

        let nodes: Vec<&str> = edges.keys().copied().collect();
        for start in nodes {
            if colors[start] != Color::White {
                continue;
            }
            // stack of (node, next-dependency index)
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            colors.insert(start, Color::Gray);

            while let Some((node, idx)) = stack.pop() {
                let deps = edges[node];
                if idx < deps.len() {
                    stack.push((node, idx + 1));
                    let dep = deps[idx].as_str();
                    match colors[dep] {
                        Color::Gray => {
                            return Err(OrchestratorError::Validation(format!(
                                "Dependency cycle involving step '{dep}'"
                            )));
                        }
                        Color::White => {
                            colors.insert(dep, Color::Gray);
                            stack.push((dep, 0));
                        }
                        Color::Black => {}
                    }
                } else {
                    colors.insert(node, Color::Black);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepSpec;
    use std::collections::HashMap;

    fn step(id: &str, deps: &[&str]) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            name: id.to_string(),
            agent: "supervisor".to_string(),
            action: format!("echo {id}"),
            params: HashMap::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            timeout_secs: None,
            max_retries: None,
        }
    }

    fn spec(steps: Vec<StepSpec>) -> WorkflowSpec {
        WorkflowSpec {
            name: "test".to_string(),
            description: String::new(),
            steps,
        }
    }

    #[test]
    fn test_valid_dag_passes() {
        let spec = spec(vec![
            step("init", &[]),
            step("p1", &["init"]),
            step("p2", &["init"]),
            step("join", &["p1", "p2"]),
        ]);
        assert!(WorkflowValidator::validate(&spec).is_ok());
    }

    #[test]
    fn test_empty_workflow_is_valid() {
        assert!(WorkflowValidator::validate(&spec(vec![])).is_ok());
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let result = WorkflowValidator::validate(&spec(vec![step("a", &[]), step("a", &[])]));
        match result {
            Err(OrchestratorError::Validation(msg)) => assert!(msg.contains("Duplicate")),
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = WorkflowValidator::validate(&spec(vec![step("a", &["ghost"])]));
        match result {
            Err(OrchestratorError::Validation(msg)) => assert!(msg.contains("unknown step")),
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_rejected() {
        let result = WorkflowValidator::validate(&spec(vec![step("a", &["a"])]));
        assert!(result.is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let result = WorkflowValidator::validate(&spec(vec![
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
        ]));
        match result {
            Err(OrchestratorError::Validation(msg)) => assert!(msg.contains("cycle")),
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_agent_rejected() {
        let mut bad = step("a", &[]);
        bad.agent = String::new();
        assert!(WorkflowValidator::validate(&spec(vec![bad])).is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut s = spec(vec![step("a", &[])]);
        s.name = "  ".to_string();
        assert!(WorkflowValidator::validate(&s).is_err());
    }
}
