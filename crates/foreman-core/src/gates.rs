//! Quality gate evaluation.
//!
//! Gates run when a stage completes. Evaluation is total: every declared
//! gate is evaluated in declaration order even after a failure, so the
//! finding list is complete. Blocking failures transition the stage to
//! Blocked; non-blocking failures are warnings.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::registry::{GateKind, Stage};

/// Evaluation input for a predicate: the stage, its produced outputs and the
/// shared-context snapshot.
pub struct GateContext<'a> {
    pub stage: &'a Stage,
    pub outputs: &'a HashMap<String, Value>,
    pub shared: &'a HashMap<String, Value>,
}

/// A caller-registered predicate, addressable from gate declarations.
#[async_trait]
pub trait GatePredicate: Send + Sync {
    async fn evaluate(&self, ctx: &GateContext<'_>) -> Result<bool, String>;
}

/// The outcome of one gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateFinding {
    pub gate_id: String,
    pub blocking: bool,
    pub passed: bool,
    pub message: String,
}

/// All findings for a completing stage.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub stage_id: String,
    pub findings: Vec<GateFinding>,
}

impl GateReport {
    /// True when every blocking gate passed.
    pub fn passed(&self) -> bool {
        self.findings.iter().all(|f| f.passed || !f.blocking)
    }

    /// Human-readable messages for blocking failures.
    pub fn blocking_failures(&self) -> Vec<String> {
        self.findings
            .iter()
            .filter(|f| !f.passed && f.blocking)
            .map(|f| format!("{}: {}", f.gate_id, f.message))
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.findings
            .iter()
            .filter(|f| !f.passed && !f.blocking)
            .map(|f| format!("{}: {}", f.gate_id, f.message))
            .collect()
    }
}

/// Evaluates a stage's declared gates against produced artifacts.
#[derive(Default)]
pub struct GateEvaluator {
    predicates: HashMap<String, Arc<dyn GatePredicate>>,
}

impl GateEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom predicate under an id gates can reference.
    pub fn register_predicate(
        &mut self,
        id: impl Into<String>,
        predicate: Arc<dyn GatePredicate>,
    ) {
        self.predicates.insert(id.into(), predicate);
    }

    /// Ids of all registered predicates; the registry validates gate
    /// references against this set at load time.
    pub fn predicate_ids(&self) -> BTreeSet<String> {
        self.predicates.keys().cloned().collect()
    }

    /// Evaluate all of a stage's gates plus its required-output contract.
    pub async fn evaluate(
        &self,
        stage: &Stage,
        outputs: &HashMap<String, Value>,
        shared: &HashMap<String, Value>,
    ) -> GateReport {
        let ctx = GateContext {
            stage,
            outputs,
            shared,
        };
        let mut findings = Vec::new();

        for gate in &stage.quality_gates {
            let (passed, message) = self.evaluate_gate(&gate.kind, &ctx).await;
            findings.push(GateFinding {
                gate_id: gate.id.clone(),
                blocking: gate.blocking,
                passed,
                message,
            });
        }

        // Required outputs always block when missing, independent of any
        // declared gate.
        for artifact in stage.outputs.iter().filter(|a| a.required) {
            let present = outputs.get(&artifact.name).map(is_non_empty).unwrap_or(false);
            if !present {
                findings.push(GateFinding {
                    gate_id: format!("required_output:{}", artifact.name),
                    blocking: true,
                    passed: false,
                    message: format!("required output '{}' was not produced", artifact.name),
                });
            }
        }

        let report = GateReport {
            stage_id: stage.id.clone(),
            findings,
        };
        debug!(stage = %stage.id, passed = report.passed(), findings = report.findings.len(), "gates evaluated");
        report
    }

    async fn evaluate_gate(&self, kind: &GateKind, ctx: &GateContext<'_>) -> (bool, String) {
        match kind {
            GateKind::ArtifactExists { artifact } => {
                match ctx.outputs.get(artifact) {
                    Some(value) if is_non_empty(value) => {
                        (true, format!("artifact '{artifact}' present"))
                    }
                    Some(_) => (false, format!("artifact '{artifact}' is empty")),
                    None => (false, format!("artifact '{artifact}' missing")),
                }
            }
            GateKind::RegexMatch { artifact, pattern } => {
                let text = match ctx.outputs.get(artifact) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return (false, format!("artifact '{artifact}' missing")),
                };
                match regex::Regex::new(pattern) {
                    Ok(re) if re.is_match(&text) => {
                        (true, format!("artifact '{artifact}' matches /{pattern}/"))
                    }
                    Ok(_) => (
                        false,
                        format!("artifact '{artifact}' does not match /{pattern}/"),
                    ),
                    Err(e) => (false, format!("invalid pattern /{pattern}/: {e}")),
                }
            }
            GateKind::CountThreshold {
                artifact,
                threshold,
            } => {
                let count = match ctx.outputs.get(artifact) {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::Array(items)) => Some(items.len() as f64),
                    _ => None,
                };
                match count {
                    Some(count) if count >= *threshold => {
                        (true, format!("count {count} >= {threshold}"))
                    }
                    Some(count) => (false, format!("count {count} < {threshold}")),
                    None => (false, format!("artifact '{artifact}' is not countable")),
                }
            }
            GateKind::CustomPredicate { predicate } => match self.predicates.get(predicate) {
                Some(p) => match p.evaluate(ctx).await {
                    Ok(true) => (true, format!("predicate '{predicate}' passed")),
                    Ok(false) => (false, format!("predicate '{predicate}' failed")),
                    // A predicate exception is a failing finding; evaluation
                    // of the remaining gates continues.
                    Err(e) => (false, format!("predicate '{predicate}' errored: {e}")),
                },
                // Unreachable after registry validation, kept total anyway.
                None => (false, format!("predicate '{predicate}' not registered")),
            },
        }
    }
}

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ArtifactSpec, QualityGate};
    use serde_json::json;

    fn outputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn stage_with_gates(gates: Vec<QualityGate>) -> Stage {
        let mut stage = Stage::new("stg", "Stage");
        stage.quality_gates = gates;
        stage
    }

    #[tokio::test]
    async fn test_artifact_exists() {
        let stage = stage_with_gates(vec![QualityGate::new(
            "g1",
            GateKind::ArtifactExists {
                artifact: "result".into(),
            },
        )]);
        let evaluator = GateEvaluator::new();
        let shared = HashMap::new();

        let report = evaluator
            .evaluate(&stage, &outputs(&[("result", json!("ok"))]), &shared)
            .await;
        assert!(report.passed());

        let report = evaluator
            .evaluate(&stage, &outputs(&[("result", json!(""))]), &shared)
            .await;
        assert!(!report.passed());
        assert_eq!(report.blocking_failures().len(), 1);
    }

    #[tokio::test]
    async fn test_all_gates_evaluated_after_failure() {
        let stage = stage_with_gates(vec![
            QualityGate::new(
                "g1",
                GateKind::ArtifactExists {
                    artifact: "missing".into(),
                },
            ),
            QualityGate::new(
                "g2",
                GateKind::RegexMatch {
                    artifact: "log".into(),
                    pattern: "ok".into(),
                },
            ),
        ]);
        let report = GateEvaluator::new()
            .evaluate(
                &stage,
                &outputs(&[("log", json!("all ok"))]),
                &HashMap::new(),
            )
            .await;
        // Both gates appear, in declaration order.
        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.findings[0].gate_id, "g1");
        assert!(!report.findings[0].passed);
        assert!(report.findings[1].passed);
    }

    #[tokio::test]
    async fn test_count_threshold() {
        let stage = stage_with_gates(vec![QualityGate::new(
            "g1",
            GateKind::CountThreshold {
                artifact: "issues".into(),
                threshold: 2.0,
            },
        )]);
        let evaluator = GateEvaluator::new();
        let shared = HashMap::new();

        let report = evaluator
            .evaluate(&stage, &outputs(&[("issues", json!([1, 2, 3]))]), &shared)
            .await;
        assert!(report.passed());

        let report = evaluator
            .evaluate(&stage, &outputs(&[("issues", json!(1))]), &shared)
            .await;
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_non_blocking_gate_only_warns() {
        let stage = stage_with_gates(vec![QualityGate::new(
            "g1",
            GateKind::ArtifactExists {
                artifact: "nice_to_have".into(),
            },
        )
        .warning_only()]);
        let report = GateEvaluator::new()
            .evaluate(&stage, &HashMap::new(), &HashMap::new())
            .await;
        assert!(report.passed());
        assert_eq!(report.warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        struct SharedHasKey;

        #[async_trait]
        impl GatePredicate for SharedHasKey {
            async fn evaluate(&self, ctx: &GateContext<'_>) -> Result<bool, String> {
                Ok(ctx.shared.contains_key("design"))
            }
        }

        let mut evaluator = GateEvaluator::new();
        evaluator.register_predicate("has_design", Arc::new(SharedHasKey));
        assert!(evaluator.predicate_ids().contains("has_design"));

        let stage = stage_with_gates(vec![QualityGate::new(
            "g1",
            GateKind::CustomPredicate {
                predicate: "has_design".into(),
            },
        )]);
        let mut shared = HashMap::new();
        shared.insert("design".to_string(), json!("v1"));
        let report = evaluator.evaluate(&stage, &HashMap::new(), &shared).await;
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_required_outputs_always_block() {
        let mut stage = stage_with_gates(vec![]);
        stage.outputs = vec![
            ArtifactSpec::required("report"),
            ArtifactSpec::optional("notes"),
        ];
        let report = GateEvaluator::new()
            .evaluate(&stage, &HashMap::new(), &HashMap::new())
            .await;
        assert!(!report.passed());
        assert_eq!(report.blocking_failures().len(), 1);
    }
}
