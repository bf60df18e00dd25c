//! Workflow stage state machine.
//!
//! Each stage moves Pending → InProgress → {Completed, Blocked}; Completed
//! is terminal and Blocked returns to InProgress only through an explicit
//! retry. The executor is the single writer of stage state: it delegates
//! stage bodies to the orchestrator and gate evaluation to the gate
//! evaluator, and never mutates anything else.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::AgentContext;
use crate::error::{ConfigError, EngineError, Result};
use crate::events::{EngineEvent, EventEmitter};
use crate::gates::{GateEvaluator, GateReport};
use crate::orchestrator::Orchestrator;
use crate::registry::{Registry, Role, Stage};
use crate::state::{ExecutionState, StageState};

pub struct WorkflowExecutor {
    registry: Arc<Registry>,
    orchestrator: Orchestrator,
    evaluator: Arc<GateEvaluator>,
    emitter: EventEmitter,
    state: ExecutionState,
    stage_contexts: HashMap<String, AgentContext>,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<Registry>,
        orchestrator: Orchestrator,
        evaluator: Arc<GateEvaluator>,
        emitter: EventEmitter,
    ) -> Self {
        let workflow = registry.workflow();
        let state = ExecutionState::new(
            workflow.id.clone(),
            workflow.stages.iter().map(|s| s.id.clone()),
        );
        Self {
            registry,
            orchestrator,
            evaluator,
            emitter,
            state,
            stage_contexts: HashMap::new(),
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ExecutionState {
        &mut self.state
    }

    /// Replace live state (checkpoint restore). Stage contexts belong to the
    /// old run and are dropped; blocked stages re-run their body on retry.
    pub fn restore_state(&mut self, state: ExecutionState) {
        self.state = state;
        self.stage_contexts.clear();
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Accumulated context of a stage body that has run in this process.
    pub fn stage_context(&self, stage_id: &str) -> Option<&AgentContext> {
        self.stage_contexts.get(stage_id)
    }

    fn stage(&self, stage_id: &str) -> Result<Stage> {
        self.registry
            .workflow()
            .stage(stage_id)
            .cloned()
            .ok_or_else(|| {
                ConfigError::MissingRef {
                    kind: "stage",
                    id: stage_id.to_string(),
                    referenced_by: "executor".to_string(),
                }
                .into()
            })
    }

    /// Role resolution: explicit override > stage default > inference from
    /// the stage's required skills (max overlap, ties by role id).
    fn resolve_role(&self, stage: &Stage, explicit: Option<&str>) -> Result<Role> {
        if let Some(role_id) = explicit.or(stage.role_id.as_deref()) {
            return self
                .registry
                .get_role(role_id)
                .cloned()
                .ok_or_else(|| {
                    ConfigError::MissingRef {
                        kind: "role",
                        id: role_id.to_string(),
                        referenced_by: format!("stage '{}'", stage.id),
                    }
                    .into()
                });
        }

        let mut roles: Vec<&Role> = self.registry.roles().collect();
        roles.sort_by(|a, b| a.id.cmp(&b.id));

        let mut best: Option<(usize, &Role)> = None;
        for role in roles {
            let overlap = stage
                .required_skills
                .iter()
                .filter(|req| {
                    self.registry
                        .authorized_level(&role.id, &req.skill_id)
                        .is_some()
                })
                .count();
            if overlap > 0 && best.map(|(n, _)| overlap > n).unwrap_or(true) {
                best = Some((overlap, role));
            }
        }

        best.map(|(_, role)| role.clone()).ok_or_else(|| {
            EngineError::Internal(format!(
                "stage '{}' has no role and none could be inferred from its required skills",
                stage.id
            ))
        })
    }

    /// Start a stage: preconditions, role resolution, then the body via the
    /// orchestrator. A body failure blocks the stage with the error as its
    /// finding.
    pub async fn start(
        &mut self,
        stage_id: &str,
        role_id: Option<&str>,
        goal: &str,
    ) -> Result<()> {
        let stage = self.stage(stage_id)?;

        let current = self.state.stage_state(stage_id);
        if current != StageState::Pending {
            return Err(EngineError::Internal(format!(
                "stage '{stage_id}' cannot start from {current:?}"
            )));
        }
        for dep in &stage.depends_on {
            if !self.state.is_completed(dep) {
                return Err(EngineError::Internal(format!(
                    "stage '{stage_id}' cannot start: dependency '{dep}' not completed"
                )));
            }
        }

        let role = self.resolve_role(&stage, role_id)?;
        self.state.current_stage_id = Some(stage_id.to_string());
        self.state.current_role_id = Some(role.id.clone());
        self.state
            .stage_states
            .insert(stage_id.to_string(), StageState::InProgress);
        self.emitter.emit(EngineEvent::StageStarted {
            stage_id: stage_id.to_string(),
            role_id: role.id.clone(),
        });
        info!(stage = stage_id, role = %role.id, "stage started");

        match self.orchestrator.execute_stage(&stage, &role, goal).await {
            Ok(context) => {
                self.state
                    .active_agents
                    .insert(context.agent_id.clone(), context.role_id.clone());
                self.stage_contexts.insert(stage_id.to_string(), context);
                Ok(())
            }
            Err(e) => {
                let finding = e.to_string();
                warn!(stage = stage_id, error = %finding, "stage body failed");
                self.block(stage_id, vec![finding]);
                Err(e)
            }
        }
    }

    /// Complete a stage: run its quality gates over the produced artifacts.
    /// All blocking gates passing makes the stage terminal; otherwise it
    /// blocks with the full finding list.
    pub async fn complete(&mut self, stage_id: &str) -> Result<GateReport> {
        let stage = self.stage(stage_id)?;
        if self.state.stage_state(stage_id) != StageState::InProgress {
            return Err(EngineError::Internal(format!(
                "stage '{stage_id}' is not in progress"
            )));
        }

        let empty = HashMap::new();
        let outputs = self
            .stage_contexts
            .get(stage_id)
            .map(|ctx| &ctx.outputs)
            .unwrap_or(&empty);
        let shared = self.orchestrator.bus().context_snapshot();
        let report = self.evaluator.evaluate(&stage, outputs, &shared).await;

        for finding in report.findings.iter().filter(|f| !f.passed) {
            self.emitter.emit(EngineEvent::GateFailed {
                stage_id: stage_id.to_string(),
                gate_id: finding.gate_id.clone(),
                message: finding.message.clone(),
                blocking: finding.blocking,
            });
        }

        if report.passed() {
            self.state
                .stage_states
                .insert(stage_id.to_string(), StageState::Completed);
            self.state.completed_stages.push(stage_id.to_string());
            if self.state.current_stage_id.as_deref() == Some(stage_id) {
                self.state.current_stage_id = None;
                self.state.current_role_id = None;
            }
            if let Some(ctx) = self.stage_contexts.get(stage_id) {
                self.state.active_agents.remove(&ctx.agent_id);
            }
            self.emitter.emit(EngineEvent::StageCompleted {
                stage_id: stage_id.to_string(),
            });
            info!(stage = stage_id, "stage completed");
        } else {
            self.block(stage_id, report.blocking_failures());
        }

        Ok(report)
    }

    fn block(&mut self, stage_id: &str, findings: Vec<String>) {
        self.state
            .stage_states
            .insert(stage_id.to_string(), StageState::Blocked);
        self.state
            .findings
            .insert(stage_id.to_string(), findings.clone());
        self.emitter.emit(EngineEvent::StageBlocked {
            stage_id: stage_id.to_string(),
            findings,
        });
    }

    /// Retry a blocked stage: clear findings, return it to the pipeline and
    /// re-run body plus gates.
    pub async fn retry(&mut self, stage_id: &str, goal: &str) -> Result<GateReport> {
        if self.state.stage_state(stage_id) != StageState::Blocked {
            return Err(EngineError::Internal(format!(
                "stage '{stage_id}' is not blocked"
            )));
        }
        self.state.findings.remove(stage_id);
        self.state
            .stage_states
            .insert(stage_id.to_string(), StageState::Pending);
        self.run_stage(stage_id, None, goal).await
    }

    /// Start + complete in one step.
    pub async fn run_stage(
        &mut self,
        stage_id: &str,
        role_id: Option<&str>,
        goal: &str,
    ) -> Result<GateReport> {
        self.start(stage_id, role_id, goal).await?;
        self.complete(stage_id).await
    }

    /// Pending stages whose dependencies are all completed, in workflow
    /// declaration order.
    pub fn startable_stages(&self) -> Vec<String> {
        self.registry
            .workflow()
            .stages
            .iter()
            .filter(|stage| {
                self.state.stage_state(&stage.id) == StageState::Pending
                    && stage.depends_on.iter().all(|dep| self.state.is_completed(dep))
            })
            .map(|stage| stage.id.clone())
            .collect()
    }

    /// One `wfauto` scheduling round: run the next startable stage, or the
    /// whole ready partition concurrently when every member is marked
    /// parallelizable. Returns `false` when nothing is left to do.
    pub async fn wfauto_step(&mut self, goal: &str) -> Result<bool> {
        if self.orchestrator.cancel_token().is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.state.stage_states.is_empty() || self.state.all_completed() {
            return Ok(false);
        }

        let startable = self.startable_stages();
        if startable.is_empty() {
            let blocked = self.state.blocked_stages();
            if let Some(stage_id) = blocked.first() {
                return Err(EngineError::GateFailure {
                    stage_id: stage_id.clone(),
                    findings: self
                        .state
                        .findings
                        .get(stage_id)
                        .cloned()
                        .unwrap_or_default(),
                });
            }
            return Err(EngineError::Internal(
                "workflow stuck: stages remain but none are startable".to_string(),
            ));
        }

        let run_parallel = startable.len() > 1
            && startable.iter().all(|id| {
                self.registry
                    .workflow()
                    .stage(id)
                    .map(|s| s.parallelizable)
                    .unwrap_or(false)
            });

        if run_parallel {
            self.run_partition(&startable, goal).await?;
        } else {
            let stage_id = &startable[0];
            let report = self.run_stage(stage_id, None, goal).await?;
            if !report.passed() {
                return Err(EngineError::GateFailure {
                    stage_id: stage_id.clone(),
                    findings: report.blocking_failures(),
                });
            }
        }
        Ok(true)
    }

    async fn run_partition(&mut self, stage_ids: &[String], goal: &str) -> Result<()> {
        let mut pairs = Vec::new();
        for stage_id in stage_ids {
            let stage = self.stage(stage_id)?;
            let role = self.resolve_role(&stage, None)?;
            self.state
                .stage_states
                .insert(stage_id.clone(), StageState::InProgress);
            self.emitter.emit(EngineEvent::StageStarted {
                stage_id: stage_id.clone(),
                role_id: role.id.clone(),
            });
            pairs.push((stage, role));
        }

        let outcomes = self.orchestrator.execute_parallel_stages(pairs, goal).await;

        let mut cancelled = false;
        let mut first_blocked: Option<String> = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(context) => {
                    self.stage_contexts.insert(outcome.stage_id.clone(), context);
                    let report = self.complete(&outcome.stage_id).await?;
                    if !report.passed() && first_blocked.is_none() {
                        first_blocked = Some(outcome.stage_id.clone());
                    }
                }
                Err(EngineError::Cancelled) => {
                    self.block(&outcome.stage_id, vec!["workflow cancelled".to_string()]);
                    cancelled = true;
                }
                Err(e) => {
                    self.block(&outcome.stage_id, vec![e.to_string()]);
                    if first_blocked.is_none() {
                        first_blocked = Some(outcome.stage_id.clone());
                    }
                }
            }
        }

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        if let Some(stage_id) = first_blocked {
            return Err(EngineError::GateFailure {
                findings: self
                    .state
                    .findings
                    .get(&stage_id)
                    .cloned()
                    .unwrap_or_default(),
                stage_id,
            });
        }
        Ok(())
    }

    /// Repeatedly run startable stages until the workflow completes or a
    /// non-recoverable failure occurs.
    pub async fn wfauto(&mut self, goal: &str) -> Result<()> {
        while self.wfauto_step(goal).await? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::cancel::CancelToken;
    use crate::decomposer::TaskDecomposer;
    use crate::events::NullSink;
    use crate::invoker::PlaceholderInvoker;
    use crate::registry::{
        ArtifactSpec, GateKind, QualityGate, RegistryConfig, Skill, SkillRequirement, Workflow,
    };
    use crate::tracker::ExecutionTracker;
    use parking_lot::RwLock;
    use serde_json::json;

    fn executor_for(workflow: Workflow) -> WorkflowExecutor {
        let mut skill = Skill::new("coding", "Coding");
        skill.description = "write code".into();
        skill.output_schema = Some(json!({
            "type": "object",
            "required": ["result"],
            "properties": {"result": {"type": "string"}}
        }));
        let mut role = crate::registry::Role::new("dev", "Developer");
        role.required_skills = vec![SkillRequirement::new("coding", 1)];

        let registry = Arc::new(
            Registry::load(RegistryConfig {
                skills: vec![skill],
                roles: vec![role],
                workflow: Some(workflow),
                ..Default::default()
            })
            .unwrap(),
        );

        let emitter = EventEmitter::new(Arc::new(NullSink), "wf");
        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Arc::new(PlaceholderInvoker::new()),
            Arc::new(RwLock::new(ExecutionTracker::new())),
            MessageBus::new(),
            emitter.clone(),
            TaskDecomposer::new(Arc::clone(&registry), None, "dev"),
            CancelToken::new(),
        );
        let evaluator = Arc::new(GateEvaluator::new());
        WorkflowExecutor::new(registry, orchestrator, evaluator, emitter)
    }

    fn single_stage_workflow() -> Workflow {
        let mut stage = Stage::new("stg", "Build");
        stage.role_id = Some("dev".into());
        stage.outputs = vec![ArtifactSpec::optional("result")];
        stage.quality_gates = vec![QualityGate::new(
            "g1",
            GateKind::ArtifactExists {
                artifact: "result".into(),
            },
        )];
        Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![stage],
        }
    }

    #[tokio::test]
    async fn test_single_stage_happy_path() {
        let mut executor = executor_for(single_stage_workflow());
        let report = executor.run_stage("stg", None, "demo").await.unwrap();

        assert!(report.passed());
        assert_eq!(executor.state().completed_stages, vec!["stg".to_string()]);
        assert_eq!(executor.state().stage_state("stg"), StageState::Completed);
        assert!(executor.state().current_stage_id.is_none());
    }

    #[tokio::test]
    async fn test_start_requires_dependencies_completed() {
        let mut first = Stage::new("first", "First");
        first.role_id = Some("dev".into());
        let mut second = Stage::new("second", "Second");
        second.role_id = Some("dev".into());
        second.depends_on = vec!["first".into()];

        let mut executor = executor_for(Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![first, second],
        });

        assert!(executor.start("second", None, "demo").await.is_err());
        assert_eq!(executor.state().stage_state("second"), StageState::Pending);
    }

    #[tokio::test]
    async fn test_completed_is_terminal() {
        let mut executor = executor_for(single_stage_workflow());
        executor.run_stage("stg", None, "demo").await.unwrap();
        assert!(executor.start("stg", None, "demo").await.is_err());
    }

    #[tokio::test]
    async fn test_role_inference_from_required_skills() {
        let mut stage = Stage::new("stg", "Build");
        stage.required_skills = vec![SkillRequirement::new("coding", 1)];
        // No role assigned on the stage.
        let mut executor = executor_for(Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![stage],
        });

        executor.run_stage("stg", None, "demo").await.unwrap();
        assert_eq!(executor.state().completed_stages, vec!["stg".to_string()]);
    }

    #[tokio::test]
    async fn test_wfauto_runs_whole_workflow() {
        let mut a = Stage::new("a", "A");
        a.role_id = Some("dev".into());
        let mut b = Stage::new("b", "B");
        b.role_id = Some("dev".into());
        b.depends_on = vec!["a".into()];

        let mut executor = executor_for(Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![a, b],
        });
        executor.wfauto("demo").await.unwrap();

        assert!(executor.state().all_completed());
        assert_eq!(
            executor.state().completed_stages,
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_workflow_completes_immediately() {
        let mut executor = executor_for(Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![],
        });
        executor.wfauto("anything").await.unwrap();
        assert!(executor.state().completed_stages.is_empty());
    }
}
