//! Central scheduler.
//!
//! The orchestrator owns the skill-invocation layer: agents reason and emit
//! intents, the selector picks a skill per intent, the invoker runs it, and
//! the tracker records the outcome. Mutually independent stages and tasks
//! run as concurrent cooperating units; the bus is their only coordination
//! surface.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentContext, Intent};
use crate::bus::MessageBus;
use crate::cancel::CancelToken;
use crate::decomposer::{TaskDecomposer, TaskDecomposition, TaskStatus};
use crate::error::{EngineError, ErrorKind, Result};
use crate::events::{EngineEvent, EventEmitter};
use crate::invoker::{invoke_checked, SkillInvoker};
use crate::registry::{Registry, Role, Skill, Stage};
use crate::selector::{SelectionContext, SkillSelector};
use crate::tracker::{digest, ExecutionStatus, ExecutionTracker, SkillExecution};

/// Result of one stage body in a parallel partition.
pub struct StageOutcome {
    pub stage_id: String,
    pub result: Result<AgentContext>,
}

/// Result of goal-level collaboration.
pub struct CollaborationResult {
    pub decomposition: TaskDecomposition,
    /// Agent context per completed or failed task.
    pub contexts: HashMap<String, AgentContext>,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    selector: SkillSelector,
    invoker: Arc<dyn SkillInvoker>,
    tracker: Arc<RwLock<ExecutionTracker>>,
    bus: MessageBus,
    emitter: EventEmitter,
    decomposer: TaskDecomposer,
    cancel: CancelToken,
    project_context: Value,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        invoker: Arc<dyn SkillInvoker>,
        tracker: Arc<RwLock<ExecutionTracker>>,
        bus: MessageBus,
        emitter: EventEmitter,
        decomposer: TaskDecomposer,
        cancel: CancelToken,
    ) -> Self {
        let selector = SkillSelector::new(Arc::clone(&registry), Arc::clone(&tracker));
        Self {
            registry,
            selector,
            invoker,
            tracker,
            bus,
            emitter,
            decomposer,
            cancel,
            project_context: Value::Null,
        }
    }

    pub fn with_project_context(mut self, project_context: Value) -> Self {
        self.project_context = project_context;
        self
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Execute one stage with a single agent bound to `role`. The agent's
    /// intents run strictly in emission order; outputs accumulate in the
    /// returned context.
    pub async fn execute_stage(
        &self,
        stage: &Stage,
        role: &Role,
        goal: &str,
    ) -> Result<AgentContext> {
        let mut agent = Agent::new(role.clone(), self.bus.clone());
        let intents = agent.prepare(goal, Some(stage), self.project_context.clone())?;
        self.run_intents(&mut agent, intents, Some(stage), None)
            .await?;
        self.bus.remove_agent(&agent.id);
        Ok(agent.context)
    }

    /// Execute several stages, partitioned by dependency-readiness within
    /// the given set. Stages in a ready partition run concurrently; a
    /// failure does not cancel its partition siblings, and the caller
    /// receives every outcome for partial-success handling.
    pub async fn execute_parallel_stages(
        &self,
        stages: Vec<(Stage, Role)>,
        goal: &str,
    ) -> Vec<StageOutcome> {
        let in_set: HashSet<String> = stages.iter().map(|(s, _)| s.id.clone()).collect();
        let mut pending: Vec<(Stage, Role)> = stages;
        let mut satisfied: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut outcomes = Vec::new();

        while !pending.is_empty() {
            let (ready, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(stage, _)| {
                stage
                    .depends_on
                    .iter()
                    .filter(|dep| in_set.contains(*dep))
                    .all(|dep| satisfied.contains(dep))
            });
            pending = rest;

            if ready.is_empty() {
                // Whatever is left depends on a stage that failed (or on a
                // cycle the registry would have rejected).
                for (stage, _) in pending.drain(..) {
                    let blocked_on: Vec<&String> = stage
                        .depends_on
                        .iter()
                        .filter(|dep| failed.contains(*dep))
                        .collect();
                    outcomes.push(StageOutcome {
                        stage_id: stage.id.clone(),
                        result: Err(EngineError::Execution {
                            skill_id: stage.id.clone(),
                            detail: format!("dependency stage(s) {blocked_on:?} did not complete"),
                        }),
                    });
                }
                break;
            }

            let partition = join_all(ready.iter().map(|(stage, role)| async {
                StageOutcome {
                    stage_id: stage.id.clone(),
                    result: self.execute_stage(stage, role, goal).await,
                }
            }))
            .await;

            for outcome in partition {
                match &outcome.result {
                    Ok(_) => {
                        satisfied.insert(outcome.stage_id.clone());
                    }
                    Err(_) => {
                        failed.insert(outcome.stage_id.clone());
                    }
                }
                outcomes.push(outcome);
            }
        }

        outcomes
    }

    /// Decompose a goal into tasks and run them group by group, one agent
    /// per task, all wired into the bus. Tasks may exchange messages
    /// mid-execution; a group completes when every task reaches a terminal
    /// status.
    pub async fn execute_with_collaboration(&self, goal: &str) -> Result<CollaborationResult> {
        let mut decomposition = self.decomposer.decompose(goal).await?;
        let mut contexts: HashMap<String, AgentContext> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();

        let order = decomposition.execution_order.clone();
        for group in order {
            if self.cancel.is_cancelled() {
                for task in decomposition
                    .tasks
                    .iter_mut()
                    .filter(|t| t.status == TaskStatus::Pending)
                {
                    task.status = TaskStatus::Failed;
                    task.error = Some("workflow cancelled".to_string());
                }
                return Err(EngineError::Cancelled);
            }

            // Tasks downstream of a failure are skipped, not run.
            let (runnable, skipped): (Vec<String>, Vec<String>) =
                group.into_iter().partition(|task_id| {
                    decomposition
                        .task(task_id)
                        .map(|t| t.depends_on.iter().all(|dep| !failed.contains(dep)))
                        .unwrap_or(false)
                });
            for task_id in skipped {
                failed.insert(task_id.clone());
                if let Some(task) = decomposition.task_mut(&task_id) {
                    task.status = TaskStatus::Skipped;
                    task.error = Some("upstream task failed".to_string());
                }
                self.emitter.emit(EngineEvent::TaskCompleted {
                    task_id,
                    status: "skipped".to_string(),
                });
            }

            for task_id in &runnable {
                if let Some(task) = decomposition.task_mut(task_id) {
                    task.status = TaskStatus::Running;
                    self.emitter.emit(EngineEvent::TaskCreated {
                        task_id: task.id.clone(),
                        role_id: task.role_id.clone(),
                    });
                }
            }

            let runs = join_all(runnable.iter().map(|task_id| {
                let task = decomposition.task(task_id).cloned();
                async move {
                    let task = task.ok_or_else(|| {
                        EngineError::Internal(format!("task '{task_id}' vanished"))
                    })?;
                    self.run_task(&task.id, &task.description, &task.role_id)
                        .await
                }
            }))
            .await;

            for (task_id, run) in runnable.iter().zip(runs) {
                match run {
                    Ok(context) => {
                        // Publish every produced artifact so dependent tasks
                        // see it in their shared-context snapshot.
                        for (key, value) in &context.outputs {
                            self.bus.share_context(
                                context.agent_id.clone(),
                                key.as_str(),
                                value.clone(),
                            );
                        }
                        if let Some(task) = decomposition.task_mut(task_id) {
                            task.status = TaskStatus::Completed;
                            task.outputs =
                                Value::Object(Map::from_iter(context.outputs.clone()));
                        }
                        self.emitter.emit(EngineEvent::TaskCompleted {
                            task_id: task_id.clone(),
                            status: "completed".to_string(),
                        });
                        contexts.insert(task_id.clone(), context);
                    }
                    Err(e) => {
                        failed.insert(task_id.clone());
                        if let Some(task) = decomposition.task_mut(task_id) {
                            task.status = TaskStatus::Failed;
                            task.error = Some(e.to_string());
                        }
                        self.emitter.emit(EngineEvent::TaskCompleted {
                            task_id: task_id.clone(),
                            status: "failed".to_string(),
                        });
                        if matches!(e, EngineError::Cancelled) {
                            return Err(EngineError::Cancelled);
                        }
                        warn!(task = %task_id, error = %e, "task failed");
                    }
                }
            }
        }

        Ok(CollaborationResult {
            decomposition,
            contexts,
        })
    }

    async fn run_task(&self, task_id: &str, description: &str, role_id: &str) -> Result<AgentContext> {
        let role = self
            .registry
            .get_role(role_id)
            .ok_or_else(|| EngineError::Internal(format!("task role '{role_id}' not in registry")))?
            .clone();
        let mut agent = Agent::new(role, self.bus.clone());
        let intents = agent.prepare(description, None, self.project_context.clone())?;
        self.run_intents(&mut agent, intents, None, Some(task_id))
            .await?;
        Ok(agent.context)
    }

    /// The hot loop: select → digest/reuse → invoke → record → merge.
    async fn run_intents(
        &self,
        agent: &mut Agent,
        intents: Vec<Intent>,
        stage: Option<&Stage>,
        task_id: Option<&str>,
    ) -> Result<()> {
        let selection_ctx = SelectionContext {
            execution_mode: stage.and_then(|s| s.execution_mode.as_deref()),
        };

        for intent in intents {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let skill = self.select_with_retry(agent, &intent, stage, selection_ctx)?;
            let input = self.build_input(&intent, stage, &agent.context);
            let input_digest = digest(&json!({ "skill": skill.id, "input": input }));

            // Deterministic skills with a prior success on the same input
            // within this stage reuse the recorded output instead of
            // invoking again.
            if skill.deterministic {
                let reused = {
                    let tracker = self.tracker.read();
                    tracker
                        .find_reusable(&skill.id, stage.map(|s| s.id.as_str()), &input_digest)
                        .map(|prior| (prior.id, prior.output.clone()))
                };
                if let Some((prior_id, Some(output))) = reused {
                    debug!(skill = %skill.id, "reusing prior deterministic output");
                    agent.context.history.push(prior_id);
                    merge_output(&mut agent.context, &intent, &output);
                    self.share_stage_artifacts(agent, stage);
                    continue;
                }
            }

            self.emitter.emit(EngineEvent::SkillInvoked {
                skill_id: skill.id.clone(),
                stage_id: stage.map(|s| s.id.clone()),
                task_id: task_id.map(str::to_string),
            });

            let context_value = json!({
                "goal": agent.context.goal,
                "role": agent.context.role_id,
                "shared": agent.context.shared_context,
            });
            let started_at = Utc::now();
            let outcome = invoke_checked(
                self.invoker.as_ref(),
                &skill,
                &input,
                &context_value,
                &self.cancel,
            )
            .await;
            let ended_at = Utc::now();

            match outcome {
                Ok(output) => {
                    let execution = SkillExecution {
                        id: Uuid::new_v4(),
                        skill_id: skill.id.clone(),
                        stage_id: stage.map(|s| s.id.clone()),
                        task_id: task_id.map(str::to_string),
                        role_id: Some(agent.context.role_id.clone()),
                        started_at,
                        ended_at,
                        status: ExecutionStatus::Success,
                        error_kind: None,
                        error: None,
                        score: Some(1.0),
                        input_digest,
                        output_digest: Some(digest(&output)),
                        output: Some(output.clone()),
                    };
                    let execution_id = execution.id;
                    let duration_ms = execution.duration_ms();
                    self.tracker.write().record(execution);

                    self.emitter.emit(EngineEvent::SkillCompleted {
                        skill_id: skill.id.clone(),
                        status: ExecutionStatus::Success,
                        duration_ms,
                    });

                    agent.context.history.push(execution_id);
                    merge_output(&mut agent.context, &intent, &output);
                    self.share_stage_artifacts(agent, stage);
                }
                Err(e) => {
                    let status = match &e {
                        EngineError::Timeout { .. } => ExecutionStatus::Timeout,
                        _ => ExecutionStatus::Failure,
                    };
                    let execution = SkillExecution {
                        id: Uuid::new_v4(),
                        skill_id: skill.id.clone(),
                        stage_id: stage.map(|s| s.id.clone()),
                        task_id: task_id.map(str::to_string),
                        role_id: Some(agent.context.role_id.clone()),
                        started_at,
                        ended_at,
                        status,
                        error_kind: Some(ErrorKind::from(&e)),
                        error: Some(e.to_string()),
                        score: None,
                        input_digest,
                        output_digest: None,
                        output: None,
                    };
                    let duration_ms = execution.duration_ms();
                    self.tracker.write().record(execution);

                    self.emitter.emit(EngineEvent::SkillCompleted {
                        skill_id: skill.id.clone(),
                        status,
                        duration_ms,
                    });

                    agent
                        .context
                        .errors
                        .push(format!("intent '{}': {e}", intent.description));
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Select a skill; on `NoSkillAvailable` let the agent broaden the
    /// description once before the failure sticks.
    fn select_with_retry(
        &self,
        agent: &Agent,
        intent: &Intent,
        stage: Option<&Stage>,
        ctx: SelectionContext<'_>,
    ) -> Result<Skill> {
        match self.selector.select(&intent.description, agent.role(), ctx) {
            Ok(skill) => Ok(skill),
            Err(EngineError::NoSkillAvailable { .. }) => {
                let broadened = agent.broaden(intent, stage);
                debug!(agent = %agent.id, broadened, "re-selecting with broadened description");
                self.selector.select(&broadened, agent.role(), ctx)
            }
            Err(e) => Err(e),
        }
    }

    fn build_input(&self, intent: &Intent, stage: Option<&Stage>, context: &AgentContext) -> Value {
        let mut input = Map::new();
        input.insert("task".to_string(), Value::String(intent.description.clone()));
        if let Some(artifact) = &intent.artifact {
            input.insert("artifact".to_string(), Value::String(artifact.clone()));
        }
        if let Some(stage) = stage {
            let mut stage_inputs = Map::new();
            for artifact in &stage.inputs {
                if let Some(value) = context
                    .shared_context
                    .get(&artifact.name)
                    .or_else(|| context.outputs.get(&artifact.name))
                {
                    stage_inputs.insert(artifact.name.clone(), value.clone());
                }
            }
            if !stage_inputs.is_empty() {
                input.insert("inputs".to_string(), Value::Object(stage_inputs));
            }
        }
        Value::Object(input)
    }

    /// Push artifacts declared by the stage contract into the bus shared
    /// context as soon as they exist.
    fn share_stage_artifacts(&self, agent: &Agent, stage: Option<&Stage>) {
        if let Some(stage) = stage {
            for artifact in &stage.outputs {
                if let Some(value) = agent.context.outputs.get(&artifact.name) {
                    self.bus
                        .share_context(agent.id.clone(), artifact.name.as_str(), value.clone());
                }
            }
        }
    }
}

/// Merge a skill output into the agent's artifact map. Object outputs merge
/// key-by-key; when the intent targets a named artifact that the output did
/// not itself provide, the whole output is stored under that name so the
/// stage contract is satisfiable.
fn merge_output(context: &mut AgentContext, intent: &Intent, output: &Value) {
    match output {
        Value::Object(map) => {
            for (key, value) in map {
                context.outputs.insert(key.clone(), value.clone());
            }
            if let Some(artifact) = &intent.artifact {
                if !map.contains_key(artifact) {
                    context.outputs.insert(artifact.clone(), output.clone());
                }
            }
        }
        other => {
            let key = intent
                .artifact
                .clone()
                .unwrap_or_else(|| "result".to_string());
            context.outputs.insert(key, other.clone());
        }
    }
}
