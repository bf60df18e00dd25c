//! Engine facade.
//!
//! Wires the registry, orchestrator, workflow executor, checkpoint manager,
//! state store and event sink together behind one handle. Everything is
//! threaded through constructors — no globals — so multiple engines can
//! coexist in one process.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use crate::agent::AgentContext;
use crate::bus::MessageBus;
use crate::cancel::CancelToken;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::decomposer::TaskDecomposer;
use crate::error::{EngineError, Result};
use crate::events::{EventEmitter, EventSink, NullSink};
use crate::events::EngineEvent;
use crate::executor::WorkflowExecutor;
use crate::gates::GateEvaluator;
use crate::invoker::{CompositeInvoker, LlmInvoker, McpInvoker, PlaceholderInvoker, SkillInvoker};
use crate::llm::{LlmClient, LlmOptions};
use crate::mcp::McpClient;
use crate::orchestrator::{CollaborationResult, Orchestrator};
use crate::registry::{Registry, RegistryConfig};
use crate::state::{CheckpointMeta, ExecutionState, StateDocument, SCHEMA_VERSION};
use crate::store::StateStore;
use crate::tracker::{ExecutionTracker, SkillExecution, SkillStats};

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: RegistryConfig,
    evaluator: GateEvaluator,
    llm: Option<Arc<dyn LlmClient>>,
    llm_options: LlmOptions,
    mcp: Option<Arc<dyn McpClient>>,
    invoker: Option<Arc<dyn SkillInvoker>>,
    store: Option<Arc<dyn StateStore>>,
    sink: Arc<dyn EventSink>,
    default_role: Option<String>,
    project_context: Value,
    auto_checkpoint: bool,
}

impl EngineBuilder {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            evaluator: GateEvaluator::new(),
            llm: None,
            llm_options: LlmOptions::default(),
            mcp: None,
            invoker: None,
            store: None,
            sink: Arc::new(NullSink),
            default_role: None,
            project_context: Value::Null,
            auto_checkpoint: false,
        }
    }

    /// Gate evaluator carrying registered custom predicates. Must be set
    /// before `build` so the registry can validate predicate references.
    pub fn evaluator(mut self, evaluator: GateEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(client);
        self
    }

    pub fn llm_options(mut self, options: LlmOptions) -> Self {
        self.llm_options = options;
        self
    }

    pub fn mcp_client(mut self, client: Arc<dyn McpClient>) -> Self {
        self.mcp = Some(client);
        self
    }

    /// Replace the default composite invoker entirely.
    pub fn invoker(mut self, invoker: Arc<dyn SkillInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Role assigned to decomposed tasks that match nothing.
    pub fn default_role(mut self, role_id: impl Into<String>) -> Self {
        self.default_role = Some(role_id.into());
        self
    }

    pub fn project_context(mut self, context: Value) -> Self {
        self.project_context = context;
        self
    }

    /// Take a checkpoint automatically after every stage transition and at
    /// `wfauto` boundaries. Requires a state store.
    pub fn auto_checkpoint(mut self, enabled: bool) -> Self {
        self.auto_checkpoint = enabled;
        self
    }

    pub fn build(mut self) -> Result<Engine> {
        self.config.registered_predicates = self.evaluator.predicate_ids();
        let registry = Arc::new(Registry::load(self.config)?);
        let workflow_id = registry.workflow().id.clone();
        let emitter = EventEmitter::new(Arc::clone(&self.sink), workflow_id.clone());

        let invoker: Arc<dyn SkillInvoker> = match self.invoker {
            Some(invoker) => invoker,
            None => {
                let mut composite = CompositeInvoker::new();
                if let Some(mcp) = &self.mcp {
                    composite = composite.push(Arc::new(McpInvoker::new(Arc::clone(mcp))));
                }
                if let Some(llm) = &self.llm {
                    composite = composite.push(Arc::new(
                        LlmInvoker::new(Arc::clone(llm))
                            .with_options(self.llm_options.clone())
                            .with_emitter(emitter.clone()),
                    ));
                }
                composite = composite.push(Arc::new(PlaceholderInvoker::new()));
                Arc::new(composite)
            }
        };

        let default_role = self
            .default_role
            .or_else(|| {
                let mut ids: Vec<String> = registry.roles().map(|r| r.id.clone()).collect();
                ids.sort_unstable();
                ids.into_iter().next()
            })
            .unwrap_or_default();

        let tracker = Arc::new(RwLock::new(ExecutionTracker::new()));
        let bus = MessageBus::with_journal();
        bus.set_emitter(emitter.clone());
        let cancel = CancelToken::new();
        let decomposer =
            TaskDecomposer::new(Arc::clone(&registry), self.llm.clone(), default_role);
        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            invoker,
            Arc::clone(&tracker),
            bus.clone(),
            emitter.clone(),
            decomposer,
            cancel.clone(),
        )
        .with_project_context(self.project_context);

        let executor = WorkflowExecutor::new(
            Arc::clone(&registry),
            orchestrator,
            Arc::new(self.evaluator),
            emitter.clone(),
        );

        let checkpoints = self
            .store
            .as_ref()
            .map(|store| CheckpointManager::new(Arc::clone(store), workflow_id.clone()));

        Ok(Engine {
            registry,
            executor,
            tracker,
            bus,
            cancel,
            store: self.store,
            checkpoints,
            emitter,
            workflow_id,
            auto_checkpoint: self.auto_checkpoint,
        })
    }
}

/// The assembled engine. All mutation goes through `&mut self`, so a
/// checkpoint serialization naturally excludes concurrent state writers.
pub struct Engine {
    registry: Arc<Registry>,
    executor: WorkflowExecutor,
    tracker: Arc<RwLock<ExecutionTracker>>,
    bus: MessageBus,
    cancel: CancelToken,
    store: Option<Arc<dyn StateStore>>,
    checkpoints: Option<CheckpointManager>,
    emitter: EventEmitter,
    workflow_id: String,
    auto_checkpoint: bool,
}

/// Aggregate run summary.
#[derive(Debug, Clone)]
pub struct EngineSummary {
    pub workflow_id: String,
    pub stages_completed: usize,
    pub stages_total: usize,
    pub executions: usize,
    pub skill_stats: Vec<SkillStats>,
}

impl Engine {
    pub fn builder(config: RegistryConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> &ExecutionState {
        self.executor.state()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// A clone of the cancel token, for signalling from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Signal workflow-level cancellation and persist the resulting state.
    pub fn cancel(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.persist()
    }

    pub fn stage_context(&self, stage_id: &str) -> Option<&AgentContext> {
        self.executor.stage_context(stage_id)
    }

    pub fn execution_log(&self) -> Vec<SkillExecution> {
        self.tracker.read().log().to_vec()
    }

    pub fn summary(&self) -> EngineSummary {
        let tracker = self.tracker.read();
        EngineSummary {
            workflow_id: self.workflow_id.clone(),
            stages_completed: self.state().completed_stages.len(),
            stages_total: self.registry.workflow().stages.len(),
            executions: tracker.len(),
            skill_stats: tracker.statistics(),
        }
    }

    pub async fn start_stage(
        &mut self,
        stage_id: &str,
        role_id: Option<&str>,
        goal: &str,
    ) -> Result<()> {
        let result = self.executor.start(stage_id, role_id, goal).await;
        self.after_transition(stage_id)?;
        result
    }

    pub async fn complete_stage(&mut self, stage_id: &str) -> Result<crate::gates::GateReport> {
        let report = self.executor.complete(stage_id).await?;
        self.after_transition(stage_id)?;
        Ok(report)
    }

    pub async fn retry_stage(
        &mut self,
        stage_id: &str,
        goal: &str,
    ) -> Result<crate::gates::GateReport> {
        let report = self.executor.retry(stage_id, goal).await?;
        self.after_transition(stage_id)?;
        Ok(report)
    }

    /// Start + gates in one call. Returns `GateFailure` when the stage ends
    /// up blocked.
    pub async fn run_stage(&mut self, stage_id: &str, goal: &str) -> Result<()> {
        let result = self.executor.run_stage(stage_id, None, goal).await;
        self.after_transition(stage_id)?;
        let report = result?;
        if !report.passed() {
            return Err(EngineError::GateFailure {
                stage_id: stage_id.to_string(),
                findings: report.blocking_failures(),
            });
        }
        Ok(())
    }

    /// Drive the whole workflow: repeatedly run startable stages (parallel
    /// partitions where marked), checkpointing at every boundary.
    pub async fn wfauto(&mut self, goal: &str) -> Result<()> {
        loop {
            match self.executor.wfauto_step(goal).await {
                Ok(true) => {
                    self.after_transition("wfauto")?;
                }
                Ok(false) => {
                    self.persist()?;
                    info!(workflow = %self.workflow_id, "workflow complete");
                    return Ok(());
                }
                Err(e) => {
                    // Persist the failed/cancelled state before surfacing.
                    self.persist()?;
                    return Err(e);
                }
            }
        }
    }

    /// Decompose a goal and run its tasks with collaborating agents.
    pub async fn collaborate(&mut self, goal: &str) -> Result<CollaborationResult> {
        let result = self.executor.orchestrator().execute_with_collaboration(goal).await;
        self.persist()?;
        result
    }

    fn after_transition(&mut self, label: &str) -> Result<()> {
        self.persist()?;
        if self.auto_checkpoint && self.checkpoints.is_some() {
            self.checkpoint(Some(label))?;
        }
        Ok(())
    }

    /// Serialize the full execution document: state machine, tracker log,
    /// shared context and journal tail.
    pub fn document(&self) -> StateDocument {
        StateDocument::new(
            self.executor.state().clone(),
            self.tracker.read().log().to_vec(),
            self.bus.shared_entries(),
            self.bus.journal(),
        )
    }

    /// Save the live document under the workflow id, when a store is
    /// configured.
    pub fn persist(&self) -> Result<()> {
        if let Some(store) = &self.store {
            let blob = serde_json::to_vec(&self.document())?;
            store.save(&self.workflow_id, &blob)?;
        }
        Ok(())
    }

    /// Load the live document from the store and replace all in-memory
    /// state. Returns `false` when no blob exists.
    pub fn load_state(&mut self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(blob) = store.load(&self.workflow_id)? else {
            return Ok(false);
        };
        let document: StateDocument = serde_json::from_slice(&blob)?;
        self.apply_document(document)?;
        Ok(true)
    }

    fn apply_document(&mut self, document: StateDocument) -> Result<()> {
        if document.schema_version != SCHEMA_VERSION {
            return Err(EngineError::Internal(format!(
                "unsupported state schema_version {} (expected {})",
                document.schema_version, SCHEMA_VERSION
            )));
        }
        self.executor.restore_state(document.state);
        *self.tracker.write() = ExecutionTracker::from_log(document.tracker);
        self.bus.replay(document.journal);
        self.bus.restore_shared(document.shared_context);
        Ok(())
    }

    /// Take a named checkpoint of the current document.
    pub fn checkpoint(&mut self, name: Option<&str>) -> Result<Checkpoint> {
        let manager = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| EngineError::Internal("no state store configured".to_string()))?;
        let checkpoint = manager.create(name, self.document())?;

        self.executor.state_mut().checkpoints.push(CheckpointMeta {
            id: checkpoint.id.clone(),
            name: checkpoint.name.clone(),
            created_at: checkpoint.created_at,
            stage_id: checkpoint.document.state.current_stage_id.clone(),
        });
        self.emitter.emit(EngineEvent::CheckpointCreated {
            checkpoint_id: checkpoint.id.clone(),
            name: checkpoint.name.clone(),
        });
        self.persist()?;
        Ok(checkpoint)
    }

    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        match &self.checkpoints {
            Some(manager) => manager.list(),
            None => Ok(Vec::new()),
        }
    }

    /// Restore a checkpoint, fully replacing live state.
    pub fn restore_checkpoint(&mut self, checkpoint_id: &str) -> Result<()> {
        let manager = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| EngineError::Internal("no state store configured".to_string()))?;
        let checkpoint = manager.restore(checkpoint_id)?;
        self.apply_document(checkpoint.document)?;
        self.persist()?;
        info!(checkpoint = checkpoint_id, "state restored");
        Ok(())
    }

    pub fn delete_checkpoint(&mut self, checkpoint_id: &str) -> Result<bool> {
        let manager = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| EngineError::Internal("no state store configured".to_string()))?;
        let deleted = manager.delete(checkpoint_id)?;
        self.executor
            .state_mut()
            .checkpoints
            .retain(|meta| meta.id != checkpoint_id);
        self.persist()?;
        Ok(deleted)
    }
}

/// Map a run result to the process exit code an external CLI reports:
/// 0 success, 1 blocked by gate, 2 task failure, 3 configuration error,
/// 4 cancelled, 5 internal error.
pub fn run_exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.exit_code(),
    }
}
