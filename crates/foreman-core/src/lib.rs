//! Foreman Core - role-bounded multi-agent workflow orchestration
//!
//! Foreman drives software-delivery pipelines through role-bounded stages
//! and composable skills. A user goal is decomposed into tasks with
//! dependency edges, each task is executed by an agent bound to a role, and
//! every skill invocation flows through a pluggable dispatch layer while
//! quality gates guard stage completion.
//!
//! # Architecture
//!
//! The engine is split into three strictly layered concerns:
//!
//! 1. **Reasoning** (`agent`): builds context and emits intents; never
//!    touches an invoker.
//! 2. **Skill invocation** (`orchestrator` + `selector` + `invoker`): picks
//!    the best skill for each intent and dispatches it to a backend.
//! 3. **Execution** (`invoker` backends): placeholder, LLM or MCP.
//!
//! Around that core sit the validated [`registry::Registry`], the
//! [`executor::WorkflowExecutor`] stage state machine, the
//! [`bus::MessageBus`] for agent collaboration, the append-only
//! [`tracker::ExecutionTracker`], and checkpoint/restore over a pluggable
//! [`store::StateStore`].
//!
//! # Quick start
//!
//! ```
//! use foreman_core::engine::Engine;
//! use foreman_core::registry::{
//!     ArtifactSpec, GateKind, QualityGate, RegistryConfig, Role, Skill,
//!     SkillRequirement, Stage, Workflow,
//! };
//!
//! # async fn demo() -> foreman_core::error::Result<()> {
//! let mut skill = Skill::new("coding", "Coding");
//! skill.description = "write code for features".into();
//!
//! let mut role = Role::new("dev", "Developer");
//! role.required_skills = vec![SkillRequirement::new("coding", 1)];
//!
//! let mut stage = Stage::new("build", "Build");
//! stage.role_id = Some("dev".into());
//! stage.quality_gates = vec![QualityGate::new(
//!     "has-result",
//!     GateKind::ArtifactExists { artifact: "result".into() },
//! )];
//! stage.outputs = vec![ArtifactSpec::optional("result")];
//!
//! let mut engine = Engine::builder(RegistryConfig {
//!     skills: vec![skill],
//!     roles: vec![role],
//!     workflow: Some(Workflow {
//!         id: "demo".into(),
//!         name: "Demo".into(),
//!         description: String::new(),
//!         stages: vec![stage],
//!     }),
//!     ..Default::default()
//! })
//! .build()?;
//!
//! engine.wfauto("demo").await?;
//! assert_eq!(engine.state().completed_stages, vec!["build".to_string()]);
//! # Ok(())
//! # }
//! ```
//!
//! # Design principles
//!
//! 1. **Total validation**: a partially valid configuration never loads.
//! 2. **Single-writer state**: only the executor mutates stage state, only
//!    the orchestrator appends to the tracker.
//! 3. **No globals**: everything is threaded through constructors; multiple
//!    engines coexist in one process.
//! 4. **Determinism where promised**: skill selection and digest-based
//!    reuse are reproducible for fixed inputs and history.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod agent;
pub mod bus;
pub mod cancel;
pub mod checkpoint;
pub mod decomposer;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod gates;
pub mod invoker;
pub mod llm;
pub mod mcp;
pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod selector;
pub mod state;
pub mod store;
pub mod tracker;

pub use engine::{run_exit_code, Engine, EngineBuilder};
pub use error::{ConfigError, EngineError, ErrorKind, Result};
pub use registry::{Registry, RegistryConfig, Role, Skill, SkillRequirement, Stage, Workflow};
pub use state::{ExecutionState, StageState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
