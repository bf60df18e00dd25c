//! End-to-end collaboration scenarios: goal decomposition, shared-context
//! handoff between dependent tasks, and failure skipping.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use foreman_core::decomposer::TaskStatus;
use foreman_core::engine::Engine;
use foreman_core::error::Result;
use foreman_core::events::{EngineEvent, MemorySink};
use foreman_core::invoker::SkillInvoker;
use foreman_core::registry::{
    RegistryConfig, Role, Skill, SkillRequirement, Stage, Workflow,
};

fn collaboration_config() -> RegistryConfig {
    let mut construct = Skill::new("construct", "Construct");
    construct.description = "build and implement features".into();
    construct.output_schema = Some(json!({
        "type": "object",
        "required": ["X"],
        "properties": {"X": {"type": "string"}}
    }));

    let mut critique = Skill::new("critique", "Critique");
    critique.description = "review and approve artifacts".into();
    critique.output_schema = Some(json!({
        "type": "object",
        "required": ["verdict"],
        "properties": {"verdict": {"type": "string"}}
    }));

    let mut builder = Role::new("builder", "Builder");
    builder.description = "implements features".into();
    builder.required_skills = vec![SkillRequirement::new("construct", 1)];

    let mut reviewer = Role::new("reviewer", "Reviewer");
    reviewer.description = "reviews artifacts".into();
    reviewer.required_skills = vec![SkillRequirement::new("critique", 1)];

    let mut build = Stage::new("build", "Build");
    build.role_id = Some("builder".into());
    let mut review = Stage::new("review", "Review");
    review.role_id = Some("reviewer".into());
    review.depends_on = vec!["build".into()];

    RegistryConfig {
        skills: vec![construct, critique],
        roles: vec![builder, reviewer],
        workflow: Some(Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![build, review],
        }),
        ..Default::default()
    }
}

/// S4: "build X and review X" decomposes into a builder task and a
/// dependent reviewer task; the builder's artifact flows to the reviewer
/// through the shared context.
#[tokio::test]
async fn dependent_task_sees_shared_artifact() {
    let sink = Arc::new(MemorySink::new());
    let mut engine = Engine::builder(collaboration_config())
        .event_sink(sink.clone())
        .default_role("builder")
        .build()
        .unwrap();

    let result = engine.collaborate("build X and review X").await.unwrap();
    assert_eq!(result.decomposition.tasks.len(), 2);

    let build_task = &result.decomposition.tasks[0];
    let review_task = &result.decomposition.tasks[1];
    assert_eq!(build_task.role_id, "builder");
    assert_eq!(review_task.role_id, "reviewer");
    assert_eq!(review_task.depends_on, vec![build_task.id.clone()]);
    assert!(result
        .decomposition
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed));

    // The builder published X; the reviewer's context snapshot has it.
    assert_eq!(engine.bus().get_context("X"), Some(json!("stub:X")));
    let reviewer_context = &result.contexts[&review_task.id];
    assert_eq!(reviewer_context.shared_context["X"], json!("stub:X"));

    // The builder task completed strictly before the reviewer task started.
    let types: Vec<(String, String)> = sink
        .records()
        .iter()
        .filter_map(|r| match &r.event {
            EngineEvent::TaskCreated { task_id, .. } => {
                Some(("created".to_string(), task_id.clone()))
            }
            EngineEvent::TaskCompleted { task_id, .. } => {
                Some(("completed".to_string(), task_id.clone()))
            }
            _ => None,
        })
        .collect();
    let t1_done = types
        .iter()
        .position(|(kind, id)| kind == "completed" && id == &build_task.id)
        .unwrap();
    let t2_started = types
        .iter()
        .position(|(kind, id)| kind == "created" && id == &review_task.id)
        .unwrap();
    assert!(t1_done < t2_started);
}

/// An empty goal decomposes into zero tasks and completes immediately.
#[tokio::test]
async fn empty_goal_decomposes_to_nothing() {
    let mut engine = Engine::builder(collaboration_config())
        .default_role("builder")
        .build()
        .unwrap();
    let result = engine.collaborate("").await.unwrap();
    assert!(result.decomposition.tasks.is_empty());
    assert!(result.decomposition.execution_order.is_empty());
}

/// Invoker that fails any skill whose id matches.
struct FailSkill(&'static str);

#[async_trait]
impl SkillInvoker for FailSkill {
    fn supports(&self, _skill: &Skill) -> bool {
        true
    }

    async fn invoke(&self, skill: &Skill, _input: &Value, _context: &Value) -> Result<Value> {
        if skill.id == self.0 {
            return Err(foreman_core::error::EngineError::Execution {
                skill_id: skill.id.clone(),
                detail: "backend unavailable".to_string(),
            });
        }
        Ok(json!({ "X": "built", "verdict": "ok" }))
    }
}

/// A failed task does not cancel siblings, but its dependents are skipped
/// with the upstream failure recorded.
#[tokio::test]
async fn downstream_of_failure_is_skipped() {
    let mut engine = Engine::builder(collaboration_config())
        .invoker(Arc::new(FailSkill("construct")))
        .default_role("builder")
        .build()
        .unwrap();

    let result = engine.collaborate("build X and review X").await.unwrap();
    let build_task = &result.decomposition.tasks[0];
    let review_task = &result.decomposition.tasks[1];

    assert_eq!(build_task.status, TaskStatus::Failed);
    assert!(build_task.error.as_deref().unwrap().contains("backend"));
    assert_eq!(review_task.status, TaskStatus::Skipped);
    assert!(review_task
        .error
        .as_deref()
        .unwrap()
        .contains("upstream task failed"));
}
