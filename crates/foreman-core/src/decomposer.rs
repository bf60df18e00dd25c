//! Task decomposition.
//!
//! Turns a user goal into tasks with role assignments and a dependency
//! graph. Two strategies: an LLM-backed one when a client is available, and
//! a rule-based fallback that maps goal phrases onto workflow stages. Both
//! share the same post-processing (role assignment, cycle rejection,
//! topological grouping), so downstream behavior is strategy-independent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::llm::{LlmClient, LlmOptions};
use crate::registry::{Registry, Role};

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// A unit of work produced by decomposition, executed by a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub role_id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// The decomposition result: tasks, their dependency graph, and a
/// topological order expressed as groups of mutually independent tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDecomposition {
    pub tasks: Vec<Task>,
    pub execution_order: Vec<Vec<String>>,
    pub dependency_graph: HashMap<String, Vec<String>>,
}

impl TaskDecomposition {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }
}

/// Canonical action vocabulary for phrase → stage matching.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("build", &["build", "implement", "develop", "code", "create", "write"]),
    ("test", &["test", "verify", "validate", "check"]),
    ("review", &["review", "inspect", "audit", "approve"]),
    ("design", &["design", "architect", "plan", "model"]),
    ("analyze", &["analyze", "analysis", "research", "requirements", "understand"]),
    ("deploy", &["deploy", "release", "ship", "publish"]),
];

pub struct TaskDecomposer {
    registry: Arc<Registry>,
    llm: Option<Arc<dyn LlmClient>>,
    default_role: String,
}

/// Shape expected back from the LLM strategy.
#[derive(Debug, Deserialize)]
struct LlmPlan {
    tasks: Vec<LlmTask>,
}

#[derive(Debug, Deserialize)]
struct LlmTask {
    #[serde(default)]
    id: Option<String>,
    description: String,
    #[serde(default)]
    role_id: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

impl TaskDecomposer {
    pub fn new(
        registry: Arc<Registry>,
        llm: Option<Arc<dyn LlmClient>>,
        default_role: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            llm,
            default_role: default_role.into(),
        }
    }

    /// Decompose a goal into tasks. An empty goal yields an empty
    /// decomposition.
    pub async fn decompose(&self, goal: &str) -> Result<TaskDecomposition> {
        if goal.trim().is_empty() {
            return Ok(TaskDecomposition {
                tasks: Vec::new(),
                execution_order: Vec::new(),
                dependency_graph: HashMap::new(),
            });
        }

        let mut tasks = match &self.llm {
            Some(client) => match self.decompose_with_llm(client.as_ref(), goal).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(error = %e, "LLM decomposition failed, falling back to rules");
                    self.decompose_with_rules(goal)
                }
            },
            None => self.decompose_with_rules(goal),
        };

        self.assign_roles(&mut tasks);
        self.finalize(tasks)
    }

    async fn decompose_with_llm(&self, client: &dyn LlmClient, goal: &str) -> Result<Vec<Task>> {
        let roles: Vec<String> = self
            .registry
            .roles()
            .map(|r| format!("- {} ({}): {}", r.id, r.name, r.description))
            .collect();
        let prompt = format!(
            "Break the following goal into tasks for the available roles.\n\n\
             Goal: {goal}\n\nRoles:\n{}\n\n\
             Respond with JSON: {{\"tasks\": [{{\"id\": \"task-1\", \
             \"description\": \"...\", \"role_id\": \"...\", \"depends_on\": []}}]}}",
            roles.join("\n")
        );

        let response = client.complete(&prompt, &LlmOptions::default()).await?;
        let plan: LlmPlan = parse_json_response(&response)
            .ok_or_else(|| EngineError::Execution {
                skill_id: "task_decomposition".to_string(),
                detail: "LLM response was not a valid task plan".to_string(),
            })?;

        let known: HashSet<String> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| t.id.clone().unwrap_or_else(|| format!("task-{}", i + 1)))
            .collect();

        Ok(plan
            .tasks
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                let id = t.id.unwrap_or_else(|| format!("task-{}", i + 1));
                // An unknown dependency id from the model is dropped rather
                // than failing the whole plan.
                let depends_on = t
                    .depends_on
                    .into_iter()
                    .filter(|dep| {
                        let ok = known.contains(dep);
                        if !ok {
                            warn!(task = %id, dep, "dropping unknown dependency from LLM plan");
                        }
                        ok
                    })
                    .collect();
                Task {
                    id,
                    description: t.description,
                    role_id: t.role_id.unwrap_or_default(),
                    depends_on,
                    status: TaskStatus::Pending,
                    inputs: Value::Null,
                    outputs: Value::Null,
                    error: None,
                }
            })
            .collect())
    }

    /// Map goal phrases onto workflow stages; each mapped stage yields one
    /// task whose dependencies mirror the stage dependencies.
    fn decompose_with_rules(&self, goal: &str) -> Vec<Task> {
        let phrases = split_phrases(goal);
        let workflow = self.registry.workflow();

        // Stage id → (task index, phrase used)
        let mut mapped: BTreeMap<String, (usize, String)> = BTreeMap::new();
        for phrase in &phrases {
            let phrase_tokens = canonical_tokens(phrase);
            for stage in &workflow.stages {
                if mapped.contains_key(&stage.id) {
                    continue;
                }
                let stage_tokens = canonical_tokens(&format!("{} {}", stage.id, stage.name));
                if phrase_tokens.intersection(&stage_tokens).next().is_some() {
                    mapped.insert(stage.id.clone(), (mapped.len(), phrase.clone()));
                }
            }
        }

        if mapped.is_empty() {
            // Nothing matched: a single generic task carrying the whole goal.
            return vec![Task {
                id: "task-1".to_string(),
                description: goal.to_string(),
                role_id: String::new(),
                depends_on: Vec::new(),
                status: TaskStatus::Pending,
                inputs: Value::Null,
                outputs: Value::Null,
                error: None,
            }];
        }

        // Emit tasks in workflow declaration order for stable ids.
        let mut task_id_by_stage: HashMap<String, String> = HashMap::new();
        let mut tasks = Vec::new();
        for stage in &workflow.stages {
            if let Some((_, phrase)) = mapped.get(&stage.id) {
                let id = format!("task-{}", tasks.len() + 1);
                task_id_by_stage.insert(stage.id.clone(), id.clone());
                tasks.push(Task {
                    id,
                    description: format!("{} ({})", phrase, stage.name),
                    role_id: stage.role_id.clone().unwrap_or_default(),
                    depends_on: Vec::new(),
                    status: TaskStatus::Pending,
                    inputs: Value::Null,
                    outputs: Value::Null,
                    error: None,
                });
            }
        }
        for stage in &workflow.stages {
            if let (Some(task_id), true) = (
                task_id_by_stage.get(&stage.id),
                mapped.contains_key(&stage.id),
            ) {
                let deps: Vec<String> = stage
                    .depends_on
                    .iter()
                    .filter_map(|dep| task_id_by_stage.get(dep).cloned())
                    .collect();
                if let Some(task) = tasks.iter_mut().find(|t| &t.id == task_id) {
                    task.depends_on = deps;
                }
            }
        }
        tasks
    }

    /// Assign a role to every task that does not have a valid one, matching
    /// the description against role vocabulary and required skills. Tasks
    /// with no match go to the configured default role.
    fn assign_roles(&self, tasks: &mut [Task]) {
        for task in tasks.iter_mut() {
            if !task.role_id.is_empty() && self.registry.get_role(&task.role_id).is_some() {
                continue;
            }
            task.role_id = self
                .best_role_for(&task.description)
                .unwrap_or_else(|| self.default_role.clone());
        }
    }

    fn best_role_for(&self, description: &str) -> Option<String> {
        let desc_tokens = canonical_tokens(description);
        let mut best: Option<(usize, String)> = None;
        let mut roles: Vec<&Role> = self.registry.roles().collect();
        roles.sort_by(|a, b| a.id.cmp(&b.id));

        for role in roles {
            let mut text = format!("{} {} {}", role.id, role.name, role.description);
            for req in &role.required_skills {
                if let Some(skill) = self.registry.get_skill(&req.skill_id) {
                    text.push(' ');
                    text.push_str(&skill.name);
                    text.push(' ');
                    text.push_str(&skill.dimensions.join(" "));
                }
            }
            let overlap = desc_tokens
                .intersection(&canonical_tokens(&text))
                .count();
            if overlap > 0 && best.as_ref().map(|(n, _)| overlap > *n).unwrap_or(true) {
                best = Some((overlap, role.id.clone()));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Validate the graph and compute the grouped execution order.
    fn finalize(&self, tasks: Vec<Task>) -> Result<TaskDecomposition> {
        let dependency_graph: HashMap<String, Vec<String>> = tasks
            .iter()
            .map(|t| (t.id.clone(), t.depends_on.clone()))
            .collect();

        // Kahn's algorithm by levels: each group contains tasks whose
        // dependencies are all satisfied and that have no edges among
        // themselves.
        let mut remaining: BTreeMap<&str, HashSet<&str>> = tasks
            .iter()
            .map(|t| {
                (
                    t.id.as_str(),
                    t.depends_on.iter().map(String::as_str).collect(),
                )
            })
            .collect();

        let mut execution_order: Vec<Vec<String>> = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| id.to_string())
                .collect();
            if ready.is_empty() {
                let stuck: Vec<String> = remaining.keys().map(|s| s.to_string()).collect();
                return Err(EngineError::CyclicDecomposition(stuck));
            }
            for id in &ready {
                remaining.remove(id.as_str());
            }
            for deps in remaining.values_mut() {
                for id in &ready {
                    deps.remove(id.as_str());
                }
            }
            execution_order.push(ready);
        }

        debug!(
            tasks = tasks.len(),
            groups = execution_order.len(),
            "goal decomposed"
        );
        Ok(TaskDecomposition {
            tasks,
            execution_order,
            dependency_graph,
        })
    }
}

fn split_phrases(goal: &str) -> Vec<String> {
    goal.split(|c| c == ',' || c == ';' || c == '.')
        .flat_map(|part| part.split(" and "))
        .flat_map(|part| part.split(" then "))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tokenize and fold synonyms onto canonical action words.
fn canonical_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|token| {
            for (canonical, synonyms) in SYNONYMS {
                if synonyms.contains(&token) {
                    return canonical.to_string();
                }
            }
            token.to_string()
        })
        .collect()
}

fn parse_json_response<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    let fenced = regex::Regex::new(r"```(?:json)?\s*([\s\S]*?)```")
        .ok()
        .and_then(|re| re.captures(response))
        .and_then(|caps| caps.get(1))
        .and_then(|m| serde_json::from_str(m.as_str().trim()).ok());
    fenced.or_else(|| serde_json::from_str(response.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use crate::registry::{RegistryConfig, Skill, SkillRequirement, Stage, Workflow};

    fn registry() -> Arc<Registry> {
        let mut builder_role = crate::registry::Role::new("builder", "Builder");
        builder_role.description = "implements features".into();
        builder_role.required_skills = vec![SkillRequirement::new("coding", 1)];
        let mut reviewer_role = crate::registry::Role::new("reviewer", "Reviewer");
        reviewer_role.description = "reviews code".into();
        reviewer_role.required_skills = vec![SkillRequirement::new("reviewing", 1)];

        let mut build = Stage::new("build", "Build");
        build.role_id = Some("builder".into());
        build.required_skills = vec![SkillRequirement::new("coding", 1)];
        let mut review = Stage::new("review", "Review");
        review.role_id = Some("reviewer".into());
        review.required_skills = vec![SkillRequirement::new("reviewing", 1)];
        review.depends_on = vec!["build".into()];

        Arc::new(
            Registry::load(RegistryConfig {
                skills: vec![Skill::new("coding", "Coding"), Skill::new("reviewing", "Reviewing")],
                roles: vec![builder_role, reviewer_role],
                workflow: Some(Workflow {
                    id: "wf".into(),
                    name: "WF".into(),
                    description: String::new(),
                    stages: vec![build, review],
                }),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_empty_goal_yields_zero_tasks() {
        let decomposer = TaskDecomposer::new(registry(), None, "builder");
        let decomposition = decomposer.decompose("  ").await.unwrap();
        assert!(decomposition.tasks.is_empty());
        assert!(decomposition.execution_order.is_empty());
    }

    #[tokio::test]
    async fn test_rule_strategy_maps_phrases_to_stages() {
        let decomposer = TaskDecomposer::new(registry(), None, "builder");
        let decomposition = decomposer
            .decompose("build the login form and review the login form")
            .await
            .unwrap();

        assert_eq!(decomposition.tasks.len(), 2);
        let build = &decomposition.tasks[0];
        let review = &decomposition.tasks[1];
        assert_eq!(build.role_id, "builder");
        assert_eq!(review.role_id, "reviewer");
        // The review task inherits the stage dependency on build.
        assert_eq!(review.depends_on, vec![build.id.clone()]);
        assert_eq!(
            decomposition.execution_order,
            vec![vec![build.id.clone()], vec![review.id.clone()]]
        );
    }

    #[tokio::test]
    async fn test_unmatched_goal_becomes_generic_task_with_default_role() {
        let decomposer = TaskDecomposer::new(registry(), None, "builder");
        let decomposition = decomposer.decompose("zzz qqq unrelated").await.unwrap();
        assert_eq!(decomposition.tasks.len(), 1);
        assert_eq!(decomposition.tasks[0].role_id, "builder");
    }

    #[tokio::test]
    async fn test_llm_strategy_parses_plan() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"tasks": [
                {"id": "t1", "description": "implement the API", "role_id": "builder", "depends_on": []},
                {"id": "t2", "description": "review the API", "role_id": "reviewer", "depends_on": ["t1"]}
            ]}"#,
        ]));
        let decomposer = TaskDecomposer::new(registry(), Some(llm), "builder");
        let decomposition = decomposer.decompose("ship the API").await.unwrap();

        assert_eq!(decomposition.tasks.len(), 2);
        assert_eq!(decomposition.execution_order.len(), 2);
        assert_eq!(decomposition.tasks[1].depends_on, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_llm_garbage_falls_back_to_rules() {
        let llm = Arc::new(ScriptedLlm::new(vec!["complete nonsense"]));
        let decomposer = TaskDecomposer::new(registry(), Some(llm), "builder");
        let decomposition = decomposer.decompose("build the thing").await.unwrap();
        assert!(!decomposition.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"tasks": [
                {"id": "t1", "description": "a", "depends_on": ["t2"]},
                {"id": "t2", "description": "b", "depends_on": ["t1"]}
            ]}"#,
        ]));
        let decomposer = TaskDecomposer::new(registry(), Some(llm), "builder");
        let err = decomposer.decompose("anything").await.unwrap_err();
        assert!(matches!(err, EngineError::CyclicDecomposition(_)));
    }

    #[tokio::test]
    async fn test_independent_tasks_share_a_group() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"tasks": [
                {"id": "t1", "description": "build part A"},
                {"id": "t2", "description": "build part B"},
                {"id": "t3", "description": "review both", "depends_on": ["t1", "t2"]}
            ]}"#,
        ]));
        let decomposer = TaskDecomposer::new(registry(), Some(llm), "builder");
        let decomposition = decomposer.decompose("parallel work").await.unwrap();

        assert_eq!(decomposition.execution_order.len(), 2);
        assert_eq!(decomposition.execution_order[0].len(), 2);
        assert_eq!(decomposition.execution_order[1], vec!["t3".to_string()]);
    }
}
