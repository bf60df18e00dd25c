//! Skill selection.
//!
//! Given a task description, a role and the execution history, pick the best
//! matching skill from the registry. Scoring is a weighted sum gated by role
//! authorization and constraint compatibility; ties break deterministically.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::registry::{Registry, Role, Skill};
use crate::tracker::ExecutionTracker;

/// Lexical affinity between the task description and the skill text.
const W_AFFINITY: f64 = 0.5;
/// Role authorization contribution (also a hard gate).
const W_ROLE: f64 = 0.2;
/// Historical success contribution.
const W_HISTORY: f64 = 0.2;
/// Bonus when the skill's execution mode matches the stage's declared mode.
const MODE_BOOST: f64 = 0.1;

/// Ambient information available during selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionContext<'a> {
    /// The stage's declared execution mode, if any.
    pub execution_mode: Option<&'a str>,
}

/// Picks skills for tasks, scoring against role, affinity and history.
pub struct SkillSelector {
    registry: Arc<Registry>,
    tracker: Arc<RwLock<ExecutionTracker>>,
}

impl SkillSelector {
    pub fn new(registry: Arc<Registry>, tracker: Arc<RwLock<ExecutionTracker>>) -> Self {
        Self { registry, tracker }
    }

    /// The single best skill for the task, or [`EngineError::NoSkillAvailable`]
    /// when every candidate scores zero. That error is recoverable: the agent
    /// may re-prompt with a broader description.
    pub fn select(&self, task: &str, role: &Role, ctx: SelectionContext<'_>) -> Result<Skill> {
        self.rank(task, role, ctx, 1)
            .into_iter()
            .next()
            .map(|(skill, _)| skill)
            .ok_or_else(|| EngineError::NoSkillAvailable {
                task: task.to_string(),
            })
    }

    /// Up to `top_n` candidate skills ranked by score, best first.
    pub fn rank(
        &self,
        task: &str,
        role: &Role,
        ctx: SelectionContext<'_>,
        top_n: usize,
    ) -> Vec<(Skill, f64)> {
        let task_tokens = tokenize(task);
        let tracker = self.tracker.read();

        let mut scored: Vec<(&Skill, f64, u8)> = self
            .registry
            .skills()
            .filter_map(|skill| {
                let level = self.registry.authorized_level(&role.id, &skill.id);
                let score = self.score(skill, role, level, &task_tokens, &tracker, ctx);
                (score > 0.0).then(|| (skill, score, level.unwrap_or(0)))
            })
            .collect();

        // Deterministic: score desc, then satisfied min_level desc, then id.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.cmp(&a.2))
                .then(a.0.id.cmp(&b.0.id))
        });

        if let Some((best, score, _)) = scored.first() {
            debug!(task, skill = %best.id, score, "skill selected");
        }

        scored
            .into_iter()
            .take(top_n)
            .map(|(skill, score, _)| (skill.clone(), score))
            .collect()
    }

    fn score(
        &self,
        skill: &Skill,
        role: &Role,
        authorized_level: Option<u8>,
        task_tokens: &[String],
        tracker: &ExecutionTracker,
        ctx: SelectionContext<'_>,
    ) -> f64 {
        // Hard gate: the skill must be in the role's expanded required set.
        if authorized_level.is_none() {
            return 0.0;
        }
        // Hard gate: none of the skill's declared capabilities may be
        // forbidden for the role.
        if skill
            .execution_capabilities
            .iter()
            .any(|cap| role.constraints.forbidden_actions.contains(cap))
        {
            return 0.0;
        }

        let affinity = self.affinity(skill, task_tokens);
        let history = tracker.score_of(&skill.id);
        let mode_fit = match (ctx.execution_mode, skill.metadata.execution_mode.as_deref()) {
            (Some(stage_mode), Some(skill_mode)) if stage_mode == skill_mode => MODE_BOOST,
            _ => 0.0,
        };

        W_AFFINITY * affinity + W_ROLE + W_HISTORY * history + mode_fit
    }

    /// Token-overlap affinity between the task and the skill's name,
    /// description and dimensions. Jaccard over the token sets is enough to
    /// satisfy the ordering and determinism requirements.
    fn affinity(&self, skill: &Skill, task_tokens: &[String]) -> f64 {
        if task_tokens.is_empty() {
            return 0.0;
        }
        let mut skill_tokens = tokenize(&skill.name);
        skill_tokens.extend(tokenize(&skill.description));
        for dim in &skill.dimensions {
            skill_tokens.extend(tokenize(dim));
        }
        if skill_tokens.is_empty() {
            return 0.0;
        }

        let task_set: std::collections::BTreeSet<&str> =
            task_tokens.iter().map(String::as_str).collect();
        let skill_set: std::collections::BTreeSet<&str> =
            skill_tokens.iter().map(String::as_str).collect();
        let intersection = task_set.intersection(&skill_set).count();
        let union = task_set.union(&skill_set).count();
        intersection as f64 / union as f64
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, SkillRequirement};
    use crate::tracker::{digest, ExecutionStatus, SkillExecution};
    use chrono::Utc;
    use uuid::Uuid;

    fn setup(skills: Vec<Skill>, role_skills: Vec<SkillRequirement>) -> (Arc<Registry>, Role) {
        let mut role = Role::new("dev", "Developer");
        role.required_skills = role_skills;
        let registry = Arc::new(
            Registry::load(RegistryConfig {
                skills,
                roles: vec![role.clone()],
                ..Default::default()
            })
            .unwrap(),
        );
        let role = registry.get_role("dev").unwrap().clone();
        (registry, role)
    }

    fn selector(registry: Arc<Registry>) -> SkillSelector {
        SkillSelector::new(registry, Arc::new(RwLock::new(ExecutionTracker::new())))
    }

    fn skill(id: &str, description: &str) -> Skill {
        let mut s = Skill::new(id, id);
        s.description = description.to_string();
        s
    }

    #[test]
    fn test_affinity_prefers_matching_description() {
        let (registry, role) = setup(
            vec![
                skill("parse", "parse source files into syntax trees"),
                skill("deploy", "deploy artifacts to production"),
            ],
            vec![
                SkillRequirement::new("parse", 1),
                SkillRequirement::new("deploy", 1),
            ],
        );
        let picked = selector(registry)
            .select(
                "parse the source files",
                &role,
                SelectionContext::default(),
            )
            .unwrap();
        assert_eq!(picked.id, "parse");
    }

    #[test]
    fn test_unauthorized_skill_never_selected() {
        let (registry, role) = setup(
            vec![
                skill("parse", "parse source files"),
                skill("deploy", "deploy artifacts"),
            ],
            vec![SkillRequirement::new("deploy", 1)],
        );
        let ranked = selector(registry).rank(
            "parse the source files",
            &role,
            SelectionContext::default(),
            5,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0.id, "deploy");
    }

    #[test]
    fn test_no_skill_available_when_all_gated() {
        let (registry, role) = setup(vec![skill("parse", "parse files")], vec![]);
        let err = selector(registry)
            .select("anything", &role, SelectionContext::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::NoSkillAvailable { .. }));
    }

    #[test]
    fn test_forbidden_capability_gates_score_to_zero() {
        let mut risky = skill("deploy", "deploy artifacts");
        risky.execution_capabilities = vec!["write_prod".into()];
        let (registry, mut role) = setup(vec![risky], vec![SkillRequirement::new("deploy", 1)]);
        role.constraints.forbidden_actions = vec!["write_prod".into()];

        let ranked = selector(registry).rank("deploy", &role, SelectionContext::default(), 5);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_history_breaks_affinity_ties() {
        let (registry, role) = setup(
            vec![skill("a", "build things"), skill("b", "build things")],
            vec![SkillRequirement::new("a", 1), SkillRequirement::new("b", 1)],
        );
        let tracker = Arc::new(RwLock::new(ExecutionTracker::new()));
        let now = Utc::now();
        tracker.write().record(SkillExecution {
            id: Uuid::new_v4(),
            skill_id: "b".into(),
            stage_id: None,
            task_id: None,
            role_id: None,
            started_at: now,
            ended_at: now,
            status: ExecutionStatus::Success,
            error_kind: None,
            error: None,
            score: Some(1.0),
            input_digest: digest(&serde_json::json!({})),
            output_digest: None,
            output: None,
        });

        let selector = SkillSelector::new(registry, tracker);
        let picked = selector
            .select("build things", &role, SelectionContext::default())
            .unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn test_ties_break_by_lexicographic_id() {
        let (registry, role) = setup(
            vec![skill("beta", "build things"), skill("alpha", "build things")],
            vec![
                SkillRequirement::new("alpha", 1),
                SkillRequirement::new("beta", 1),
            ],
        );
        let picked = selector(registry)
            .select("build things", &role, SelectionContext::default())
            .unwrap();
        assert_eq!(picked.id, "alpha");
    }

    #[test]
    fn test_mode_fit_boost() {
        let mut analysis = skill("inspect", "look at code");
        analysis.metadata.execution_mode = Some("analysis".into());
        let plain = skill("look", "look at code");
        let (registry, role) = setup(
            vec![analysis, plain],
            vec![
                SkillRequirement::new("inspect", 1),
                SkillRequirement::new("look", 1),
            ],
        );
        let picked = selector(registry)
            .select(
                "look at code",
                &role,
                SelectionContext {
                    execution_mode: Some("analysis"),
                },
            )
            .unwrap();
        assert_eq!(picked.id, "inspect");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let (registry, role) = setup(
            vec![skill("a", "alpha work"), skill("b", "alpha work")],
            vec![SkillRequirement::new("a", 1), SkillRequirement::new("b", 1)],
        );
        let sel = selector(registry);
        let first = sel
            .select("alpha work", &role, SelectionContext::default())
            .unwrap();
        for _ in 0..10 {
            let again = sel
                .select("alpha work", &role, SelectionContext::default())
                .unwrap();
            assert_eq!(first.id, again.id);
        }
    }
}
