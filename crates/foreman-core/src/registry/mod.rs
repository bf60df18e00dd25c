//! Validated in-memory store of roles, skills, bundles and the workflow.
//!
//! The registry consumes already-parsed structures from a config provider
//! (the on-disk YAML/Markdown form lives outside this crate). Validation is
//! total: a partially valid configuration is rejected, so every downstream
//! component may assume all references resolve and all graphs are acyclic.

pub mod role;
pub mod skill;
pub mod workflow;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::debug;

use crate::error::ConfigError;

pub use role::{Role, RoleConstraints};
pub use skill::{
    InvokerKind, McpAction, McpConfig, Skill, SkillBundle, SkillMetadata, SkillRequirement,
    SkillType,
};
pub use workflow::{ArtifactSpec, GateKind, QualityGate, Stage, Workflow};

/// Parsed configuration handed to [`Registry::load`].
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub skills: Vec<Skill>,
    pub bundles: Vec<SkillBundle>,
    pub roles: Vec<Role>,
    pub workflow: Option<Workflow>,
    /// Predicate ids registered with the gate evaluator; gates referencing
    /// anything else are rejected at load, never a runtime surprise.
    pub registered_predicates: BTreeSet<String>,
}

/// The validated, immutable registry.
#[derive(Debug, Clone)]
pub struct Registry {
    skills: HashMap<String, Skill>,
    roles: HashMap<String, Role>,
    workflow: Workflow,
}

impl Registry {
    /// Load and validate a configuration. Errors are fatal at startup.
    pub fn load(config: RegistryConfig) -> Result<Self, ConfigError> {
        let mut skills: HashMap<String, Skill> = HashMap::new();
        for skill in config.skills {
            check_levels(&skill)?;
            if skills.contains_key(&skill.id) {
                return Err(ConfigError::DuplicateId {
                    kind: "skill",
                    id: skill.id,
                });
            }
            skills.insert(skill.id.clone(), skill);
        }

        let mut bundles: HashMap<String, SkillBundle> = HashMap::new();
        for bundle in config.bundles {
            if skills.contains_key(&bundle.id) {
                return Err(ConfigError::DuplicateId {
                    kind: "bundle",
                    id: bundle.id,
                });
            }
            let id = bundle.id.clone();
            if bundles.insert(id.clone(), bundle).is_some() {
                return Err(ConfigError::DuplicateId { kind: "bundle", id });
            }
        }

        // Resolve roles: extends composition first, then bundle expansion.
        let raw_roles: HashMap<String, Role> = {
            let mut map = HashMap::new();
            for role in config.roles {
                let id = role.id.clone();
                if map.insert(id.clone(), role).is_some() {
                    return Err(ConfigError::DuplicateId { kind: "role", id });
                }
            }
            map
        };

        let mut roles: HashMap<String, Role> = HashMap::new();
        for id in raw_roles.keys() {
            let mut visiting = Vec::new();
            let requirements = resolve_role(id, &raw_roles, &mut visiting)?;
            let expanded = expand_requirements(&requirements, &bundles, &skills, id)?;
            let mut role = raw_roles[id].clone();
            role.required_skills = expanded;
            check_constraints(&role)?;
            roles.insert(id.clone(), role);
        }

        let workflow = config.workflow.unwrap_or(Workflow {
            id: "empty".to_string(),
            name: "Empty workflow".to_string(),
            description: String::new(),
            stages: Vec::new(),
        });
        let workflow = validate_workflow(
            workflow,
            &skills,
            &bundles,
            &roles,
            &config.registered_predicates,
        )?;

        debug!(
            skills = skills.len(),
            roles = roles.len(),
            stages = workflow.stages.len(),
            "registry loaded"
        );

        Ok(Self {
            skills,
            roles,
            workflow,
        })
    }

    pub fn get_skill(&self, skill_id: &str) -> Option<&Skill> {
        self.skills.get(skill_id)
    }

    pub fn get_role(&self, role_id: &str) -> Option<&Role> {
        self.roles.get(role_id)
    }

    /// The role's required skills with bundle expansion applied and
    /// `min_level` preserved as the max across duplicates.
    pub fn skills_for_role(&self, role_id: &str) -> &[SkillRequirement] {
        self.roles
            .get(role_id)
            .map(|r| r.required_skills.as_slice())
            .unwrap_or(&[])
    }

    /// Minimum level at which `role_id` requires `skill_id`, if authorized.
    pub fn authorized_level(&self, role_id: &str, skill_id: &str) -> Option<u8> {
        self.skills_for_role(role_id)
            .iter()
            .find(|r| r.skill_id == skill_id)
            .map(|r| r.min_level)
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    pub fn skills(&self) -> impl Iterator<Item = &Skill> {
        self.skills.values()
    }
}

fn check_levels(skill: &Skill) -> Result<(), ConfigError> {
    for level in skill.levels.keys() {
        if !(1..=3).contains(level) {
            return Err(ConfigError::LevelOutOfRange {
                level: *level,
                location: format!("skill '{}'", skill.id),
            });
        }
    }
    Ok(())
}

fn check_requirement_level(req: &SkillRequirement, location: &str) -> Result<(), ConfigError> {
    if !(1..=3).contains(&req.min_level) {
        return Err(ConfigError::LevelOutOfRange {
            level: req.min_level,
            location: location.to_string(),
        });
    }
    Ok(())
}

fn check_constraints(role: &Role) -> Result<(), ConfigError> {
    let allowed: HashSet<&String> = role.constraints.allowed_actions.iter().collect();
    let overlap: Vec<String> = role
        .constraints
        .forbidden_actions
        .iter()
        .filter(|a| allowed.contains(a))
        .cloned()
        .collect();
    if !overlap.is_empty() {
        return Err(ConfigError::ForbiddenAllowedOverlap {
            role_id: role.id.clone(),
            actions: overlap,
        });
    }
    Ok(())
}

/// Flatten a role's `extends` chain into the union of requirements.
fn resolve_role(
    role_id: &str,
    roles: &HashMap<String, Role>,
    visiting: &mut Vec<String>,
) -> Result<Vec<SkillRequirement>, ConfigError> {
    if visiting.iter().any(|v| v == role_id) {
        let mut cycle = visiting.clone();
        cycle.push(role_id.to_string());
        return Err(ConfigError::RoleCycle(cycle));
    }
    let role = roles.get(role_id).ok_or_else(|| ConfigError::MissingRef {
        kind: "role",
        id: role_id.to_string(),
        referenced_by: visiting.last().cloned().unwrap_or_default(),
    })?;

    visiting.push(role_id.to_string());
    let mut requirements = Vec::new();
    for parent in &role.extends {
        requirements.extend(resolve_role(parent, roles, visiting)?);
    }
    requirements.extend(role.required_skills.iter().cloned());
    visiting.pop();
    Ok(requirements)
}

/// Expand bundle references transitively and merge duplicate skill ids,
/// keeping the max `min_level` and the union of focus tags.
fn expand_requirements(
    requirements: &[SkillRequirement],
    bundles: &HashMap<String, SkillBundle>,
    skills: &HashMap<String, Skill>,
    referenced_by: &str,
) -> Result<Vec<SkillRequirement>, ConfigError> {
    let mut merged: BTreeMap<String, SkillRequirement> = BTreeMap::new();

    fn walk(
        req: &SkillRequirement,
        bundles: &HashMap<String, SkillBundle>,
        skills: &HashMap<String, Skill>,
        referenced_by: &str,
        visiting: &mut Vec<String>,
        merged: &mut BTreeMap<String, SkillRequirement>,
    ) -> Result<(), ConfigError> {
        check_requirement_level(req, referenced_by)?;
        if let Some(bundle) = bundles.get(&req.skill_id) {
            if visiting.iter().any(|v| v == &bundle.id) {
                let mut cycle = visiting.clone();
                cycle.push(bundle.id.clone());
                return Err(ConfigError::BundleCycle(cycle));
            }
            visiting.push(bundle.id.clone());
            for nested in &bundle.requirements {
                // A bundle referenced at level N lifts its members to at
                // least that level.
                let lifted = SkillRequirement {
                    skill_id: nested.skill_id.clone(),
                    min_level: nested.min_level.max(req.min_level),
                    focus: nested.focus.clone(),
                };
                walk(&lifted, bundles, skills, referenced_by, visiting, merged)?;
            }
            visiting.pop();
            return Ok(());
        }

        if !skills.contains_key(&req.skill_id) {
            return Err(ConfigError::MissingRef {
                kind: "skill",
                id: req.skill_id.clone(),
                referenced_by: referenced_by.to_string(),
            });
        }

        merged
            .entry(req.skill_id.clone())
            .and_modify(|existing| {
                existing.min_level = existing.min_level.max(req.min_level);
                for tag in &req.focus {
                    if !existing.focus.contains(tag) {
                        existing.focus.push(tag.clone());
                    }
                }
            })
            .or_insert_with(|| req.clone());
        Ok(())
    }

    let mut visiting = Vec::new();
    for req in requirements {
        walk(
            req,
            bundles,
            skills,
            referenced_by,
            &mut visiting,
            &mut merged,
        )?;
    }
    Ok(merged.into_values().collect())
}

fn validate_workflow(
    mut workflow: Workflow,
    skills: &HashMap<String, Skill>,
    bundles: &HashMap<String, SkillBundle>,
    roles: &HashMap<String, Role>,
    registered_predicates: &BTreeSet<String>,
) -> Result<Workflow, ConfigError> {
    let mut stage_ids = HashSet::new();
    for stage in &workflow.stages {
        if !stage_ids.insert(stage.id.clone()) {
            return Err(ConfigError::DuplicateId {
                kind: "stage",
                id: stage.id.clone(),
            });
        }
    }

    for stage in &mut workflow.stages {
        if let Some(role_id) = &stage.role_id {
            if !roles.contains_key(role_id) {
                return Err(ConfigError::MissingRef {
                    kind: "role",
                    id: role_id.clone(),
                    referenced_by: format!("stage '{}'", stage.id),
                });
            }
        }
        stage.required_skills = expand_requirements(
            &stage.required_skills,
            bundles,
            skills,
            &format!("stage '{}'", stage.id),
        )?;

        // A stage declaring a skill its assigned role does not authorize is a
        // configuration error, caught here rather than at execution time.
        if let Some(role_id) = &stage.role_id {
            let role = &roles[role_id];
            for req in &stage.required_skills {
                if !role
                    .required_skills
                    .iter()
                    .any(|r| r.skill_id == req.skill_id)
                {
                    return Err(ConfigError::UnauthorizedStageSkill {
                        stage_id: stage.id.clone(),
                        skill_id: req.skill_id.clone(),
                        role_id: role_id.clone(),
                    });
                }
            }
        }

        for gate in &stage.quality_gates {
            if let GateKind::CustomPredicate { predicate } = &gate.kind {
                if !registered_predicates.contains(predicate) {
                    return Err(ConfigError::UnknownPredicate {
                        gate_id: gate.id.clone(),
                        predicate: predicate.clone(),
                    });
                }
            }
        }
    }

    // Dependency edges must resolve and form a DAG.
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = HashMap::new();
    for stage in &workflow.stages {
        nodes.insert(stage.id.as_str(), graph.add_node(stage.id.as_str()));
    }
    for stage in &workflow.stages {
        for dep in &stage.depends_on {
            let dep_node = nodes.get(dep.as_str()).ok_or_else(|| ConfigError::MissingRef {
                kind: "stage",
                id: dep.clone(),
                referenced_by: format!("stage '{}'", stage.id),
            })?;
            graph.add_edge(*dep_node, nodes[stage.id.as_str()], ());
        }
    }
    if let Err(cycle) = toposort(&graph, None) {
        return Err(ConfigError::WorkflowCycle(vec![graph[cycle.node_id()]
            .to_string()]));
    }

    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(id: &str) -> Skill {
        Skill::new(id, id.to_uppercase())
    }

    fn base_config() -> RegistryConfig {
        let mut role = Role::new("dev", "Developer");
        role.required_skills = vec![SkillRequirement::new("coding", 1)];
        RegistryConfig {
            skills: vec![skill("coding"), skill("review")],
            bundles: vec![],
            roles: vec![role],
            workflow: None,
            registered_predicates: BTreeSet::new(),
        }
    }

    #[test]
    fn test_load_minimal() {
        let registry = Registry::load(base_config()).unwrap();
        assert!(registry.get_skill("coding").is_some());
        assert_eq!(registry.skills_for_role("dev").len(), 1);
        assert_eq!(registry.authorized_level("dev", "coding"), Some(1));
        assert_eq!(registry.authorized_level("dev", "review"), None);
    }

    #[test]
    fn test_missing_skill_ref_rejected() {
        let mut config = base_config();
        config.roles[0]
            .required_skills
            .push(SkillRequirement::new("ghost", 1));
        let err = Registry::load(config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRef { kind: "skill", .. }));
    }

    #[test]
    fn test_bundle_expansion_merges_max_level() {
        let mut config = base_config();
        config.bundles = vec![SkillBundle {
            id: "fullstack".into(),
            requirements: vec![
                SkillRequirement::new("coding", 2),
                SkillRequirement::new("review", 1),
            ],
        }];
        config.roles[0].required_skills = vec![
            SkillRequirement::new("coding", 3),
            SkillRequirement::new("fullstack", 1),
        ];
        let registry = Registry::load(config).unwrap();
        let reqs = registry.skills_for_role("dev");
        assert_eq!(reqs.len(), 2);
        assert_eq!(registry.authorized_level("dev", "coding"), Some(3));
        assert_eq!(registry.authorized_level("dev", "review"), Some(1));
    }

    #[test]
    fn test_bundle_cycle_rejected() {
        let mut config = base_config();
        config.bundles = vec![
            SkillBundle {
                id: "a".into(),
                requirements: vec![SkillRequirement::new("b", 1)],
            },
            SkillBundle {
                id: "b".into(),
                requirements: vec![SkillRequirement::new("a", 1)],
            },
        ];
        config.roles[0].required_skills = vec![SkillRequirement::new("a", 1)];
        let err = Registry::load(config).unwrap_err();
        assert!(matches!(err, ConfigError::BundleCycle(_)));
    }

    #[test]
    fn test_extends_union() {
        let mut config = base_config();
        let mut senior = Role::new("senior", "Senior Developer");
        senior.extends = vec!["dev".into()];
        senior.required_skills = vec![SkillRequirement::new("review", 2)];
        config.roles.push(senior);
        let registry = Registry::load(config).unwrap();
        assert_eq!(registry.skills_for_role("senior").len(), 2);
    }

    #[test]
    fn test_overlapping_actions_rejected() {
        let mut config = base_config();
        config.roles[0].constraints.allowed_actions = vec!["deploy".into()];
        config.roles[0].constraints.forbidden_actions = vec!["deploy".into()];
        let err = Registry::load(config).unwrap_err();
        assert!(matches!(err, ConfigError::ForbiddenAllowedOverlap { .. }));
    }

    #[test]
    fn test_level_out_of_range_rejected() {
        let mut config = base_config();
        config.roles[0].required_skills = vec![SkillRequirement::new("coding", 4)];
        let err = Registry::load(config).unwrap_err();
        assert!(matches!(err, ConfigError::LevelOutOfRange { level: 4, .. }));
    }

    #[test]
    fn test_workflow_cycle_rejected() {
        let mut config = base_config();
        let mut a = Stage::new("a", "A");
        a.depends_on = vec!["b".into()];
        let mut b = Stage::new("b", "B");
        b.depends_on = vec!["a".into()];
        config.workflow = Some(Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![a, b],
        });
        let err = Registry::load(config).unwrap_err();
        assert!(matches!(err, ConfigError::WorkflowCycle(_)));
    }

    #[test]
    fn test_unauthorized_stage_skill_rejected() {
        let mut config = base_config();
        let mut stage = Stage::new("build", "Build");
        stage.role_id = Some("dev".into());
        stage.required_skills = vec![SkillRequirement::new("review", 1)];
        config.workflow = Some(Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![stage],
        });
        let err = Registry::load(config).unwrap_err();
        assert!(matches!(err, ConfigError::UnauthorizedStageSkill { .. }));
    }

    #[test]
    fn test_unknown_predicate_rejected() {
        let mut config = base_config();
        let mut stage = Stage::new("build", "Build");
        stage.quality_gates = vec![QualityGate::new(
            "g1",
            GateKind::CustomPredicate {
                predicate: "unregistered".into(),
            },
        )];
        config.workflow = Some(Workflow {
            id: "wf".into(),
            name: "WF".into(),
            description: String::new(),
            stages: vec![stage],
        });
        let err = Registry::load(config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPredicate { .. }));
    }

    #[test]
    fn test_load_is_deterministic() {
        let r1 = Registry::load(base_config()).unwrap();
        let r2 = Registry::load(base_config()).unwrap();
        assert_eq!(
            r1.skills_for_role("dev").to_vec(),
            r2.skills_for_role("dev").to_vec()
        );
    }
}
