//! Append-only log of skill executions.
//!
//! The tracker is the sole source of historical scoring for the selector and
//! of digest-based reuse for the orchestrator. Failures never remove prior
//! successes; timeouts count as failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Scoring half-life: the most recent `HALF_LIFE` executions carry as much
/// weight as everything older within the window.
const HALF_LIFE: f64 = 10.0;
/// Scoring window: executions beyond the last `WINDOW` are ignored.
const WINDOW: usize = 100;

/// Outcome of a single skill execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
    Skipped,
}

/// A recorded skill execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillExecution {
    pub id: Uuid,
    pub skill_id: String,
    #[serde(default)]
    pub stage_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error: Option<String>,
    /// Quality score in [0, 1], present on successes.
    #[serde(default)]
    pub score: Option<f64>,
    pub input_digest: String,
    #[serde(default)]
    pub output_digest: Option<String>,
    /// Retained output, used to reuse deterministic executions without
    /// re-invoking the backend.
    #[serde(default)]
    pub output: Option<Value>,
}

impl SkillExecution {
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

/// Aggregate statistics for one skill.
#[derive(Debug, Clone, Serialize)]
pub struct SkillStats {
    pub skill_id: String,
    pub executions: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// Append-only ordered execution log.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ExecutionTracker {
    log: Vec<SkillExecution>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a tracker from a previously exported log.
    pub fn from_log(log: Vec<SkillExecution>) -> Self {
        Self { log }
    }

    pub fn record(&mut self, execution: SkillExecution) {
        self.log.push(execution);
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn history_for_skill(&self, skill_id: &str) -> Vec<&SkillExecution> {
        self.log.iter().filter(|e| e.skill_id == skill_id).collect()
    }

    pub fn recent(&self, n: usize) -> &[SkillExecution] {
        let start = self.log.len().saturating_sub(n);
        &self.log[start..]
    }

    pub fn log(&self) -> &[SkillExecution] {
        &self.log
    }

    pub fn into_log(self) -> Vec<SkillExecution> {
        self.log
    }

    /// Exponentially-weighted success rate for a skill over its last
    /// [`WINDOW`] executions, half-life [`HALF_LIFE`]. Unseen skills score a
    /// neutral 0.5. Skipped executions do not participate.
    pub fn score_of(&self, skill_id: &str) -> f64 {
        let mut weight_sum = 0.0;
        let mut score_sum = 0.0;
        let mut rank = 0usize;

        for execution in self.log.iter().rev() {
            if execution.skill_id != skill_id || execution.status == ExecutionStatus::Skipped {
                continue;
            }
            if rank >= WINDOW {
                break;
            }
            let weight = 0.5_f64.powf(rank as f64 / HALF_LIFE);
            let outcome = match execution.status {
                ExecutionStatus::Success => execution.score.unwrap_or(1.0),
                // Failures and timeouts both count as zero.
                _ => 0.0,
            };
            weight_sum += weight;
            score_sum += weight * outcome;
            rank += 1;
        }

        if weight_sum == 0.0 {
            0.5
        } else {
            score_sum / weight_sum
        }
    }

    /// Find a prior successful execution of `skill_id` within `stage_id`
    /// whose input digest matches, for deterministic-skill reuse.
    pub fn find_reusable(
        &self,
        skill_id: &str,
        stage_id: Option<&str>,
        input_digest: &str,
    ) -> Option<&SkillExecution> {
        self.log.iter().rev().find(|e| {
            e.status == ExecutionStatus::Success
                && e.skill_id == skill_id
                && e.input_digest == input_digest
                && e.stage_id.as_deref() == stage_id
                && e.output.is_some()
        })
    }

    /// Per-skill and overall aggregates.
    pub fn statistics(&self) -> Vec<SkillStats> {
        let mut ids: Vec<&str> = self.log.iter().map(|e| e.skill_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();

        ids.into_iter()
            .map(|skill_id| {
                let history = self.history_for_skill(skill_id);
                let successes = history
                    .iter()
                    .filter(|e| e.status == ExecutionStatus::Success)
                    .count();
                let total_ms: i64 = history.iter().map(|e| e.duration_ms()).sum();
                SkillStats {
                    skill_id: skill_id.to_string(),
                    executions: history.len(),
                    success_rate: successes as f64 / history.len() as f64,
                    avg_duration_ms: total_ms as f64 / history.len() as f64,
                }
            })
            .collect()
    }

    /// Serialize the full trace for inspection.
    pub fn export_trace(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.log)
    }
}

/// Content digest of a JSON value with object keys sorted recursively, so
/// logically equal inputs always hash identically.
pub fn digest(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> =
                    map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }

    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution(skill_id: &str, status: ExecutionStatus) -> SkillExecution {
        let now = Utc::now();
        SkillExecution {
            id: Uuid::new_v4(),
            skill_id: skill_id.to_string(),
            stage_id: Some("stg".into()),
            task_id: None,
            role_id: Some("dev".into()),
            started_at: now,
            ended_at: now,
            status,
            error_kind: None,
            error: None,
            score: (status == ExecutionStatus::Success).then_some(1.0),
            input_digest: digest(&json!({"task": "x"})),
            output_digest: Some(digest(&json!({"result": "ok"}))),
            output: Some(json!({"result": "ok"})),
        }
    }

    #[test]
    fn test_unseen_skill_scores_neutral() {
        let tracker = ExecutionTracker::new();
        assert_eq!(tracker.score_of("ghost"), 0.5);
    }

    #[test]
    fn test_score_weighs_recent_outcomes_higher() {
        let mut tracker = ExecutionTracker::new();
        // Old success followed by a recent failure: score should sit below
        // the plain average because the failure is fresher.
        tracker.record(execution("s1", ExecutionStatus::Success));
        tracker.record(execution("s1", ExecutionStatus::Failure));
        let score = tracker.score_of("s1");
        assert!(score < 0.5, "recent failure should dominate, got {score}");

        // And the other way around.
        let mut tracker = ExecutionTracker::new();
        tracker.record(execution("s2", ExecutionStatus::Failure));
        tracker.record(execution("s2", ExecutionStatus::Success));
        assert!(tracker.score_of("s2") > 0.5);
    }

    #[test]
    fn test_timeouts_count_as_failures() {
        let mut tracker = ExecutionTracker::new();
        tracker.record(execution("s1", ExecutionStatus::Timeout));
        assert_eq!(tracker.score_of("s1"), 0.0);
    }

    #[test]
    fn test_skipped_does_not_participate() {
        let mut tracker = ExecutionTracker::new();
        tracker.record(execution("s1", ExecutionStatus::Skipped));
        assert_eq!(tracker.score_of("s1"), 0.5);
    }

    #[test]
    fn test_find_reusable_matches_digest_and_stage() {
        let mut tracker = ExecutionTracker::new();
        let exec = execution("s1", ExecutionStatus::Success);
        let wanted = exec.input_digest.clone();
        tracker.record(exec);

        assert!(tracker.find_reusable("s1", Some("stg"), &wanted).is_some());
        assert!(tracker.find_reusable("s1", Some("other"), &wanted).is_none());
        assert!(tracker.find_reusable("s1", Some("stg"), "nope").is_none());
    }

    #[test]
    fn test_digest_is_key_order_independent() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(digest(&a), digest(&b));
        assert_ne!(digest(&a), digest(&json!({"a": 1})));
    }

    #[test]
    fn test_statistics() {
        let mut tracker = ExecutionTracker::new();
        tracker.record(execution("s1", ExecutionStatus::Success));
        tracker.record(execution("s1", ExecutionStatus::Failure));
        tracker.record(execution("s2", ExecutionStatus::Success));

        let stats = tracker.statistics();
        assert_eq!(stats.len(), 2);
        let s1 = stats.iter().find(|s| s.skill_id == "s1").unwrap();
        assert_eq!(s1.executions, 2);
        assert!((s1.success_rate - 0.5).abs() < f64::EPSILON);
    }
}
