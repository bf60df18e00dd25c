//! Agent reasoning layer.
//!
//! An agent is a role in action. It builds its context from project state,
//! the shared-context snapshot and received messages, and emits ordered
//! *intents* — task descriptions it wants achieved. It never invokes a
//! skill: selection and invocation belong to the orchestrator, and this type
//! deliberately holds no invoker handle so the layering cannot be violated
//! by accident.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::bus::{AgentMessage, MessageBus, MessageKind, Recipient};
use crate::error::{EngineError, Result};
use crate::registry::{Role, Stage};

/// A single unit of desire: what the agent wants done, in emission order.
#[derive(Debug, Clone)]
pub struct Intent {
    pub description: String,
    /// The output artifact this intent aims to produce, when known.
    pub artifact: Option<String>,
}

/// Working state an agent accumulates while its stage or task executes.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: String,
    pub role_id: String,
    pub goal: String,
    pub project_context: Value,
    /// Copy-on-read snapshot of the bus shared context at prepare time.
    pub shared_context: HashMap<String, Value>,
    /// Messages visible at prepare time (peeked, not drained).
    pub inbox: Vec<AgentMessage>,
    /// Artifact name → produced value.
    pub outputs: HashMap<String, Value>,
    /// Ids of skill executions performed on this agent's behalf.
    pub history: Vec<Uuid>,
    /// Notes about failed intents.
    pub errors: Vec<String>,
}

/// Result of reviewing another agent's artifact.
#[derive(Debug, Clone)]
pub struct Review {
    pub approved: bool,
    pub comments: Vec<String>,
    pub suggested_revisions: Vec<String>,
}

pub struct Agent {
    pub id: String,
    role: Role,
    bus: MessageBus,
    pub context: AgentContext,
}

impl Agent {
    pub fn new(role: Role, bus: MessageBus) -> Self {
        let id = format!("{}-{}", role.id, &Uuid::new_v4().simple().to_string()[..8]);
        bus.register_agent(id.clone());
        let context = AgentContext {
            agent_id: id.clone(),
            role_id: role.id.clone(),
            goal: String::new(),
            project_context: Value::Null,
            shared_context: HashMap::new(),
            inbox: Vec::new(),
            outputs: HashMap::new(),
            history: Vec::new(),
            errors: Vec::new(),
        };
        Self {
            id,
            role,
            bus,
            context,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Build the agent context and produce ordered intents for the goal.
    ///
    /// With a stage brief, one intent is emitted per declared output
    /// artifact (or a single stage-level intent when the contract declares
    /// none). Without a brief the goal itself becomes the only intent, and
    /// an empty goal is insufficient context.
    pub fn prepare(
        &mut self,
        goal: &str,
        stage: Option<&Stage>,
        project_context: Value,
    ) -> Result<Vec<Intent>> {
        self.context.goal = goal.to_string();
        self.context.project_context = project_context;
        self.context.shared_context = self.bus.context_snapshot();
        self.context.inbox = self.bus.peek(&self.id);

        let intents = match stage {
            Some(stage) => {
                let base = if goal.is_empty() {
                    stage.name.clone()
                } else {
                    goal.to_string()
                };
                if stage.outputs.is_empty() {
                    vec![Intent {
                        description: format!("{} ({})", base, stage.name),
                        artifact: None,
                    }]
                } else {
                    stage
                        .outputs
                        .iter()
                        .map(|artifact| Intent {
                            description: format!("{}: produce {}", base, artifact.name),
                            artifact: Some(artifact.name.clone()),
                        })
                        .collect()
                }
            }
            None => {
                if goal.is_empty() {
                    return Err(EngineError::InsufficientContext {
                        agent_id: self.id.clone(),
                        reason: "empty goal and no stage brief".to_string(),
                    });
                }
                vec![Intent {
                    description: goal.to_string(),
                    artifact: None,
                }]
            }
        };

        debug!(agent = %self.id, intents = intents.len(), "agent prepared");
        Ok(intents)
    }

    /// Restate an intent more broadly after the selector came up empty.
    /// Falls back to the role's own vocabulary so any authorized skill can
    /// match on the retry.
    pub fn broaden(&self, intent: &Intent, stage: Option<&Stage>) -> String {
        let mut parts = vec![intent.description.clone()];
        if let Some(stage) = stage {
            parts.push(stage.name.clone());
        }
        parts.push(self.role.name.clone());
        parts.push(self.role.description.clone());
        parts.join(" ")
    }

    /// Reasoning over another agent's artifact.
    pub fn review_output(&self, from_agent: &str, output: &Value) -> Review {
        let mut comments = Vec::new();
        let mut suggested_revisions = Vec::new();

        let text = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        if text.is_empty() || output.is_null() {
            comments.push(format!("output from {from_agent} is empty"));
        }
        for marker in ["TODO", "FIXME", "XXX"] {
            if text.contains(marker) {
                comments.push(format!("contains unresolved {marker} marker"));
                suggested_revisions.push(format!("resolve {marker} items before handoff"));
            }
        }
        if text.len() > 10_000 {
            suggested_revisions.push("output is very large, consider splitting".to_string());
        }

        Review {
            approved: comments.is_empty(),
            comments,
            suggested_revisions,
        }
    }

    /// Ask another agent (or everyone) to look at an artifact.
    pub fn request_feedback(&self, target: Option<&str>, artifact: &Value) -> Uuid {
        let payload = json!({
            "requesting_role": self.role.id,
            "artifact": artifact,
        });
        match target {
            Some(agent_id) => self.bus.send(
                &self.id,
                Recipient::Agent(agent_id.to_string()),
                MessageKind::Request,
                payload,
            ),
            None => self.bus.broadcast(&self.id, MessageKind::Request, payload),
        }
    }

    pub fn send_message(&self, to: &str, kind: MessageKind, payload: Value) -> Uuid {
        self.bus
            .send(&self.id, Recipient::Agent(to.to_string()), kind, payload)
    }

    /// Read waiting messages without removing them.
    pub fn check_messages(&self) -> Vec<AgentMessage> {
        self.bus.peek(&self.id)
    }

    /// Drain waiting messages.
    pub fn get_messages(&self) -> Vec<AgentMessage> {
        self.bus.subscribe(&self.id)
    }

    /// Publish a key into the shared context, then announce it.
    pub fn share_context(&self, key: &str, value: Value) {
        self.bus.share_context(&self.id, key, value.clone());
        self.bus.broadcast(
            &self.id,
            MessageKind::ContextShare,
            json!({ "key": key, "value": value }),
        );
    }
}
