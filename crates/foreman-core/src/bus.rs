//! In-process message bus and shared context for agent collaboration.
//!
//! Per-agent FIFO mailboxes, broadcast delivery, and a shared-context map
//! with last-writer-wins resolution. The bus is a coordination primitive,
//! not a reliable queue: messages for an agent that never drains its mailbox
//! simply accumulate until explicit cleanup.
//!
//! Ordering guarantee: messages from one sender to one recipient arrive in
//! send order. There is no global order across senders.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::events::{EngineEvent, EventEmitter};

/// Message target: a single agent or everyone but the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

/// What a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    ContextShare,
}

/// A message exchanged between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    pub from_agent: String,
    pub to: Recipient,
    pub kind: MessageKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl AgentMessage {
    pub fn new(
        from_agent: impl Into<String>,
        to: Recipient,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_agent: from_agent.into(),
            to,
            kind,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn replying_to(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// A shared-context value with its write stamp.
///
/// The stamp is a process-wide monotonic counter rather than a wall-clock
/// time, so two writes in the same millisecond still resolve unambiguously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedEntry {
    pub value: Value,
    pub owner: String,
    pub stamp: u64,
    pub written_at: DateTime<Utc>,
}

/// One record in the durable journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEntry {
    Message { message: AgentMessage },
    ContextWrite { key: String, entry: SharedEntry },
}

#[derive(Debug, Default)]
struct BusInner {
    mailboxes: Mutex<HashMap<String, VecDeque<AgentMessage>>>,
    shared: Mutex<HashMap<String, SharedEntry>>,
    journal: Mutex<Vec<JournalEntry>>,
    journal_enabled: bool,
    stamp: AtomicU64,
    emitter: Mutex<Option<EventEmitter>>,
}

/// Cloneable handle to the bus. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that records every publish and context write in a journal,
    /// replayable on recovery.
    pub fn with_journal() -> Self {
        Self {
            inner: Arc::new(BusInner {
                journal_enabled: true,
                ..Default::default()
            }),
        }
    }

    /// Mirror publishes onto the engine event stream as `agent.message`.
    pub fn set_emitter(&self, emitter: EventEmitter) {
        *self.inner.emitter.lock() = Some(emitter);
    }

    /// Create a mailbox for an agent so broadcasts reach it.
    pub fn register_agent(&self, agent_id: impl Into<String>) {
        self.inner
            .mailboxes
            .lock()
            .entry(agent_id.into())
            .or_default();
    }

    /// Drop an agent's mailbox, discarding anything undelivered.
    pub fn remove_agent(&self, agent_id: &str) {
        self.inner.mailboxes.lock().remove(agent_id);
    }

    pub fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.mailboxes.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Append a message to its target mailbox(es). Broadcasts go to every
    /// known agent except the sender.
    pub fn publish(&self, message: AgentMessage) -> Uuid {
        let id = message.id;
        trace!(from = %message.from_agent, to = ?message.to, kind = ?message.kind, "bus publish");
        if let Some(emitter) = self.inner.emitter.lock().as_ref() {
            emitter.emit(EngineEvent::AgentMessage {
                from_agent: message.from_agent.clone(),
                to: match &message.to {
                    Recipient::Agent(agent_id) => agent_id.clone(),
                    Recipient::Broadcast => "broadcast".to_string(),
                },
                kind: message.kind,
            });
        }
        {
            let mut mailboxes = self.inner.mailboxes.lock();
            match &message.to {
                Recipient::Agent(agent_id) => {
                    mailboxes
                        .entry(agent_id.clone())
                        .or_default()
                        .push_back(message.clone());
                }
                Recipient::Broadcast => {
                    for (agent_id, mailbox) in mailboxes.iter_mut() {
                        if agent_id != &message.from_agent {
                            mailbox.push_back(message.clone());
                        }
                    }
                }
            }
        }
        if self.inner.journal_enabled {
            self.inner
                .journal
                .lock()
                .push(JournalEntry::Message { message });
        }
        id
    }

    /// Convenience constructor + publish.
    pub fn send(
        &self,
        from_agent: impl Into<String>,
        to: Recipient,
        kind: MessageKind,
        payload: Value,
    ) -> Uuid {
        self.publish(AgentMessage::new(from_agent, to, kind, payload))
    }

    pub fn broadcast(&self, from_agent: impl Into<String>, kind: MessageKind, payload: Value) -> Uuid {
        self.send(from_agent, Recipient::Broadcast, kind, payload)
    }

    /// Drain and return an agent's mailbox.
    pub fn subscribe(&self, agent_id: &str) -> Vec<AgentMessage> {
        self.inner
            .mailboxes
            .lock()
            .get_mut(agent_id)
            .map(|mailbox| mailbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// Read an agent's mailbox without removing anything.
    pub fn peek(&self, agent_id: &str) -> Vec<AgentMessage> {
        self.inner
            .mailboxes
            .lock()
            .get(agent_id)
            .map(|mailbox| mailbox.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self, agent_id: &str) -> usize {
        self.inner
            .mailboxes
            .lock()
            .get(agent_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Write a key into the shared context. Keys are globally visible;
    /// conflicting writes resolve last-writer-wins by monotonic stamp.
    pub fn share_context(&self, from_agent: impl Into<String>, key: impl Into<String>, value: Value) {
        let entry = SharedEntry {
            value,
            owner: from_agent.into(),
            stamp: self.inner.stamp.fetch_add(1, Ordering::Relaxed),
            written_at: Utc::now(),
        };
        let key = key.into();
        {
            let mut shared = self.inner.shared.lock();
            match shared.get(&key) {
                Some(existing) if existing.stamp > entry.stamp => {}
                _ => {
                    shared.insert(key.clone(), entry.clone());
                }
            }
        }
        if self.inner.journal_enabled {
            self.inner
                .journal
                .lock()
                .push(JournalEntry::ContextWrite { key, entry });
        }
    }

    pub fn get_context(&self, key: &str) -> Option<Value> {
        self.inner.shared.lock().get(key).map(|e| e.value.clone())
    }

    /// A consistent snapshot of the shared context at the moment of read.
    pub fn context_snapshot(&self) -> HashMap<String, Value> {
        self.inner
            .shared
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Full shared entries, for checkpointing.
    pub fn shared_entries(&self) -> HashMap<String, SharedEntry> {
        self.inner.shared.lock().clone()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.inner.journal.lock().clone()
    }

    /// Rebuild mailboxes and shared context from a journal. Existing state
    /// is replaced.
    pub fn replay(&self, journal: Vec<JournalEntry>) {
        {
            let mut mailboxes = self.inner.mailboxes.lock();
            mailboxes.clear();
        }
        {
            let mut shared = self.inner.shared.lock();
            shared.clear();
        }

        let mut max_stamp = 0u64;
        for entry in &journal {
            match entry {
                JournalEntry::Message { message } => {
                    let mut mailboxes = self.inner.mailboxes.lock();
                    match &message.to {
                        Recipient::Agent(agent_id) => {
                            mailboxes
                                .entry(agent_id.clone())
                                .or_default()
                                .push_back(message.clone());
                        }
                        Recipient::Broadcast => {
                            for (agent_id, mailbox) in mailboxes.iter_mut() {
                                if agent_id != &message.from_agent {
                                    mailbox.push_back(message.clone());
                                }
                            }
                        }
                    }
                }
                JournalEntry::ContextWrite { key, entry } => {
                    max_stamp = max_stamp.max(entry.stamp);
                    let mut shared = self.inner.shared.lock();
                    match shared.get(key) {
                        Some(existing) if existing.stamp > entry.stamp => {}
                        _ => {
                            shared.insert(key.clone(), entry.clone());
                        }
                    }
                }
            }
        }
        self.inner.stamp.store(max_stamp + 1, Ordering::Relaxed);
        *self.inner.journal.lock() = journal;
    }

    /// Restore shared entries directly (checkpoint restore path).
    pub fn restore_shared(&self, entries: HashMap<String, SharedEntry>) {
        let max_stamp = entries.values().map(|e| e.stamp).max().unwrap_or(0);
        *self.inner.shared.lock() = entries;
        self.inner.stamp.store(max_stamp + 1, Ordering::Relaxed);
    }

    /// Clear mailboxes and shared context. The journal is kept.
    pub fn reset(&self) {
        self.inner.mailboxes.lock().clear();
        self.inner.shared.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifo_per_sender_recipient_pair() {
        let bus = MessageBus::new();
        bus.register_agent("b");
        for i in 0..5 {
            bus.send(
                "a",
                Recipient::Agent("b".into()),
                MessageKind::Notification,
                json!({ "seq": i }),
            );
        }
        let received = bus.subscribe("b");
        let seqs: Vec<i64> = received
            .iter()
            .map(|m| m.payload["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        // Drained.
        assert!(bus.subscribe("b").is_empty());
    }

    #[test]
    fn test_peek_does_not_drain() {
        let bus = MessageBus::new();
        bus.register_agent("b");
        bus.send(
            "a",
            Recipient::Agent("b".into()),
            MessageKind::Request,
            json!({}),
        );
        assert_eq!(bus.peek("b").len(), 1);
        assert_eq!(bus.peek("b").len(), 1);
        assert_eq!(bus.subscribe("b").len(), 1);
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let bus = MessageBus::new();
        bus.register_agent("a");
        bus.register_agent("b");
        bus.register_agent("c");
        bus.broadcast("a", MessageKind::Notification, json!({"hello": true}));

        assert_eq!(bus.message_count("a"), 0);
        assert_eq!(bus.message_count("b"), 1);
        assert_eq!(bus.message_count("c"), 1);
    }

    #[test]
    fn test_shared_context_last_writer_wins() {
        let bus = MessageBus::with_journal();
        bus.share_context("a", "design", json!("v1"));
        bus.share_context("b", "design", json!("v2"));

        assert_eq!(bus.get_context("design"), Some(json!("v2")));
        // Both writes appear in the journal.
        let writes = bus
            .journal()
            .iter()
            .filter(|e| matches!(e, JournalEntry::ContextWrite { .. }))
            .count();
        assert_eq!(writes, 2);
    }

    #[test]
    fn test_journal_replay_restores_state() {
        let bus = MessageBus::with_journal();
        bus.register_agent("b");
        bus.send(
            "a",
            Recipient::Agent("b".into()),
            MessageKind::Request,
            json!({"q": 1}),
        );
        bus.share_context("a", "k", json!(42));

        let journal = bus.journal();
        let recovered = MessageBus::with_journal();
        recovered.replay(journal);

        assert_eq!(recovered.message_count("b"), 1);
        assert_eq!(recovered.get_context("k"), Some(json!(42)));
    }

    #[test]
    fn test_messages_accumulate_for_dropped_recipients() {
        let bus = MessageBus::new();
        bus.register_agent("gone");
        bus.send(
            "a",
            Recipient::Agent("gone".into()),
            MessageKind::Notification,
            json!({}),
        );
        bus.send(
            "a",
            Recipient::Agent("gone".into()),
            MessageKind::Notification,
            json!({}),
        );
        assert_eq!(bus.message_count("gone"), 2);
        bus.remove_agent("gone");
        assert_eq!(bus.message_count("gone"), 0);
    }
}
