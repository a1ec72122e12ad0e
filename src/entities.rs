//! Task state and task message records.
//!
//! These are the two live, latency-sensitive entity kinds moving from the
//! legacy document store to the relational store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::Entity;

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Natural key of a [`TaskState`]: one state per (task, agent) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskStateKey {
    pub task_id: String,
    pub agent_id: String,
}

impl TaskStateKey {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

/// Renders `task_id/agent_id` with `\` and `/` escaped inside each part, so
/// distinct keys never share a rendering.
impl fmt::Display for TaskStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            escape_key_part(&self.task_id),
            escape_key_part(&self.agent_id)
        )
    }
}

fn escape_key_part(part: &str) -> std::borrow::Cow<'_, str> {
    if part.contains(['\\', '/']) {
        part.replace('\\', "\\\\").replace('/', "\\/").into()
    } else {
        part.into()
    }
}

/// The state an agent backend keeps for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub task_id: String,
    pub agent_id: String,
    /// Arbitrary JSON state owned by the agent backend.
    #[serde(default)]
    pub state: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>, state: Value) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            state,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> TaskStateKey {
        TaskStateKey::new(&self.task_id, &self.agent_id)
    }
}

impl Entity for TaskState {
    type NaturalKey = TaskStateKey;

    const KIND: &'static str = "task_state";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn natural_key(&self) -> TaskStateKey {
        self.key()
    }

    fn payload(&self) -> Value {
        json!({
            "task_id": self.task_id,
            "agent_id": self.agent_id,
            "state": self.state,
        })
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

// ---------------------------------------------------------------------------
// TaskMessage
// ---------------------------------------------------------------------------

/// A message exchanged between a caller and an agent backend about a task.
///
/// Messages have no compound key; the natural key is the id itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Who produced the message, e.g. `user` or an agent name.
    pub sender: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task_id: impl Into<String>, sender: impl Into<String>, content: Value) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            task_id: task_id.into(),
            agent_id: None,
            sender: sender.into(),
            content,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

impl Entity for TaskMessage {
    type NaturalKey = String;

    const KIND: &'static str = "task_message";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn natural_key(&self) -> String {
        self.id.clone().unwrap_or_default()
    }

    fn payload(&self) -> Value {
        json!({
            "task_id": self.task_id,
            "agent_id": self.agent_id,
            "sender": self.sender,
            "content": self.content,
        })
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}
