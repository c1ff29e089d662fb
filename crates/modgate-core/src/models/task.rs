use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Text,
    Image,
    VideoFrame,
    AudioChunk,
}

/// Admission priority, highest first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub payload: Arc<[u8]>,
    pub kind: TaskKind,
    pub submitted_at: SystemTime,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, payload: impl Into<Arc<[u8]>>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            kind,
            submitted_at: SystemTime::now(),
        }
    }
}
