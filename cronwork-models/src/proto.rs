use serde::{Deserialize, Serialize};

use crate::task::TaskArgs;

/// One administrative command from the server to a worker. Sent as a
/// single newline-delimited JSON object per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandRequest {
    Add { task: TaskArgs },
    Stop { task: TaskArgs },
    Kill { task: TaskArgs },
    Delete { task: TaskArgs },
    QuickStart { task: TaskArgs },
    List,
}

/// Reply for a `CommandRequest`, also newline-delimited JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Captured output for quick-start requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskArgs>>,
}

impl CommandRequest {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

impl CommandReply {
    pub fn success() -> Self {
        Self {
            ok: true,
            message: None,
            output: None,
            tasks: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            output: None,
            tasks: None,
        }
    }

    pub fn with_output(output: String) -> Self {
        Self {
            ok: true,
            message: None,
            output: Some(output),
            tasks: None,
        }
    }

    pub fn with_tasks(tasks: Vec<TaskArgs>) -> Self {
        Self {
            ok: true,
            message: None,
            output: None,
            tasks: Some(tasks),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}
