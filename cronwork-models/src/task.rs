use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lifecycle state of a task. Persisted as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Inactive,
    Idle,
    Running,
}

impl TaskState {
    pub fn as_u8(self) -> u8 {
        match self {
            TaskState::Inactive => 0,
            TaskState::Idle => 1,
            TaskState::Running => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TaskState::Inactive),
            1 => Some(TaskState::Idle),
            2 => Some(TaskState::Running),
            _ => None,
        }
    }
}

impl Serialize for TaskState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for TaskState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        TaskState::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown task state {value}")))
    }
}

/// Action taken when a running instance outlives its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Email,
    Kill,
    EmailAndKill,
    #[default]
    Ignore,
}

/// A task definition as the server hands it to the worker and as the
/// worker persists it. `args` is split on whitespace at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskArgs {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: String,
    pub cron_expr: String,
    #[serde(default = "default_state")]
    pub state: TaskState,
    /// Per-instance wall-clock limit in seconds; 0 means no timeout.
    #[serde(rename = "timeout_s", default)]
    pub timeout: i64,
    #[serde(default)]
    pub op_timeout: TimeoutAction,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub number_process: i32,
    #[serde(default)]
    pub last_exec_time: i64,
    /// Duration of the most recent invocation in milliseconds.
    #[serde(default)]
    pub last_cost_time: i64,
    #[serde(default)]
    pub mail_to: Vec<String>,
}

impl TaskArgs {
    /// Whitespace-split argument list for the spawned command.
    pub fn split_args(&self) -> Vec<String> {
        self.args.split_whitespace().map(str::to_string).collect()
    }

    /// Per-task log file name within the worker's log directory.
    pub fn log_file_name(&self) -> String {
        format!("{}-{}.log", self.name, self.id)
    }
}

fn default_state() -> TaskState {
    TaskState::Inactive
}

fn default_max_concurrent() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_as_integer() {
        let json = serde_json::to_string(&TaskState::Running).expect("serialize");
        assert_eq!(json, "2");
        let state: TaskState = serde_json::from_str("1").expect("deserialize");
        assert_eq!(state, TaskState::Idle);
        assert!(serde_json::from_str::<TaskState>("7").is_err());
    }

    #[test]
    fn timeout_action_uses_snake_case() {
        let json = serde_json::to_string(&TimeoutAction::EmailAndKill).expect("serialize");
        assert_eq!(json, "\"email_and_kill\"");
    }

    #[test]
    fn split_args_handles_extra_whitespace() {
        let task = TaskArgs {
            id: "t1".into(),
            name: "demo".into(),
            command: "/bin/echo".into(),
            args: "  hello   world ".into(),
            cron_expr: "* * * * *".into(),
            state: TaskState::Inactive,
            timeout: 0,
            op_timeout: TimeoutAction::Ignore,
            max_concurrent: 1,
            number_process: 0,
            last_exec_time: 0,
            last_cost_time: 0,
            mail_to: vec![],
        };
        assert_eq!(task.split_args(), vec!["hello", "world"]);
        assert_eq!(task.log_file_name(), "demo-t1.log");
    }
}
