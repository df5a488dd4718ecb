use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum TaskPriority {
    #[default]
    Normal,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn from_level(level: i64) -> Self {
        match level {
            0 => Self::Normal,
            1 => Self::Medium,
            2 => Self::High,
            3 => Self::Urgent,
            _ => Self::Medium,
        }
    }

    pub fn level(self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl From<i64> for TaskPriority {
    fn from(level: i64) -> Self {
        Self::from_level(level)
    }
}

impl From<TaskPriority> for i64 {
    fn from(priority: TaskPriority) -> Self {
        priority.level()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub deadline: String,
    pub priority: TaskPriority,
    pub periodicity: String,
    pub notes: String,
    pub completed: bool,
    pub notify: String,
    pub subtasks: Vec<Task>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// A task is valid when its own title and every nested title is non-blank.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("task.title must not be empty".to_string());
        }
        for subtask in &self.subtasks {
            subtask.validate()?;
        }
        Ok(())
    }

    pub fn count_completed_subtasks(&self) -> usize {
        self.subtasks.iter().filter(|subtask| subtask.completed).count()
    }

    pub fn count_all_subtasks(&self) -> usize {
        self.subtasks.len()
    }

    /// Ids of this task and all of its descendants, depth first.
    pub fn subtree_ids(&self) -> Vec<i64> {
        let mut ids = vec![self.id];
        for subtask in &self.subtasks {
            ids.extend(subtask.subtree_ids());
        }
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskListQuery {
    All,
    Past,
    Now,
    Future,
    Priority,
    Notification,
    NoDate,
    Completed,
}

impl TaskListQuery {
    pub const ALL_QUERIES: [TaskListQuery; 8] = [
        Self::All,
        Self::Past,
        Self::Now,
        Self::Future,
        Self::Priority,
        Self::Notification,
        Self::NoDate,
        Self::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Past => "past",
            Self::Now => "now",
            Self::Future => "future",
            Self::Priority => "priority",
            Self::Notification => "notification",
            Self::NoDate => "no_date",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskListQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskListQuery {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL_QUERIES
            .into_iter()
            .find(|query| query.as_str() == normalized)
            .ok_or_else(|| format!("unknown task list query: {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AssistantResponse {
    pub text: String,
    pub json: String,
    pub commentary: String,
}

impl AssistantResponse {
    pub fn prose(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.is_empty()
    }

    pub fn has_json(&self) -> bool {
        !self.json.is_empty()
    }

    pub fn has_commentary(&self) -> bool {
        !self.commentary.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_tree() -> Task {
        Task {
            id: 10,
            title: "Plan trip".to_string(),
            deadline: "2026-03-01".to_string(),
            priority: TaskPriority::High,
            subtasks: vec![
                Task {
                    id: 11,
                    title: "Book flights".to_string(),
                    completed: true,
                    ..Task::default()
                },
                Task {
                    id: 12,
                    title: "Book hotel".to_string(),
                    subtasks: vec![Task {
                        id: 13,
                        title: "Compare prices".to_string(),
                        ..Task::default()
                    }],
                    ..Task::default()
                },
            ],
            ..Task::default()
        }
    }

    #[test]
    fn task_validation_is_recursive() {
        let mut task = sample_tree();
        assert!(task.validate().is_ok());

        task.subtasks[1].subtasks[0].title = "   ".to_string();
        assert!(task.validate().is_err());
    }

    #[test]
    fn subtask_counters_only_look_at_direct_children() {
        let task = sample_tree();
        assert_eq!(task.count_all_subtasks(), 2);
        assert_eq!(task.count_completed_subtasks(), 1);
        assert_eq!(task.subtree_ids(), vec![10, 11, 12, 13]);
    }

    #[test]
    fn priority_serializes_as_integer_level() {
        let task = Task {
            title: "x".to_string(),
            priority: TaskPriority::Urgent,
            ..Task::default()
        };
        let value = serde_json::to_value(&task).expect("serialize task");
        assert_eq!(value["priority"], serde_json::json!(3));

        let parsed: Task =
            serde_json::from_str(r#"{"title":"y","priority":7}"#).expect("deserialize task");
        assert_eq!(parsed.priority, TaskPriority::Medium);
    }

    #[test]
    fn role_serializes_lowercase() {
        let message = ChatMessage::assistant("hola");
        let value = serde_json::to_value(&message).expect("serialize message");
        assert_eq!(value, serde_json::json!({"role": "assistant", "content": "hola"}));
    }

    #[test]
    fn task_list_query_parses_from_names() {
        assert_eq!("no-date".parse::<TaskListQuery>(), Ok(TaskListQuery::NoDate));
        assert_eq!("NOW".parse::<TaskListQuery>(), Ok(TaskListQuery::Now));
        assert!("later".parse::<TaskListQuery>().is_err());
    }

    proptest! {
        #[test]
        fn priority_levels_roundtrip_within_range(level in 0i64..4i64) {
            prop_assert_eq!(TaskPriority::from_level(level).level(), level);
        }

        #[test]
        fn out_of_range_priority_falls_back_to_medium(level in prop_oneof![i64::MIN..0i64, 4i64..i64::MAX]) {
            prop_assert_eq!(TaskPriority::from_level(level), TaskPriority::Medium);
        }
    }
}
