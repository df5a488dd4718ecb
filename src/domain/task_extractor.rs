use crate::domain::models::{Task, TaskPriority};
use crate::domain::response_parser::find_json_objects;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Why a proposal payload was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionRejected {
    #[error("expected exactly one JSON object, found {0}")]
    AmbiguousPayload(usize),
    #[error("proposal is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("proposal contains an invalid task: {0}")]
    InvalidTask(String),
}

#[derive(Debug, Deserialize)]
struct ProposalEnvelope {
    propuesta: Option<Proposal>,
}

#[derive(Debug, Deserialize)]
struct Proposal {
    tasks: Option<Vec<TaskPayload>>,
}

#[derive(Debug, Deserialize)]
struct TaskPayload {
    title: Option<String>,
    deadline: Option<String>,
    priority: Option<serde_json::Value>,
    periodicity: Option<String>,
    notes: Option<String>,
    completed: Option<bool>,
    notify: Option<String>,
    subtasks: Option<Vec<TaskPayload>>,
}

impl TaskPayload {
    fn into_task(self) -> Task {
        let priority = self
            .priority
            .as_ref()
            .and_then(|value| value.as_i64().or_else(|| value.as_f64().map(|level| level as i64)))
            .map(TaskPriority::from_level)
            .unwrap_or_default();

        Task {
            id: 0,
            title: self.title.unwrap_or_default(),
            deadline: self.deadline.unwrap_or_default(),
            priority,
            periodicity: self.periodicity.unwrap_or_default(),
            notes: self.notes.unwrap_or_default(),
            completed: self.completed.unwrap_or(false),
            notify: self.notify.unwrap_or_default(),
            subtasks: self
                .subtasks
                .unwrap_or_default()
                .into_iter()
                .map(TaskPayload::into_task)
                .collect(),
        }
    }
}

/// Extracts the proposed task tree from raw message text.
///
/// `Ok(vec![])` means the message proposes nothing (no JSON, no `propuesta`,
/// or an empty task array). `Err` means a payload was present but refused.
pub fn try_extract_tasks(text: &str) -> Result<Vec<Task>, ExtractionRejected> {
    let objects = find_json_objects(text);
    let range = match objects.as_slice() {
        [] => return Ok(Vec::new()),
        [range] => range.clone(),
        _ => return Err(ExtractionRejected::AmbiguousPayload(objects.len())),
    };

    let envelope: ProposalEnvelope = serde_json::from_str(&text[range])
        .map_err(|error| ExtractionRejected::MalformedJson(error.to_string()))?;
    let Some(payloads) = envelope.propuesta.and_then(|proposal| proposal.tasks) else {
        return Ok(Vec::new());
    };

    let tasks: Vec<Task> = payloads.into_iter().map(TaskPayload::into_task).collect();
    for task in &tasks {
        task.validate().map_err(ExtractionRejected::InvalidTask)?;
    }
    debug!(count = tasks.len(), "extracted proposed tasks");
    Ok(tasks)
}

/// List form of [`try_extract_tasks`]: any rejection collapses to an empty list.
pub fn extract_tasks_from_text(text: &str) -> Vec<Task> {
    try_extract_tasks(text).unwrap_or_else(|rejection| {
        debug!(%rejection, "task proposal rejected");
        Vec::new()
    })
}
