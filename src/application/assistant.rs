use crate::application::chat_session::ChatSession;
use crate::application::task_repository::{BatchOutcome, TaskRepository};
use crate::domain::models::{AssistantResponse, Task};
use crate::domain::task_extractor::try_extract_tasks;
use crate::infrastructure::chat_client::ChatCompletionClient;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::message_storage::MessageStorage;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitOutcome {
    AllSaved,
    Partial,
    NothingSaved,
    NothingToCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub saved: usize,
    pub failed: usize,
    pub deleted: BatchOutcome,
    pub saved_ids: Vec<i64>,
    pub outcome: CommitOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditLoadReport {
    pub loaded: Vec<i64>,
    pub errors: Vec<String>,
}

/// Proposal and edit-mode state layered over a [`ChatSession`].
///
/// Holds the task list the assistant last proposed, plus the ids of stored
/// tasks being edited. Committing replaces those stored tasks wholesale.
pub struct AssistantWorkflow<C, S, R>
where
    C: ChatCompletionClient + ?Sized,
    S: MessageStorage,
    R: TaskRepository + ?Sized,
{
    session: ChatSession<C, S>,
    repository: Arc<R>,
    tasks: Vec<Task>,
    original_task_ids: Vec<i64>,
    notice: Option<String>,
}

impl<C, S, R> AssistantWorkflow<C, S, R>
where
    C: ChatCompletionClient + ?Sized,
    S: MessageStorage,
    R: TaskRepository + ?Sized,
{
    /// Restores the persisted conversation and starts with no proposal.
    pub fn new(mut session: ChatSession<C, S>, repository: Arc<R>) -> Self {
        session.load_messages();
        Self {
            session,
            repository,
            tasks: Vec::new(),
            original_task_ids: Vec::new(),
            notice: None,
        }
    }

    pub fn session(&self) -> &ChatSession<C, S> {
        &self.session
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn original_task_ids(&self) -> &[i64] {
        &self.original_task_ids
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn clear_notice(&mut self) {
        self.notice = None;
        self.session.clear_error();
    }

    pub fn replace_tasks(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks;
    }

    /// Sends one user turn and, when the reply carries a proposal, replaces
    /// the held task list with it.
    pub async fn send_message(
        &mut self,
        user_input: &str,
    ) -> Result<Option<AssistantResponse>, InfraError> {
        self.notice = None;
        let response = match self.session.send_message(user_input).await {
            Ok(response) => response,
            Err(error) => {
                if let InfraError::MultipleJsonObjects(count) = error {
                    self.notice = Some(format!(
                        "The assistant replied with {count} task lists; ask it again for a single one."
                    ));
                }
                return Err(error);
            }
        };

        if let Some(response) = &response {
            self.apply_proposal(response);
        }
        Ok(response)
    }

    fn apply_proposal(&mut self, response: &AssistantResponse) {
        if !response.has_json() {
            return;
        }
        match try_extract_tasks(&response.json) {
            Ok(tasks) if tasks.is_empty() => {
                info!("assistant reply carried no tasks; keeping current proposal");
            }
            Ok(tasks) => {
                info!(count = tasks.len(), "assistant proposed tasks");
                self.tasks = tasks;
            }
            Err(rejection) => {
                warn!(%rejection, "assistant proposal rejected");
                self.notice = Some(format!("Could not read the proposed tasks: {rejection}"));
            }
        }
    }

    /// Loads stored tasks into the proposal and seeds the conversation with
    /// them, so later turns can refine them. Ids that fail to load are
    /// reported and left out of the edit.
    pub fn load_tasks_for_editing(&mut self, ids: &[i64]) -> Result<EditLoadReport, InfraError> {
        let mut loaded = Vec::new();
        let mut errors = Vec::new();
        for &id in ids {
            match self.repository.get_task(id) {
                Ok(Some(task)) => loaded.push(task),
                Ok(None) => errors.push(InfraError::TaskNotFound(id).to_string()),
                Err(error) => errors.push(format!("task {id}: {error}")),
            }
        }

        let report = EditLoadReport {
            loaded: loaded.iter().map(|task| task.id).collect(),
            errors,
        };
        if loaded.is_empty() {
            self.notice = report.errors.first().cloned();
            return Ok(report);
        }

        let label = if loaded.len() == 1 {
            "Task to edit"
        } else {
            "Tasks for multi-edit"
        };
        let proposal = json!({ "propuesta": { "tasks": &loaded } });
        let content = serde_json::to_string_pretty(&proposal)?;

        self.original_task_ids = report.loaded.clone();
        self.tasks = loaded;
        info!(ids = ?self.original_task_ids, "loaded tasks for editing");
        // The synthetic reply always parses; only a save failure can surface here.
        if let Err(error) = self
            .session
            .add_user_and_assistant_message(label, &content)
        {
            warn!(%error, "failed seeding conversation with edited tasks");
        }
        if !report.errors.is_empty() {
            self.notice = Some(report.errors.join("; "));
        }
        Ok(report)
    }

    /// Deletes the tasks being edited, then saves every held task as a new
    /// tree. Per-item failures are counted, never propagated. With no held
    /// tasks nothing is deleted and the edit state is left as it was.
    pub fn commit(&mut self) -> CommitReport {
        if self.tasks.is_empty() {
            info!("no proposed tasks to commit");
            return CommitReport {
                saved: 0,
                failed: 0,
                deleted: BatchOutcome::default(),
                saved_ids: Vec::new(),
                outcome: CommitOutcome::NothingToCommit,
            };
        }

        let deleted = if self.original_task_ids.is_empty() {
            BatchOutcome::default()
        } else {
            self.repository.delete_tasks(&self.original_task_ids)
        };

        let mut saved_ids = Vec::new();
        let mut failed = 0;
        for task in &self.tasks {
            match self.repository.save_task(task) {
                Ok(id) => saved_ids.push(id),
                Err(error) => {
                    warn!(title = %task.title, %error, "failed saving proposed task");
                    failed += 1;
                }
            }
        }

        let saved = saved_ids.len();
        let outcome = match (saved, failed) {
            (_, 0) => CommitOutcome::AllSaved,
            (0, _) => CommitOutcome::NothingSaved,
            _ => CommitOutcome::Partial,
        };
        info!(saved, failed, ?outcome, "committed proposed tasks");

        self.original_task_ids.clear();
        self.tasks.clear();
        CommitReport {
            saved,
            failed,
            deleted,
            saved_ids,
            outcome,
        }
    }

    /// Drops the proposal and forgets the edited ids; nothing is written.
    pub fn cancel_edit(&mut self) {
        self.original_task_ids.clear();
        self.tasks.clear();
    }

    pub fn start_new_session(&mut self) {
        self.cancel_edit();
        self.notice = None;
        self.session.init_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::task_repository::SqliteTaskRepository;
    use crate::domain::models::{Role, TaskListQuery};
    use crate::infrastructure::alarm_scheduler::InMemoryAlarmScheduler;
    use crate::infrastructure::message_storage::InMemoryMessageStorage;
    use crate::test_support::{FakeChatClient, TempWorkspace};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio::sync::watch;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum RepositoryCall {
        Delete(i64),
        Save(String),
    }

    /// Repository backed by a map that records every write.
    struct RecordingTaskRepository {
        tasks: Mutex<BTreeMap<i64, Task>>,
        calls: Mutex<Vec<RepositoryCall>>,
        rejected_title: Option<String>,
        changes: watch::Sender<u64>,
    }

    impl RecordingTaskRepository {
        fn with_tasks(tasks: Vec<Task>) -> Self {
            Self {
                tasks: Mutex::new(tasks.into_iter().map(|task| (task.id, task)).collect()),
                calls: Mutex::new(Vec::new()),
                rejected_title: None,
                changes: watch::channel(0).0,
            }
        }

        fn calls(&self) -> Vec<RepositoryCall> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl TaskRepository for RecordingTaskRepository {
        fn get_tasks(&self, _filter: TaskListQuery) -> Result<Vec<Task>, InfraError> {
            Ok(self.tasks.lock().expect("tasks lock").values().cloned().collect())
        }

        fn get_task(&self, id: i64) -> Result<Option<Task>, InfraError> {
            Ok(self.tasks.lock().expect("tasks lock").get(&id).cloned())
        }

        fn save_task(&self, task: &Task) -> Result<i64, InfraError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(RepositoryCall::Save(task.title.clone()));
            if self.rejected_title.as_deref() == Some(task.title.as_str()) {
                return Err(InfraError::InvalidTask("rejected".to_string()));
            }
            let mut tasks = self.tasks.lock().expect("tasks lock");
            let id = tasks.keys().max().copied().unwrap_or(0) + 1;
            tasks.insert(id, Task { id, ..task.clone() });
            Ok(id)
        }

        fn update_task(&self, task: &Task) -> Result<(), InfraError> {
            Err(InfraError::TaskNotFound(task.id))
        }

        fn set_task_completed(&self, id: i64, _completed: bool) -> Result<(), InfraError> {
            Err(InfraError::TaskNotFound(id))
        }

        fn delete_task(&self, id: i64) -> Result<bool, InfraError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(RepositoryCall::Delete(id));
            Ok(self.tasks.lock().expect("tasks lock").remove(&id).is_some())
        }

        fn subscribe(&self) -> watch::Receiver<u64> {
            self.changes.subscribe()
        }
    }

    fn stored(id: i64, title: &str) -> Task {
        Task {
            id,
            ..Task::new(title)
        }
    }

    fn workflow<R: TaskRepository>(
        client: FakeChatClient,
        repository: Arc<R>,
    ) -> AssistantWorkflow<FakeChatClient, InMemoryMessageStorage, R> {
        let session = ChatSession::new(
            Arc::new(client),
            Arc::new(InMemoryMessageStorage::default()),
        );
        AssistantWorkflow::new(session, repository)
    }

    #[test]
    fn edit_then_commit_replaces_exactly_the_edited_tasks() {
        let repository = Arc::new(RecordingTaskRepository::with_tasks(vec![
            stored(5, "Write report"),
            stored(7, "Call dentist"),
            stored(9, "Untouched"),
        ]));
        let mut workflow = workflow(FakeChatClient::default(), Arc::clone(&repository));

        let report = workflow.load_tasks_for_editing(&[5, 7]).expect("load");
        assert_eq!(report.loaded, vec![5, 7]);
        assert!(report.errors.is_empty());
        assert_eq!(workflow.original_task_ids(), &[5, 7]);
        assert_eq!(workflow.tasks().len(), 2);

        workflow.replace_tasks(vec![Task::new("Merged plan")]);
        let report = workflow.commit();

        assert_eq!(
            repository.calls(),
            vec![
                RepositoryCall::Delete(5),
                RepositoryCall::Delete(7),
                RepositoryCall::Save("Merged plan".to_string()),
            ]
        );
        assert_eq!(report.deleted.succeeded, 2);
        assert_eq!(report.saved, 1);
        assert_eq!(report.outcome, CommitOutcome::AllSaved);
        assert!(workflow.original_task_ids().is_empty());
        assert!(workflow.tasks().is_empty());
    }

    #[test]
    fn editing_seeds_the_conversation_with_the_loaded_tasks() {
        let repository = Arc::new(RecordingTaskRepository::with_tasks(vec![stored(5, "Gym")]));
        let mut workflow = workflow(FakeChatClient::default(), Arc::clone(&repository));

        let report = workflow.load_tasks_for_editing(&[5, 42]).expect("load");
        assert_eq!(report.loaded, vec![5]);
        assert_eq!(report.errors, vec!["task 42 not found".to_string()]);
        assert_eq!(workflow.notice(), Some("task 42 not found"));

        let visible = workflow.session().visible_messages();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].content, "Task to edit");
        assert_eq!(visible[1].role, Role::Assistant);
        let seeded = try_extract_tasks(&visible[1].content).expect("seeded proposal parses");
        assert_eq!(seeded[0].title, "Gym");
    }

    #[test]
    fn loading_nothing_keeps_previous_state() {
        let repository = Arc::new(RecordingTaskRepository::with_tasks(Vec::new()));
        let mut workflow = workflow(FakeChatClient::default(), repository);

        let report = workflow.load_tasks_for_editing(&[1]).expect("load");
        assert!(report.loaded.is_empty());
        assert!(workflow.original_task_ids().is_empty());
        assert_eq!(workflow.session().visible_messages().len(), 0);
    }

    #[test]
    fn commit_reports_partial_and_total_failures() {
        let mut repository = RecordingTaskRepository::with_tasks(Vec::new());
        repository.rejected_title = Some("Bad".to_string());
        let repository = Arc::new(repository);
        let mut workflow = workflow(FakeChatClient::default(), Arc::clone(&repository));

        workflow.replace_tasks(vec![Task::new("Good"), Task::new("Bad")]);
        let report = workflow.commit();
        assert_eq!((report.saved, report.failed), (1, 1));
        assert_eq!(report.outcome, CommitOutcome::Partial);
        assert_eq!(report.deleted, BatchOutcome::default());

        workflow.replace_tasks(vec![Task::new("Bad")]);
        assert_eq!(workflow.commit().outcome, CommitOutcome::NothingSaved);

        assert_eq!(workflow.commit().outcome, CommitOutcome::NothingToCommit);
        assert_eq!(repository.calls().len(), 3);
    }

    #[tokio::test]
    async fn commentary_only_reply_never_deletes_edited_tasks() {
        let workspace = TempWorkspace::new("assistant");
        let repository = Arc::new(SqliteTaskRepository::new(
            Arc::new(workspace.task_store()),
            Arc::new(InMemoryAlarmScheduler::default()),
        ));
        let id = repository.save_task(&Task::new("Keep me")).expect("seed");

        let mut workflow = workflow(
            FakeChatClient::replying(&[
                r#"{"comentario": "Want me to split it?"}"#,
                r#"{"propuesta": {"tasks": []}}"#,
            ]),
            Arc::clone(&repository),
        );
        workflow.load_tasks_for_editing(&[id]).expect("load");

        workflow.send_message("thoughts?").await.expect("turn succeeds");
        assert_eq!(workflow.tasks().len(), 1);
        workflow.send_message("and now?").await.expect("turn succeeds");
        assert_eq!(workflow.tasks()[0].title, "Keep me");

        workflow.replace_tasks(Vec::new());
        let report = workflow.commit();
        assert_eq!(report.outcome, CommitOutcome::NothingToCommit);
        assert_eq!(report.deleted.total(), 0);
        assert_eq!(workflow.original_task_ids(), &[id]);
        let kept = repository.get_task(id).expect("query").expect("still stored");
        assert_eq!(kept.title, "Keep me");
    }

    #[tokio::test]
    async fn reply_with_proposal_replaces_held_tasks() {
        let reply = r#"Here you go {"comentario": "one step at a time", "propuesta": {"tasks": [{"title": "Read", "subtasks": [{"title": "Chapter 1"}]}, {"title": "Run"}]}}"#;
        let repository = Arc::new(RecordingTaskRepository::with_tasks(Vec::new()));
        let mut workflow = workflow(
            FakeChatClient::replying(&[reply, "Just chatting"]),
            repository,
        );
        workflow.replace_tasks(vec![Task::new("Stale")]);

        let response = workflow
            .send_message("plan my day")
            .await
            .expect("turn succeeds")
            .expect("non-blank input");
        assert_eq!(response.commentary, "one step at a time");
        let titles: Vec<&str> = workflow.tasks().iter().map(|task| task.title.as_str()).collect();
        assert_eq!(titles, vec!["Read", "Run"]);
        assert_eq!(workflow.tasks()[0].count_all_subtasks(), 1);

        workflow.send_message("thanks").await.expect("prose turn");
        assert_eq!(workflow.tasks().len(), 2, "prose keeps the current proposal");
    }

    #[tokio::test]
    async fn refused_proposals_are_surfaced_as_notices() {
        let repository = Arc::new(RecordingTaskRepository::with_tasks(Vec::new()));
        let mut workflow = workflow(
            FakeChatClient::replying(&[
                r#"{"propuesta": {"tasks": [{"title": "  "}]}}"#,
                r#"{"a": 1} and {"b": 2}"#,
            ]),
            repository,
        );
        workflow.replace_tasks(vec![Task::new("Keep me")]);

        workflow.send_message("first").await.expect("turn succeeds");
        assert!(workflow.notice().is_some_and(|notice| notice.contains("invalid task")));
        assert_eq!(workflow.tasks()[0].title, "Keep me");

        let error = workflow.send_message("second").await.expect_err("ambiguous");
        assert!(matches!(error, InfraError::MultipleJsonObjects(2)));
        assert!(workflow.notice().is_some_and(|notice| notice.contains("2 task lists")));

        workflow.clear_notice();
        assert_eq!(workflow.notice(), None);
        assert_eq!(workflow.session().error(), None);
    }

    #[test]
    fn new_session_and_cancel_drop_edit_state() {
        let repository = Arc::new(RecordingTaskRepository::with_tasks(vec![stored(3, "Plan")]));
        let mut workflow = workflow(FakeChatClient::default(), Arc::clone(&repository));

        workflow.load_tasks_for_editing(&[3]).expect("load");
        workflow.cancel_edit();
        assert!(workflow.original_task_ids().is_empty());
        assert!(workflow.tasks().is_empty());
        assert_eq!(workflow.commit().deleted.total(), 0);

        workflow.load_tasks_for_editing(&[3]).expect("load");
        workflow.start_new_session();
        assert!(workflow.original_task_ids().is_empty());
        assert_eq!(workflow.session().messages().len(), 1);
        assert!(repository.calls().is_empty());
    }

    #[test]
    fn commit_against_sqlite_store_rewrites_edited_trees() {
        let workspace = TempWorkspace::new("assistant");
        let repository = Arc::new(SqliteTaskRepository::new(
            Arc::new(workspace.task_store()),
            Arc::new(InMemoryAlarmScheduler::default()),
        ));
        let mut parent = Task::new("Move house");
        parent.subtasks = vec![Task::new("Pack"), Task::new("Book van")];
        let old_id = repository.save_task(&parent).expect("seed");

        let mut workflow = workflow(FakeChatClient::default(), Arc::clone(&repository));
        workflow.load_tasks_for_editing(&[old_id]).expect("load");
        let mut edited = workflow.tasks().to_vec();
        edited[0].subtasks.pop();
        workflow.replace_tasks(edited);
        let report = workflow.commit();

        assert_eq!(report.outcome, CommitOutcome::AllSaved);
        assert_eq!(repository.get_task(old_id).expect("query"), None);
        let new_id = report.saved_ids[0];
        let rewritten = repository
            .get_task(new_id)
            .expect("query")
            .expect("new tree stored");
        assert_eq!(rewritten.title, "Move house");
        assert_eq!(rewritten.count_all_subtasks(), 1);
        assert_eq!(
            repository
                .get_tasks(TaskListQuery::All)
                .expect("list")
                .len(),
            1
        );
    }
}
