use crate::application::assistant::{AssistantWorkflow, CommitReport, EditLoadReport};
use crate::application::bootstrap::bootstrap_workspace;
use crate::application::chat_session::ChatSession;
use crate::application::quotes::QuoteCache;
use crate::application::task_feed::TaskFeed;
use crate::application::task_repository::{BatchOutcome, SqliteTaskRepository, TaskRepository};
use crate::domain::models::{AssistantResponse, ChatMessage, Task, TaskListQuery};
use crate::infrastructure::alarm_scheduler::{AlarmEvent, AlarmPrecision, TokioAlarmScheduler};
use crate::infrastructure::chat_client::{ChatCompletionClient, ReqwestChatClient};
use crate::infrastructure::config::{
    AssistantSettings, read_assistant_settings, read_exact_alarms, resolve_timezone,
};
use crate::infrastructure::credential_store::{ApiKeyStore, KeyringApiKeyStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::message_storage::SqliteMessageStorage;
use crate::infrastructure::task_store::SqliteTaskStore;
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{MappedMutexGuard, MutexGuard, mpsc};

const API_KEY_VARS: &[&str] = &["PROCRASTINAPP_API_KEY", "OPENAI_API_KEY"];
const BASE_URL_VARS: &[&str] = &["PROCRASTINAPP_BASE_URL", "OPENAI_BASE_URL"];
const MODEL_VARS: &[&str] = &["PROCRASTINAPP_MODEL"];

pub type SharedChatClient = Arc<dyn ChatCompletionClient>;
type Workflow = AssistantWorkflow<dyn ChatCompletionClient, SqliteMessageStorage, dyn TaskRepository>;

struct AssistantRuntime {
    workflow: Workflow,
    quotes: QuoteCache<dyn ChatCompletionClient>,
}

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    timezone: Tz,
    settings: AssistantSettings,
    repository: Arc<SqliteTaskRepository<TokioAlarmScheduler>>,
    api_keys: Arc<dyn ApiKeyStore>,
    alarm_events: Mutex<Option<mpsc::UnboundedReceiver<AlarmEvent>>>,
    assistant: tokio::sync::Mutex<Option<AssistantRuntime>>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        Self::with_api_key_store(workspace_root, Arc::new(KeyringApiKeyStore::default()))
    }

    pub fn with_api_key_store(
        workspace_root: PathBuf,
        api_keys: Arc<dyn ApiKeyStore>,
    ) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let timezone = resolve_timezone(&bootstrap.config_dir)?;
        let settings = read_assistant_settings(&bootstrap.config_dir)?;
        let precision =
            AlarmPrecision::when_exact_available(read_exact_alarms(&bootstrap.config_dir)?);

        let (alarm_sender, alarm_receiver) = mpsc::unbounded_channel();
        let alarms =
            Arc::new(TokioAlarmScheduler::new(timezone, alarm_sender).with_precision(precision));
        let store = Arc::new(SqliteTaskStore::new(&bootstrap.database_path));
        let repository = Arc::new(SqliteTaskRepository::new(store, alarms).with_timezone(timezone));

        Ok(Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            timezone,
            settings,
            repository,
            api_keys,
            alarm_events: Mutex::new(Some(alarm_receiver)),
            assistant: tokio::sync::Mutex::new(None),
            log_guard: Mutex::new(()),
        })
    }

    /// Uses `client` for the assistant instead of connecting on first use.
    pub fn with_chat_client(mut self, client: SharedChatClient) -> Self {
        let runtime = self.build_assistant(client, &self.settings);
        *self.assistant.get_mut() = Some(runtime);
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn repository(&self) -> Arc<dyn TaskRepository> {
        self.repository.clone()
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }

    fn build_assistant(
        &self,
        client: SharedChatClient,
        settings: &AssistantSettings,
    ) -> AssistantRuntime {
        let storage = Arc::new(SqliteMessageStorage::new(&self.database_path));
        let session = ChatSession::new(Arc::clone(&client), storage)
            .with_model(settings.model.clone())
            .with_timezone(self.timezone);
        let repository: Arc<dyn TaskRepository> = self.repository.clone();
        AssistantRuntime {
            workflow: AssistantWorkflow::new(session, repository),
            quotes: QuoteCache::new(client, settings),
        }
    }

    fn connect_chat_client(&self) -> Result<(SharedChatClient, AssistantSettings), InfraError> {
        let credentials = load_assistant_credentials_from_env(self.api_keys.as_ref())?;
        let settings = credentials.apply(&self.settings);
        let client = ReqwestChatClient::new(&settings, credentials.api_key)?;
        Ok((Arc::new(client), settings))
    }

    async fn lock_assistant(&self) -> Result<MappedMutexGuard<'_, AssistantRuntime>, InfraError> {
        let mut guard = self.assistant.lock().await;
        if guard.is_none() {
            let (client, settings) = self.connect_chat_client()?;
            *guard = Some(self.build_assistant(client, &settings));
        }
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| InfraError::InvalidConfig("assistant is not available".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantCredentials {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl AssistantCredentials {
    pub fn apply(&self, settings: &AssistantSettings) -> AssistantSettings {
        let mut settings = settings.clone();
        if let Some(base_url) = &self.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        settings
    }
}

/// Proposal state after an assistant command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantStateResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<AssistantResponse>,
    pub tasks: Vec<Task>,
    pub editing_task_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl AssistantStateResponse {
    fn snapshot(workflow: &Workflow, reply: Option<AssistantResponse>) -> Self {
        Self {
            reply,
            tasks: workflow.tasks().to_vec(),
            editing_task_ids: workflow.original_task_ids().to_vec(),
            notice: workflow
                .notice()
                .or_else(|| workflow.session().error())
                .map(ToOwned::to_owned),
        }
    }
}

pub fn list_tasks_impl(state: &AppState, filter: &str) -> Result<Vec<Task>, InfraError> {
    let filter = parse_filter(filter)?;
    state.repository.get_tasks(filter)
}

pub fn get_task_impl(state: &AppState, task_id: i64) -> Result<Task, InfraError> {
    state
        .repository
        .get_task(task_id)?
        .ok_or(InfraError::TaskNotFound(task_id))
}

pub fn save_task_impl(state: &AppState, task: Task) -> Result<i64, InfraError> {
    let task_id = state.repository.save_task(&task)?;
    state.log_info(
        "save_task",
        &format!(
            "saved task_id={task_id} subtasks={}",
            task.count_all_subtasks()
        ),
    );
    Ok(task_id)
}

pub fn update_task_impl(state: &AppState, task: Task) -> Result<Task, InfraError> {
    state.repository.update_task(&task)?;
    state.log_info("update_task", &format!("updated task_id={}", task.id));
    get_task_impl(state, task.id)
}

pub fn set_task_completed_impl(
    state: &AppState,
    task_id: i64,
    completed: bool,
) -> Result<(), InfraError> {
    state.repository.set_task_completed(task_id, completed)?;
    state.log_info(
        "set_task_completed",
        &format!("task_id={task_id} completed={completed}"),
    );
    Ok(())
}

pub fn complete_tasks_impl(state: &AppState, task_ids: Vec<i64>) -> Result<BatchOutcome, InfraError> {
    ensure_ids(&task_ids)?;
    let outcome = state.repository.complete_tasks(&task_ids);
    state.log_info("complete_tasks", &batch_message(&outcome));
    Ok(outcome)
}

pub fn delete_tasks_impl(state: &AppState, task_ids: Vec<i64>) -> Result<BatchOutcome, InfraError> {
    ensure_ids(&task_ids)?;
    let outcome = state.repository.delete_tasks(&task_ids);
    state.log_info("delete_tasks", &batch_message(&outcome));
    Ok(outcome)
}

pub fn watch_tasks_impl(
    state: &AppState,
    filter: &str,
) -> Result<TaskFeed<dyn TaskRepository>, InfraError> {
    let filter = parse_filter(filter)?;
    Ok(TaskFeed::new(state.repository(), filter))
}

/// Arms reminders for stored tasks; needed once per process before waiting on alarms.
pub fn rearm_alarms_impl(state: &AppState) -> Result<usize, InfraError> {
    let armed = state.repository.rearm_alarms()?;
    state.log_info("rearm_alarms", &format!("armed={armed}"));
    Ok(armed)
}

/// Receiver of fired task alarms. Only the first caller gets it.
pub fn take_alarm_events(state: &AppState) -> Option<mpsc::UnboundedReceiver<AlarmEvent>> {
    state.alarm_events.lock().ok()?.take()
}

pub fn save_api_key_impl(state: &AppState, api_key: String) -> Result<(), InfraError> {
    state.api_keys.save_api_key(&api_key)?;
    state.log_info("save_api_key", "stored assistant api key");
    Ok(())
}

pub async fn send_message_impl(
    state: &AppState,
    message: String,
) -> Result<AssistantStateResponse, InfraError> {
    let mut assistant = state.lock_assistant().await?;
    let reply = assistant.workflow.send_message(&message).await?;
    state.log_info(
        "send_message",
        &format!(
            "reply_chars={} proposed_tasks={}",
            reply.as_ref().map_or(0, |reply| reply.text.len()),
            assistant.workflow.tasks().len()
        ),
    );
    Ok(AssistantStateResponse::snapshot(&assistant.workflow, reply))
}

pub async fn assistant_state_impl(state: &AppState) -> Result<AssistantStateResponse, InfraError> {
    let assistant = state.lock_assistant().await?;
    let reply = assistant.workflow.session().last_response().cloned();
    Ok(AssistantStateResponse::snapshot(&assistant.workflow, reply))
}

pub async fn conversation_impl(state: &AppState) -> Result<Vec<ChatMessage>, InfraError> {
    let assistant = state.lock_assistant().await?;
    Ok(assistant
        .workflow
        .session()
        .visible_messages()
        .into_iter()
        .cloned()
        .collect())
}

pub async fn load_tasks_for_editing_impl(
    state: &AppState,
    task_ids: Vec<i64>,
) -> Result<EditLoadReport, InfraError> {
    ensure_ids(&task_ids)?;
    let mut assistant = state.lock_assistant().await?;
    let report = assistant.workflow.load_tasks_for_editing(&task_ids)?;
    for error in &report.errors {
        state.log_error("load_tasks_for_editing", error);
    }
    state.log_info(
        "load_tasks_for_editing",
        &format!("loaded task_ids={:?}", report.loaded),
    );
    Ok(report)
}

pub async fn replace_proposed_tasks_impl(
    state: &AppState,
    tasks: Vec<Task>,
) -> Result<AssistantStateResponse, InfraError> {
    let mut assistant = state.lock_assistant().await?;
    assistant.workflow.replace_tasks(tasks);
    Ok(AssistantStateResponse::snapshot(&assistant.workflow, None))
}

pub async fn commit_tasks_impl(state: &AppState) -> Result<CommitReport, InfraError> {
    let mut assistant = state.lock_assistant().await?;
    let report = assistant.workflow.commit();
    state.log_info(
        "commit_tasks",
        &format!(
            "outcome={:?} saved={} failed={} deleted={}",
            report.outcome, report.saved, report.failed, report.deleted.succeeded
        ),
    );
    Ok(report)
}

pub async fn cancel_edit_impl(state: &AppState) -> Result<(), InfraError> {
    let mut assistant = state.lock_assistant().await?;
    assistant.workflow.cancel_edit();
    state.log_info("cancel_edit", "edit cancelled");
    Ok(())
}

pub async fn new_session_impl(state: &AppState) -> Result<(), InfraError> {
    let mut assistant = state.lock_assistant().await?;
    assistant.workflow.start_new_session();
    state.log_info("new_session", "conversation reset");
    Ok(())
}

pub async fn next_quote_impl(state: &AppState) -> Result<String, InfraError> {
    let assistant = state.lock_assistant().await?;
    assistant.quotes.initialize().await;
    Ok(assistant.quotes.next_quote().await)
}

fn parse_filter(filter: &str) -> Result<TaskListQuery, InfraError> {
    filter.parse().map_err(InfraError::InvalidConfig)
}

fn ensure_ids(task_ids: &[i64]) -> Result<(), InfraError> {
    if task_ids.is_empty() {
        return Err(InfraError::InvalidConfig(
            "task_ids must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn batch_message(outcome: &BatchOutcome) -> String {
    format!(
        "succeeded={} missing={} failed={}",
        outcome.succeeded, outcome.missing, outcome.failed
    )
}

fn load_assistant_credentials_from_env(
    api_keys: &dyn ApiKeyStore,
) -> Result<AssistantCredentials, InfraError> {
    load_assistant_credentials_from_lookup(|key| std::env::var(key).ok(), api_keys)
}

/// Environment first, then the keyring for the API key.
fn load_assistant_credentials_from_lookup<F>(
    lookup: F,
    api_keys: &dyn ApiKeyStore,
) -> Result<AssistantCredentials, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = match optional_lookup_value(&lookup, API_KEY_VARS) {
        Some(api_key) => api_key,
        None => match api_keys.load_api_key()? {
            Some(api_key) => api_key,
            None => required_lookup_value(&lookup, API_KEY_VARS, "assistant api key")?,
        },
    };

    Ok(AssistantCredentials {
        api_key,
        base_url: optional_lookup_value(&lookup, BASE_URL_VARS),
        model: optional_lookup_value(&lookup, MODEL_VARS),
    })
}

fn required_lookup_value<F>(
    lookup: &F,
    keys: &[&str],
    field_name: &str,
) -> Result<String, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, keys).ok_or_else(|| {
        InfraError::InvalidConfig(format!(
            "missing {} (set one of: {}, or store one in the keyring)",
            field_name,
            keys.join(", ")
        ))
    })
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}
