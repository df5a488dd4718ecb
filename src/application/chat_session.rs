use crate::domain::dates::format_date_time;
use crate::domain::models::{AssistantResponse, ChatMessage, ChatRequest, Role};
use crate::domain::response_parser::parse_or_prose;
use crate::infrastructure::chat_client::ChatCompletionClient;
use crate::infrastructure::config::DEFAULT_MODEL;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::message_storage::MessageStorage;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, info, warn};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub const TASK_SYSTEM_PROMPT: &str = r#"You are an anti-procrastination assistant. You help the user create, edit, split and reschedule personal tasks.

Always answer with a short piece of advice followed by exactly one JSON object with this shape:
{
  "comentario": "advice and motivation for the user",
  "propuesta": {
    "tasks": [
      {
        "title": "short, meaningful summary",
        "deadline": "yyyy-MM-dd HH:mm or yyyy-MM-dd, or null",
        "priority": 0,
        "periodicity": "free text, or null",
        "notes": "free text, or null",
        "completed": false,
        "notify": "yyyy-MM-dd HH:mm, or null",
        "subtasks": []
      }
    ]
  }
}

Priority is 0 normal, 1 medium, 2 high, 3 urgent. Use the current date given in the conversation to place deadlines and notifications. Tasks accumulate across the conversation unless the user asks to clear them, so always return the complete, updated task list."#;

const JSON_REMINDER: &str = " IMPORTANT: remember to reply with the updated task list in JSON format.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AwaitingResponse,
}

/// Ordered assistant conversation with a hidden leading system prompt.
///
/// Callers issue one operation at a time; the session does no internal locking.
pub struct ChatSession<C, S>
where
    C: ChatCompletionClient + ?Sized,
    S: MessageStorage,
{
    client: Arc<C>,
    storage: Arc<S>,
    model: String,
    system_prompt: String,
    timezone: Tz,
    now_provider: NowProvider,
    messages: Vec<ChatMessage>,
    last_response: Option<AssistantResponse>,
    error: Option<String>,
    phase: SessionPhase,
}

impl<C, S> ChatSession<C, S>
where
    C: ChatCompletionClient + ?Sized,
    S: MessageStorage,
{
    /// Builds an in-memory session holding only the system prompt. Call
    /// [`ChatSession::load_messages`] to restore the persisted conversation.
    pub fn new(client: Arc<C>, storage: Arc<S>) -> Self {
        Self {
            client,
            storage,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: TASK_SYSTEM_PROMPT.to_string(),
            timezone: Tz::UTC,
            now_provider: Arc::new(Utc::now),
            messages: vec![ChatMessage::system(TASK_SYSTEM_PROMPT)],
            last_response: None,
            error: None,
            phase: SessionPhase::Idle,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self.messages = vec![ChatMessage::system(self.system_prompt.clone())];
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// User and assistant messages only.
    pub fn visible_messages(&self) -> Vec<&ChatMessage> {
        self.messages
            .iter()
            .filter(|message| message.role != Role::System)
            .collect()
    }

    pub fn last_response(&self) -> Option<&AssistantResponse> {
        self.last_response.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase == SessionPhase::AwaitingResponse
    }

    /// Clears the conversation down to the system prompt and persists it.
    pub fn init_session(&mut self) {
        debug!("starting new assistant session");
        self.messages.clear();
        self.messages.push(ChatMessage::system(self.system_prompt.clone()));
        self.error = None;
        self.last_response = None;
        self.persist();
    }

    /// Restores the persisted conversation, or starts a fresh one when
    /// nothing is stored or the stored copy cannot be read.
    pub fn load_messages(&mut self) {
        match self.storage.load_messages() {
            Ok(Some(messages)) => {
                self.messages = messages;
                if !self.messages.iter().any(|message| message.role == Role::System) {
                    self.messages
                        .insert(0, ChatMessage::system(self.system_prompt.clone()));
                }
                info!(messages = self.messages.len(), "assistant conversation restored");
            }
            Ok(None) => self.init_session(),
            Err(error) => {
                warn!(%error, "failed loading conversation, starting fresh");
                self.init_session();
            }
        }
    }

    /// Sends one user turn. Blank input is ignored and yields `Ok(None)`.
    ///
    /// On failure the user message stays in the conversation and the error is
    /// recorded for [`ChatSession::error`] as well as returned.
    pub async fn send_message(
        &mut self,
        user_input: &str,
    ) -> Result<Option<AssistantResponse>, InfraError> {
        let user_input = user_input.trim();
        if user_input.is_empty() {
            return Ok(None);
        }

        self.error = None;
        self.phase = SessionPhase::AwaitingResponse;
        let result = self.exchange(user_input).await;
        self.phase = SessionPhase::Idle;

        match result {
            Ok(response) => Ok(Some(response)),
            Err(error) => {
                warn!(%error, "assistant turn failed");
                self.error = Some(format!("Error: {error}"));
                Err(error)
            }
        }
    }

    async fn exchange(&mut self, user_input: &str) -> Result<AssistantResponse, InfraError> {
        let now = (self.now_provider)().with_timezone(&self.timezone).naive_local();
        self.messages.push(ChatMessage::system(format!(
            "The current date and time is {}",
            format_date_time(now)
        )));
        self.messages
            .push(ChatMessage::user(format!("{user_input}{JSON_REMINDER}")));

        let request = ChatRequest {
            model: self.model.clone(),
            messages: self.messages.clone(),
        };
        let response = self.client.send(&request).await?;
        let assistant_message = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or(InfraError::ModelEmptyResponse)?;

        let content = assistant_message.content.clone();
        self.messages.push(assistant_message);
        let parsed = parse_or_prose(&content);
        self.persist();

        let parsed = parsed?;
        self.last_response = Some(parsed.clone());
        Ok(parsed)
    }

    /// Appends a synthetic user/assistant pair, as if the model had produced
    /// `assistant_content`, and parses it as the latest response.
    pub fn add_user_and_assistant_message(
        &mut self,
        user_message: &str,
        assistant_content: &str,
    ) -> Result<AssistantResponse, InfraError> {
        self.messages.push(ChatMessage::user(user_message));
        self.messages.push(ChatMessage::assistant(assistant_content));
        self.persist();

        match parse_or_prose(assistant_content) {
            Ok(parsed) => {
                self.last_response = Some(parsed.clone());
                Ok(parsed)
            }
            Err(error) => {
                self.error = Some(format!("Error: {error}"));
                Err(error)
            }
        }
    }

    fn persist(&mut self) {
        if let Err(error) = self.storage.save_messages(&self.messages) {
            warn!(%error, "failed saving conversation");
            self.error = Some(format!("failed to save conversation: {error}"));
        }
    }
}
