use crate::domain::models::{ChatChoice, ChatMessage, ChatRequest, ChatResponse};
use crate::infrastructure::chat_client::ChatCompletionClient;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::message_storage::MessageStorage;
use crate::infrastructure::storage::initialize_database;
use crate::infrastructure::task_store::SqliteTaskStore;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

pub struct TempWorkspace {
    path: PathBuf,
}

impl TempWorkspace {
    pub fn new(label: &str) -> Self {
        let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "procrastinapp-{label}-tests-{}-{}",
            std::process::id(),
            sequence
        ));
        fs::create_dir_all(&path).expect("create temp workspace");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn database_path(&self) -> PathBuf {
        let path = self.path.join("tasks.sqlite");
        if !path.exists() {
            initialize_database(&path).expect("initialize database");
        }
        path
    }

    pub fn task_store(&self) -> SqliteTaskStore {
        SqliteTaskStore::new(self.database_path())
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[derive(Debug, Clone)]
pub enum FakeReply {
    Content(String),
    NoChoices,
    Http(u16),
    NetworkError,
}

/// Chat client returning queued replies and recording every request.
#[derive(Debug, Default)]
pub struct FakeChatClient {
    replies: Mutex<VecDeque<FakeReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeChatClient {
    pub fn with_replies(replies: Vec<FakeReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(contents: &[&str]) -> Self {
        Self::with_replies(
            contents
                .iter()
                .map(|content| FakeReply::Content(content.to_string()))
                .collect(),
        )
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("request lock poisoned").clone()
    }
}

#[async_trait]
impl ChatCompletionClient for FakeChatClient {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, InfraError> {
        self.requests
            .lock()
            .expect("request lock poisoned")
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .expect("reply lock poisoned")
            .pop_front()
            .unwrap_or(FakeReply::NetworkError);

        match reply {
            FakeReply::Content(content) => Ok(ChatResponse {
                choices: vec![ChatChoice {
                    message: ChatMessage::assistant(content),
                }],
            }),
            FakeReply::NoChoices => Ok(ChatResponse { choices: Vec::new() }),
            FakeReply::Http(status) => Err(InfraError::ModelHttp {
                status,
                body: "fake failure".to_string(),
            }),
            FakeReply::NetworkError => Err(InfraError::ModelCommunication(
                "fake network error".to_string(),
            )),
        }
    }
}

/// Message storage whose writes always fail.
#[derive(Debug, Default)]
pub struct FailingMessageStorage;

impl MessageStorage for FailingMessageStorage {
    fn save_messages(&self, _messages: &[ChatMessage]) -> Result<(), InfraError> {
        Err(InfraError::Storage("disk full".to_string()))
    }

    fn load_messages(&self) -> Result<Option<Vec<ChatMessage>>, InfraError> {
        Err(InfraError::Storage("unreadable".to_string()))
    }
}
