use crate::domain::models::{ChatRequest, ChatResponse};
use crate::infrastructure::config::AssistantSettings;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

const CHAT_COMPLETIONS_PATH: &str = "v1/chat/completions";

#[async_trait]
pub trait ChatCompletionClient: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, InfraError>;
}

/// OpenAI-compatible chat completions client.
///
/// Connect, read and total call budgets come from [`AssistantSettings`].
/// Sending the request body counts against the call timeout.
#[derive(Debug, Clone)]
pub struct ReqwestChatClient {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl ReqwestChatClient {
    pub fn new(settings: &AssistantSettings, api_key: impl Into<String>) -> Result<Self, InfraError> {
        let api_key = api_key.into();
        Self::ensure_non_empty(&api_key, "api key")?;
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .read_timeout(settings.read_timeout())
            .timeout(settings.call_timeout())
            .build()
            .map_err(|error| {
                InfraError::ModelCommunication(format!("failed building http client: {error}"))
            })?;
        Ok(Self {
            client,
            endpoint: Self::completions_endpoint(&settings.base_url)?,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::InvalidConfig(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn completions_endpoint(base_url: &str) -> Result<Url, InfraError> {
        Self::ensure_non_empty(base_url, "base url")?;
        let base_url = base_url.trim();
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        Url::parse(&normalized)
            .and_then(|base| base.join(CHAT_COMPLETIONS_PATH))
            .map_err(|error| InfraError::InvalidConfig(format!("invalid base url '{base_url}': {error}")))
    }

    fn interpret_response(status: StatusCode, body: &str) -> Result<ChatResponse, InfraError> {
        if !status.is_success() {
            return Err(InfraError::ModelHttp {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        if body.trim().is_empty() {
            return Err(InfraError::ModelEmptyResponse);
        }
        serde_json::from_str(body).map_err(|error| {
            InfraError::ModelCommunication(format!("invalid chat completion payload: {error}; body={body}"))
        })
    }
}

#[async_trait]
impl ChatCompletionClient for ReqwestChatClient {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, InfraError> {
        debug!(model = %request.model, messages = request.messages.len(), "sending chat completion");

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|error| {
                warn!(%error, "chat completion request failed");
                InfraError::ModelCommunication(format!("network error while calling model: {error}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::ModelCommunication(format!("failed reading model response: {error}"))
        })?;

        Self::interpret_response(status, &body)
    }
}
