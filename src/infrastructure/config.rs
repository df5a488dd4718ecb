use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const ASSISTANT_JSON: &str = "assistant.json";

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/";
const DEFAULT_QUOTE_PROMPT: &str = "Give me one short motivational quote against procrastination, \
     with its author. Reply with the quote only, no JSON.";

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub assistant: serde_json::Value,
}

/// HTTP and model settings for the language model endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantSettings {
    pub model: String,
    pub base_url: String,
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub call_timeout_seconds: u64,
    pub quote_queue_size: usize,
    pub quote_prompt: String,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout_seconds: 30,
            read_timeout_seconds: 120,
            call_timeout_seconds: 180,
            quote_queue_size: 3,
            quote_prompt: DEFAULT_QUOTE_PROMPT.to_string(),
        }
    }
}

impl AssistantSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    let assistant = AssistantSettings::default();
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "Procrastinapp",
                "timezone": "UTC",
                "exactAlarms": true
            }),
        ),
        (
            ASSISTANT_JSON,
            serde_json::json!({
                "schema": 1,
                "model": assistant.model,
                "baseUrl": assistant.base_url,
                "connectTimeoutSeconds": assistant.connect_timeout_seconds,
                "readTimeoutSeconds": assistant.read_timeout_seconds,
                "callTimeoutSeconds": assistant.call_timeout_seconds,
                "quoteQueueSize": assistant.quote_queue_size,
                "quotePrompt": assistant.quote_prompt
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        assistant: read_config(&config_dir.join(ASSISTANT_JSON))?,
    })
}

pub fn read_timezone(config_dir: &Path) -> Result<Option<String>, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    Ok(app
        .get("timezone")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned))
}

/// Timezone used to decide what "today" is. Defaults to UTC when unset.
pub fn resolve_timezone(config_dir: &Path) -> Result<Tz, InfraError> {
    let Some(name) = read_timezone(config_dir)? else {
        return Ok(Tz::UTC);
    };
    name.parse::<Tz>()
        .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone '{name}': {error}")))
}

/// Whether exact alarm timing is available. Missing means yes; setting it
/// to false makes reminders fire on minute boundaries instead.
pub fn read_exact_alarms(config_dir: &Path) -> Result<bool, InfraError> {
    let path = config_dir.join(APP_JSON);
    let app = read_config(&path)?;
    match app.get("exactAlarms") {
        None | Some(serde_json::Value::Null) => Ok(true),
        Some(serde_json::Value::Bool(exact)) => Ok(*exact),
        Some(other) => Err(InfraError::InvalidConfig(format!(
            "exactAlarms must be a boolean, got {other} in {}",
            path.display()
        ))),
    }
}

pub fn read_assistant_settings(config_dir: &Path) -> Result<AssistantSettings, InfraError> {
    let path = config_dir.join(ASSISTANT_JSON);
    let raw = read_config(&path)?;
    let settings: AssistantSettings = serde_json::from_value(raw)?;
    if settings.model.trim().is_empty() {
        return Err(InfraError::InvalidConfig(format!(
            "model must not be empty in {}",
            path.display()
        )));
    }
    if settings.quote_queue_size == 0 {
        return Err(InfraError::InvalidConfig(format!(
            "quoteQueueSize must be >= 1 in {}",
            path.display()
        )));
    }
    Ok(settings)
}
