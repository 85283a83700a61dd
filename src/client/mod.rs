use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::api::GenerationResult;
use crate::model::ConversationMessage;

pub mod session;
pub mod settings;

pub use session::{render_message, ChatSession, TurnState};
pub use settings::{SamplingSettings, OPTIONS};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Error in API request ({status})")]
    Status { status: StatusCode, body: String },

    #[error("Failed to connect to the API: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("Error in API request: unreadable response ({0})")]
    Decode(#[source] reqwest::Error),

    #[error("unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("invalid value for {option}: {reason}")]
    InvalidSetting { option: String, reason: String },
}

impl ClientError {
    pub fn invalid_setting(option: &str, reason: &str) -> Self {
        Self::InvalidSetting {
            option: option.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Anything that can answer a conversation turn.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        transcript: &[ConversationMessage],
        settings: &SamplingSettings,
    ) -> Result<String, ClientError>;
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    messages: &'a [ConversationMessage],
    max_new_tokens: usize,
    do_sample: bool,
    temperature: f64,
    top_k: usize,
    top_p: f64,
}

/// Talks to the chat service over HTTP.
#[derive(Clone)]
pub struct HttpChatBackend {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpChatBackend {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn complete(
        &self,
        transcript: &[ConversationMessage],
        settings: &SamplingSettings,
    ) -> Result<String, ClientError> {
        let payload = ChatPayload {
            messages: transcript,
            max_new_tokens: settings.max_new_tokens,
            do_sample: settings.do_sample,
            temperature: settings.temperature,
            top_k: settings.top_k,
            top_p: settings.top_p,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                error!(%err, "Failed to connect to the API");
                ClientError::Connection(err)
            })?;

        let status = response.status();
        debug!(%status, "response status code");
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "Error in API request");
            return Err(ClientError::Status { status, body });
        }

        let result: GenerationResult = response.json().await.map_err(|err| {
            error!(%err, "Error in API request");
            ClientError::Decode(err)
        })?;
        Ok(result.response)
    }
}
