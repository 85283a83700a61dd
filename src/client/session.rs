use crate::model::{ConversationMessage, Role};

use super::{ChatBackend, ClientError, SamplingSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    AwaitingResponse,
}

/// One chat conversation as seen by the client. Never persisted.
#[derive(Debug, Default)]
pub struct ChatSession {
    messages: Vec<ConversationMessage>,
    state: TurnState,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Starts over with an empty transcript.
    pub fn new_chat(&mut self) {
        self.messages.clear();
    }

    /// Appends the user's turn, asks the backend for a reply and appends it.
    ///
    /// Blank input is ignored and yields `Ok(None)`. `on_user_turn` runs
    /// right after the user message is appended so it can be shown before
    /// the backend answers. On failure the user message stays and no
    /// assistant message is added.
    pub async fn send_message<B, F>(
        &mut self,
        backend: &B,
        settings: &SamplingSettings,
        input: &str,
        on_user_turn: F,
    ) -> Result<Option<&ConversationMessage>, ClientError>
    where
        B: ChatBackend + ?Sized,
        F: FnOnce(&ConversationMessage),
    {
        let input = input.trim();
        if input.is_empty() {
            return Ok(None);
        }

        self.messages.push(ConversationMessage::user(input));
        if let Some(turn) = self.messages.last() {
            on_user_turn(turn);
        }

        self.state = TurnState::AwaitingResponse;
        let outcome = backend.complete(&self.messages, settings).await;
        self.state = TurnState::Idle;

        let reply = outcome?;
        self.messages.push(ConversationMessage::assistant(reply));
        Ok(self.messages.last())
    }
}

pub fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

pub fn render_message(message: &ConversationMessage) -> String {
    format!("[{}] {}", role_label(message.role), message.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedBackend {
        reply: Result<String, ()>,
        seen: Mutex<Vec<usize>>,
    }

    impl ScriptedBackend {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(
            &self,
            transcript: &[ConversationMessage],
            _settings: &SamplingSettings,
        ) -> Result<String, ClientError> {
            self.seen.lock().unwrap().push(transcript.len());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(()) => Err(ClientError::Status {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: r#"{"detail":"Internal Server Error"}"#.into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn successful_turn_appends_user_and_assistant() {
        let backend = ScriptedBackend::ok("Hi there!");
        let mut session = ChatSession::new();
        let mut shown = Vec::new();

        let reply = session
            .send_message(&backend, &SamplingSettings::default(), "Hello", |m| {
                shown.push(render_message(m))
            })
            .await
            .unwrap()
            .cloned();

        assert_eq!(reply, Some(ConversationMessage::assistant("Hi there!")));
        assert_eq!(shown, vec!["[you] Hello".to_string()]);
        assert_eq!(
            session.messages(),
            &[
                ConversationMessage::user("Hello"),
                ConversationMessage::assistant("Hi there!"),
            ]
        );
        assert_eq!(session.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn full_history_is_sent_each_turn() {
        let backend = ScriptedBackend::ok("ok");
        let mut session = ChatSession::new();
        let settings = SamplingSettings::default();

        session.send_message(&backend, &settings, "one", |_| {}).await.unwrap();
        session.send_message(&backend, &settings, "two", |_| {}).await.unwrap();

        assert_eq!(*backend.seen.lock().unwrap(), vec![1, 3]);
        assert_eq!(session.len(), 4);
    }

    #[tokio::test]
    async fn failed_turn_keeps_user_message_only() {
        let backend = ScriptedBackend::failing();
        let mut session = ChatSession::new();

        let err = session
            .send_message(&backend, &SamplingSettings::default(), "Hello", |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Status { .. }));
        assert_eq!(session.messages(), &[ConversationMessage::user("Hello")]);
        assert_eq!(session.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let backend = ScriptedBackend::ok("unused");
        let mut session = ChatSession::new();

        let out = session
            .send_message(&backend, &SamplingSettings::default(), "   ", |_| {})
            .await
            .unwrap();

        assert!(out.is_none());
        assert!(session.is_empty());
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_chat_clears_transcript() {
        let backend = ScriptedBackend::ok("World");
        let mut session = ChatSession::new();
        session
            .send_message(&backend, &SamplingSettings::default(), "Hello", |_| {})
            .await
            .unwrap();
        assert_ne!(session.len(), 0);

        session.new_chat();
        assert_eq!(session.len(), 0);
    }
}
