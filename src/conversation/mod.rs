use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use minijinja::{context, Environment, ErrorKind};
use serde::Deserialize;
use tracing::{info, warn};

use crate::model::ConversationMessage;

const CHAT_TEMPLATE_NAME: &str = "chat_template";
const DEFAULT_BOS_TOKEN: &str = "<s>";
const DEFAULT_EOS_TOKEN: &str = "</s>";

/// Zephyr-style template shipped with TinyLlama chat checkpoints.
pub const DEFAULT_CHAT_TEMPLATE: &str = r#"{% for message in messages %}
{% if message['role'] == 'user' %}
{{ '<|user|>\n' + message['content'] + eos_token }}
{% elif message['role'] == 'system' %}
{{ '<|system|>\n' + message['content'] + eos_token }}
{% elif message['role'] == 'assistant' %}
{{ '<|assistant|>\n' + message['content'] + eos_token }}
{% endif %}
{% if loop.last and add_generation_prompt %}
{{ '<|assistant|>' }}
{% endif %}
{% endfor %}"#;

/// A compiled chat template that serializes a transcript into a prompt.
pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

impl ChatTemplate {
    pub fn new(
        source: impl Into<String>,
        bos_token: impl Into<String>,
        eos_token: impl Into<String>,
    ) -> Result<Self> {
        // Templates are compiled once at startup and live for the whole process.
        let source: &'static str = Box::leak(source.into().into_boxed_str());

        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function("raise_exception", raise_exception);
        env.add_template(CHAT_TEMPLATE_NAME, source)
            .context("failed to compile chat template")?;

        Ok(Self {
            env,
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read chat template ({})", path.display()))?;
        Self::new(raw, DEFAULT_BOS_TOKEN, DEFAULT_EOS_TOKEN)
    }

    /// Reads `chat_template` and the special tokens from a Hugging Face
    /// `tokenizer_config.json`. Returns `None` if the file carries no template.
    pub fn from_tokenizer_config(path: &Path) -> Result<Option<Self>> {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read tokenizer config ({})", path.display()))?;
        let cfg: TokenizerConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid tokenizer config ({})", path.display()))?;

        let Some(source) = cfg.chat_template.and_then(ChatTemplateField::into_source) else {
            return Ok(None);
        };

        let bos = cfg
            .bos_token
            .map(SpecialToken::into_content)
            .unwrap_or_else(|| DEFAULT_BOS_TOKEN.to_string());
        let eos = cfg
            .eos_token
            .map(SpecialToken::into_content)
            .unwrap_or_else(|| DEFAULT_EOS_TOKEN.to_string());

        Self::new(source, bos, eos).map(Some)
    }

    /// Picks the template: explicit file, then the model's tokenizer config,
    /// then the built-in default.
    pub fn resolve(explicit: Option<&Path>, tokenizer_config: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            info!(path = %path.display(), "using chat template override");
            return Self::from_file(path);
        }

        if let Some(path) = tokenizer_config {
            match Self::from_tokenizer_config(path) {
                Ok(Some(template)) => {
                    info!(path = %path.display(), "using chat template from tokenizer config");
                    return Ok(template);
                }
                Ok(None) => {}
                Err(err) => warn!(error = %format!("{err:#}"), "ignoring model chat template"),
            }
        }

        info!("using built-in chat template");
        Ok(Self::default())
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    /// Renders the transcript and appends the cue for the assistant's turn.
    pub fn render(&self, messages: &[ConversationMessage]) -> Result<String> {
        let template = self.env.get_template(CHAT_TEMPLATE_NAME)?;
        template
            .render(context! {
                messages => messages,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
                add_generation_prompt => true,
            })
            .map_err(|err| anyhow!("chat template rendering failed: {err}"))
    }
}

impl Default for ChatTemplate {
    fn default() -> Self {
        match Self::new(DEFAULT_CHAT_TEMPLATE, DEFAULT_BOS_TOKEN, DEFAULT_EOS_TOKEN) {
            Ok(template) => template,
            Err(err) => unreachable!("built-in chat template must compile: {err:#}"),
        }
    }
}

fn raise_exception(message: String) -> Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
}

#[derive(Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<ChatTemplateField>,
    #[serde(default)]
    bos_token: Option<SpecialToken>,
    #[serde(default)]
    eos_token: Option<SpecialToken>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChatTemplateField {
    Single(String),
    Named(Vec<NamedTemplate>),
}

#[derive(Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

impl ChatTemplateField {
    fn into_source(self) -> Option<String> {
        match self {
            Self::Single(source) => Some(source),
            Self::Named(list) => list
                .into_iter()
                .find(|t| t.name == "default")
                .map(|t| t.template),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Text(String),
    Added { content: String },
}

impl SpecialToken {
    fn into_content(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Added { content } => content,
        }
    }
}

/// Prepends `system_prompt` unless the transcript already opens with its own
/// system instructions.
pub fn with_system_prompt(
    mut messages: Vec<ConversationMessage>,
    system_prompt: Option<&str>,
) -> Vec<ConversationMessage> {
    let Some(prompt) = system_prompt.map(str::trim).filter(|s| !s.is_empty()) else {
        return messages;
    };
    if messages.iter().any(|m| m.role.is_system()) {
        return messages;
    }
    messages.insert(0, ConversationMessage::system(prompt));
    messages
}

/// Returns the text after the last `delimiter`, trimmed. The generated text
/// echoes the whole prompt, so earlier assistant turns must be skipped.
pub fn extract_reply<'a>(generated: &'a str, delimiter: &str) -> &'a str {
    if delimiter.is_empty() {
        return generated.trim();
    }
    generated
        .rsplit_once(delimiter)
        .map(|(_, reply)| reply)
        .unwrap_or(generated)
        .trim()
}
