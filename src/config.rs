use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

pub mod env {
    pub const SERVICE_TOKEN: &str = "SERVICE_TOKEN";
    pub const API_HOST: &str = "API_HOST";
    pub const API_PORT: &str = "API_PORT";
    pub const MODEL_ID: &str = "MODEL_ID";
    pub const MODEL_REVISION: &str = "MODEL_REVISION";
    pub const MODEL_DEVICE: &str = "MODEL_DEVICE";
    pub const CHAT_TEMPLATE_PATH: &str = "CHAT_TEMPLATE_PATH";
    pub const ASSISTANT_DELIMITER: &str = "ASSISTANT_DELIMITER";
    pub const SYSTEM_PROMPT: &str = "SYSTEM_PROMPT";
    pub const MAX_CONCURRENT_GENERATIONS: &str = "MAX_CONCURRENT_GENERATIONS";
    pub const MAX_NEW_TOKENS_LIMIT: &str = "MAX_NEW_TOKENS_LIMIT";
    pub const DEFAULT_MAX_NEW_TOKENS: &str = "DEFAULT_MAX_NEW_TOKENS";
    pub const DEFAULT_DO_SAMPLE: &str = "DEFAULT_DO_SAMPLE";
    pub const DEFAULT_TEMPERATURE: &str = "DEFAULT_TEMPERATURE";
    pub const DEFAULT_TOP_K: &str = "DEFAULT_TOP_K";
    pub const DEFAULT_TOP_P: &str = "DEFAULT_TOP_P";
    pub const TOP_P_FORCES_SAMPLING: &str = "TOP_P_FORCES_SAMPLING";

    pub const RUNNING_IN_DOCKER: &str = "RUNNING_IN_DOCKER";
    pub const DOCKER_API_URL: &str = "DOCKER_API_URL";
    pub const LOCAL_API_URL: &str = "LOCAL_API_URL";
}

pub const DEFAULT_MODEL_ID: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
pub const DEFAULT_ASSISTANT_DELIMITER: &str = "<|assistant|>";
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1/chat";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("The {0} environment variable is not defined")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Where the generator should run. `Auto` picks CUDA when it is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda(usize),
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.is_empty() || lower == "auto" {
            Ok(Self::Auto)
        } else if lower == "cpu" {
            Ok(Self::Cpu)
        } else if lower == "cuda" || lower == "gpu" {
            Ok(Self::Cuda(0))
        } else if let Some(part) = lower
            .strip_prefix("cuda:")
            .or_else(|| lower.strip_prefix("gpu:"))
        {
            part.parse::<usize>()
                .map(Self::Cuda)
                .map_err(|_| format!("bad device ordinal '{part}'"))
        } else {
            Err("expected auto, cpu, cuda or cuda:N".into())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Hub repo id, or a path to a local snapshot directory.
    pub model_id: String,
    pub revision: String,
    pub device: DevicePreference,
    pub chat_template_path: Option<PathBuf>,
    pub assistant_delimiter: String,
}

/// Values applied when a request omits a sampling field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDefaults {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: Option<f64>,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            do_sample: false,
            temperature: 0.3,
            top_k: 50,
            top_p: Some(0.6),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    pub defaults: SamplingDefaults,
    /// A caller-supplied `top_p` switches sampling on.
    pub top_p_forces_sampling: bool,
    pub max_new_tokens_limit: usize,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            defaults: SamplingDefaults::default(),
            top_p_forces_sampling: true,
            max_new_tokens_limit: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub service_token: String,
    pub bind_addr: SocketAddr,
    pub model: ModelConfig,
    pub sampling: SamplingPolicy,
    pub max_concurrent_generations: usize,
    pub system_prompt: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let service_token = vars
            .secret(env::SERVICE_TOKEN)
            .ok_or(ConfigError::Missing(env::SERVICE_TOKEN))?;

        let host: IpAddr = vars.parse_or(env::API_HOST, IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = vars.parse_or(env::API_PORT, 8000)?;

        let model = ModelConfig {
            model_id: vars
                .non_empty(env::MODEL_ID)
                .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            revision: vars
                .non_empty(env::MODEL_REVISION)
                .unwrap_or_else(|| "main".to_string()),
            device: vars.parse_or(env::MODEL_DEVICE, DevicePreference::Auto)?,
            chat_template_path: vars.non_empty(env::CHAT_TEMPLATE_PATH).map(PathBuf::from),
            assistant_delimiter: vars
                .non_empty(env::ASSISTANT_DELIMITER)
                .unwrap_or_else(|| DEFAULT_ASSISTANT_DELIMITER.to_string()),
        };

        let fallback = SamplingPolicy::default();
        let defaults = SamplingDefaults {
            max_new_tokens: vars
                .parse_or(env::DEFAULT_MAX_NEW_TOKENS, fallback.defaults.max_new_tokens)?,
            do_sample: vars.flag_or(env::DEFAULT_DO_SAMPLE, fallback.defaults.do_sample)?,
            temperature: vars.parse_or(env::DEFAULT_TEMPERATURE, fallback.defaults.temperature)?,
            top_k: vars.parse_or(env::DEFAULT_TOP_K, fallback.defaults.top_k)?,
            top_p: match vars.non_empty(env::DEFAULT_TOP_P) {
                None => fallback.defaults.top_p,
                Some(raw) if raw.eq_ignore_ascii_case("none") => None,
                Some(raw) => Some(parse_value(env::DEFAULT_TOP_P, &raw)?),
            },
        };
        let sampling = SamplingPolicy {
            defaults,
            top_p_forces_sampling: vars
                .flag_or(env::TOP_P_FORCES_SAMPLING, fallback.top_p_forces_sampling)?,
            max_new_tokens_limit: vars
                .parse_or(env::MAX_NEW_TOKENS_LIMIT, fallback.max_new_tokens_limit)?,
        };
        validate_sampling(&sampling)?;

        let max_concurrent_generations = vars.parse_or(env::MAX_CONCURRENT_GENERATIONS, 1usize)?;
        if max_concurrent_generations == 0 {
            return Err(ConfigError::invalid(
                env::MAX_CONCURRENT_GENERATIONS,
                "0",
                "at least one generation permit is required",
            ));
        }

        Ok(Self {
            service_token,
            bind_addr: SocketAddr::new(host, port),
            model,
            sampling,
            max_concurrent_generations,
            system_prompt: vars.non_empty(env::SYSTEM_PROMPT),
        })
    }
}

fn validate_sampling(policy: &SamplingPolicy) -> Result<(), ConfigError> {
    let d = &policy.defaults;
    if policy.max_new_tokens_limit == 0 {
        return Err(ConfigError::invalid(env::MAX_NEW_TOKENS_LIMIT, "0", "must be positive"));
    }
    if d.max_new_tokens == 0 || d.max_new_tokens > policy.max_new_tokens_limit {
        return Err(ConfigError::invalid(
            env::DEFAULT_MAX_NEW_TOKENS,
            d.max_new_tokens.to_string(),
            format!("must be in 1..={}", policy.max_new_tokens_limit),
        ));
    }
    if d.top_k == 0 {
        return Err(ConfigError::invalid(env::DEFAULT_TOP_K, "0", "must be positive"));
    }
    if !(0.0..=1.0).contains(&d.temperature) {
        return Err(ConfigError::invalid(
            env::DEFAULT_TEMPERATURE,
            d.temperature.to_string(),
            "must be in [0, 1]",
        ));
    }
    if let Some(p) = d.top_p.filter(|p| !(0.0..=1.0).contains(p)) {
        return Err(ConfigError::invalid(env::DEFAULT_TOP_P, p.to_string(), "must be in [0, 1]"));
    }
    Ok(())
}

/// Settings for the terminal client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub service_token: String,
    pub api_url: String,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let service_token = vars
            .secret(env::SERVICE_TOKEN)
            .ok_or(ConfigError::Missing(env::SERVICE_TOKEN))?;

        let url_key = if vars.non_empty(env::RUNNING_IN_DOCKER).is_some() {
            env::DOCKER_API_URL
        } else {
            env::LOCAL_API_URL
        };
        let api_url = vars
            .non_empty(url_key)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        Ok(Self {
            service_token,
            api_url,
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn non_empty(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Like `non_empty`, but the value is returned exactly as set.
    fn secret(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.non_empty(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    fn flag_or(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.non_empty(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
            },
        }
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| ConfigError::invalid(key, raw, err.to_string()))
}
