use std::fmt;

use serde::Serialize;

use super::ClientError;

/// One adjustable control on the configuration panel.
pub struct SettingDoc {
    pub name: &'static str,
    pub effect: &'static str,
}

pub const OPTIONS: &[SettingDoc] = &[
    SettingDoc {
        name: "max_new_tokens",
        effect: "The maximum number of new tokens to generate in the response.",
    },
    SettingDoc {
        name: "do_sample",
        effect: "Whether to use sampling; if off, greedy decoding is used.",
    },
    SettingDoc {
        name: "temperature",
        effect: "The sampling temperature; higher values make the output more random.",
    },
    SettingDoc {
        name: "top_k",
        effect: "The number of highest probability tokens to keep for top-k filtering.",
    },
    SettingDoc {
        name: "top_p",
        effect: "The cumulative probability of highest probability tokens to keep for nucleus sampling.",
    },
];

/// Sampling values sent with every turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingSettings {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            do_sample: true,
            temperature: 0.5,
            top_k: 50,
            top_p: 0.9,
        }
    }
}

impl SamplingSettings {
    /// Updates a single option from user input.
    pub fn set(&mut self, option: &str, value: &str) -> Result<(), ClientError> {
        let value = value.trim();
        match option.trim() {
            "max_new_tokens" => self.max_new_tokens = parse_positive(option, value)?,
            "do_sample" => self.do_sample = parse_flag(option, value)?,
            "temperature" => self.temperature = parse_unit(option, value)?,
            "top_k" => self.top_k = parse_positive(option, value)?,
            "top_p" => self.top_p = parse_unit(option, value)?,
            other => return Err(ClientError::UnknownSetting(other.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.max_new_tokens == 0 {
            return Err(ClientError::invalid_setting("max_new_tokens", "must be at least 1"));
        }
        if self.top_k == 0 {
            return Err(ClientError::invalid_setting("top_k", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ClientError::invalid_setting("temperature", "must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ClientError::invalid_setting("top_p", "must be between 0 and 1"));
        }
        Ok(())
    }
}

impl fmt::Display for SamplingSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "max_new_tokens = {}", self.max_new_tokens)?;
        writeln!(f, "do_sample      = {}", self.do_sample)?;
        writeln!(f, "temperature    = {}", self.temperature)?;
        writeln!(f, "top_k          = {}", self.top_k)?;
        write!(f, "top_p          = {}", self.top_p)
    }
}

fn parse_positive(option: &str, value: &str) -> Result<usize, ClientError> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ClientError::invalid_setting(option, "expected a whole number of at least 1")),
    }
}

fn parse_unit(option: &str, value: &str) -> Result<f64, ClientError> {
    match value.parse::<f64>() {
        Ok(x) if (0.0..=1.0).contains(&x) => Ok(x),
        _ => Err(ClientError::invalid_setting(option, "expected a number between 0 and 1")),
    }
}

fn parse_flag(option: &str, value: &str) -> Result<bool, ClientError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(ClientError::invalid_setting(option, "expected on or off")),
    }
}
