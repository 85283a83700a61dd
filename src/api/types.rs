use serde::{Deserialize, Serialize};

use crate::config::SamplingPolicy;
use crate::error::ChatError;
use crate::inference::SamplingParams;
use crate::model::ConversationMessage;

/// Body of `POST /api/v1/chat`. Omitted sampling fields fall back to the
/// service's configured defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub do_sample: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    pub response: String,
}

impl GenerationRequest {
    /// Applies defaults, checks ranges and resolves the effective sampling flag.
    pub fn sampling_params(&self, policy: &SamplingPolicy) -> Result<SamplingParams, ChatError> {
        if self.messages.is_empty() {
            return Err(ChatError::validation("messages must not be empty"));
        }

        let defaults = &policy.defaults;
        let max_new_tokens = self.max_new_tokens.unwrap_or(defaults.max_new_tokens);
        if max_new_tokens == 0 || max_new_tokens > policy.max_new_tokens_limit {
            return Err(ChatError::validation(format!(
                "max_new_tokens must be between 1 and {}",
                policy.max_new_tokens_limit
            )));
        }

        let top_k = self.top_k.unwrap_or(defaults.top_k);
        if top_k == 0 {
            return Err(ChatError::validation("top_k must be greater than 0"));
        }

        let temperature = self.temperature.unwrap_or(defaults.temperature);
        if !(0.0..=1.0).contains(&temperature) {
            return Err(ChatError::validation("temperature must be between 0 and 1"));
        }

        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ChatError::validation("top_p must be between 0 and 1"));
            }
        }

        let requested_sample = self.do_sample.unwrap_or(defaults.do_sample);
        let do_sample = if self.top_p.is_some() && policy.top_p_forces_sampling {
            true
        } else {
            requested_sample
        };

        Ok(SamplingParams {
            max_new_tokens,
            do_sample,
            temperature,
            top_k,
            top_p: self.top_p.or(defaults.top_p),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: serde_json::Value) -> GenerationRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn omitted_fields_take_defaults() {
        let req = parse(serde_json::json!({
            "messages": [{ "role": "user", "content": "Hello" }]
        }));
        let params = req.sampling_params(&SamplingPolicy::default()).unwrap();
        assert_eq!(
            params,
            SamplingParams {
                max_new_tokens: 100,
                do_sample: false,
                temperature: 0.3,
                top_k: 50,
                top_p: Some(0.6),
            }
        );
    }

    #[test]
    fn supplied_top_p_forces_sampling() {
        for p in [0.0, 0.6, 0.95, 1.0] {
            let req = parse(serde_json::json!({
                "messages": [{ "role": "user", "content": "Hello" }],
                "do_sample": false,
                "top_p": p
            }));
            let params = req.sampling_params(&SamplingPolicy::default()).unwrap();
            assert!(params.do_sample, "top_p={p} should force sampling");
            assert_eq!(params.top_p, Some(p));
        }
    }

    #[test]
    fn null_top_p_does_not_force_sampling() {
        let req = parse(serde_json::json!({
            "messages": [{ "role": "user", "content": "Hello" }],
            "do_sample": false,
            "top_p": null
        }));
        let params = req.sampling_params(&SamplingPolicy::default()).unwrap();
        assert!(!params.do_sample);
    }

    #[test]
    fn forcing_can_be_disabled_by_policy() {
        let policy = SamplingPolicy {
            top_p_forces_sampling: false,
            ..SamplingPolicy::default()
        };
        let req = parse(serde_json::json!({
            "messages": [{ "role": "user", "content": "Hello" }],
            "do_sample": false,
            "top_p": 0.9
        }));
        assert!(!req.sampling_params(&policy).unwrap().do_sample);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let policy = SamplingPolicy::default();
        let cases = [
            serde_json::json!({ "messages": [] }),
            serde_json::json!({ "messages": [{ "role": "user", "content": "x" }], "max_new_tokens": 0 }),
            serde_json::json!({ "messages": [{ "role": "user", "content": "x" }], "max_new_tokens": 100000 }),
            serde_json::json!({ "messages": [{ "role": "user", "content": "x" }], "top_k": 0 }),
            serde_json::json!({ "messages": [{ "role": "user", "content": "x" }], "temperature": 1.2 }),
            serde_json::json!({ "messages": [{ "role": "user", "content": "x" }], "temperature": -0.1 }),
            serde_json::json!({ "messages": [{ "role": "user", "content": "x" }], "top_p": 1.5 }),
        ];
        for body in cases {
            let err = parse(body.clone()).sampling_params(&policy).unwrap_err();
            assert!(matches!(err, ChatError::Validation(_)), "accepted {body}");
        }
    }
}
