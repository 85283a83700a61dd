pub mod llama;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use candle_transformers::generation::Sampling;
use tokio::sync::Semaphore;
use tracing::debug;

/// Resolved per-request decoding settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: Option<f64>,
}

impl SamplingParams {
    /// Greedy when sampling is off or the temperature is zero, otherwise
    /// top-k followed by a nucleus cutoff when one below 1 is set.
    ///
    /// A cutoff of zero keeps only the most likely token.
    pub fn to_sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature <= f64::EPSILON {
            return Sampling::ArgMax;
        }
        match self.top_p {
            Some(p) if p <= 0.0 => Sampling::ArgMax,
            Some(p) if p < 1.0 => Sampling::TopKThenTopP {
                k: self.top_k,
                p,
                temperature: self.temperature,
            },
            _ => Sampling::TopK {
                k: self.top_k,
                temperature: self.temperature,
            },
        }
    }
}

/// The text-generation backend. Calls block until generation finishes and
/// return every candidate's full text, prompt included.
pub trait TextGenerator: Send + Sync + 'static {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Vec<String>>;
}

/// Runs generation off the async runtime, one call per gate permit.
pub struct InferenceService {
    generator: Arc<dyn TextGenerator>,
    gate: Arc<Semaphore>,
}

impl InferenceService {
    pub fn new(generator: Arc<dyn TextGenerator>, max_concurrent: usize) -> Self {
        Self {
            generator,
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    pub async fn generate(&self, prompt: String, params: SamplingParams) -> Result<Vec<String>> {
        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .context("generation gate closed")?;
        debug!(?params, "generation permit acquired");

        let generator = self.generator.clone();
        // The permit moves into the worker so it is only released once the
        // model call returns, even if the request is dropped meanwhile.
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            generator.generate(&prompt, &params)
        })
        .await
        .map_err(|err| anyhow!("generation worker failed: {err}"))?
    }
}
