use anyhow::{anyhow, bail, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use std::fs;
use std::path::{Path, PathBuf};

use super::{SamplingParams, TextGenerator};
use crate::config::{DevicePreference, ModelConfig};

const SINGLE_WEIGHTS: &str = "model.safetensors";
const SHARD_INDEX: &str = "model.safetensors.index.json";

/// Everything needed to build a generator and its chat template.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

/// Resolves model files from a local snapshot directory, or downloads them
/// from the Hugging Face hub. Blocking.
pub fn load_model_files(cfg: &ModelConfig) -> Result<ModelFiles> {
    let local = Path::new(&cfg.model_id);
    if local.is_dir() {
        info!(path = %local.display(), "loading model from local snapshot");
        return local_files(local);
    }
    hub_files(&cfg.model_id, &cfg.revision)
}

fn local_files(dir: &Path) -> Result<ModelFiles> {
    let config = dir.join("config.json");
    let tokenizer = dir.join("tokenizer.json");
    for required in [&config, &tokenizer] {
        if !required.exists() {
            bail!("{} not found", required.display());
        }
    }

    let index = dir.join(SHARD_INDEX);
    let weights = if index.exists() {
        shard_names(&index)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    } else {
        let single = dir.join(SINGLE_WEIGHTS);
        if !single.exists() {
            bail!("no safetensors weights found under {}", dir.display());
        }
        vec![single]
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config: Some(dir.join("tokenizer_config.json")).filter(|p| p.exists()),
        weights,
    })
}

fn hub_files(model_id: &str, revision: &str) -> Result<ModelFiles> {
    info!(model_id, revision, "fetching model from the hub");
    let api = Api::new().context("failed to initialise hub client")?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config = repo.get("config.json").context("config.json")?;
    let tokenizer = repo.get("tokenizer.json").context("tokenizer.json")?;
    let tokenizer_config = match repo.get("tokenizer_config.json") {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(%err, "tokenizer_config.json unavailable");
            None
        }
    };

    let weights = match repo.get(SHARD_INDEX) {
        Ok(index) => shard_names(&index)?
            .iter()
            .map(|name| repo.get(name).with_context(|| format!("weight shard {name}")))
            .collect::<Result<Vec<_>>>()?,
        Err(_) => vec![repo.get(SINGLE_WEIGHTS).context(SINGLE_WEIGHTS)?],
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

fn shard_names(index: &Path) -> Result<Vec<String>> {
    let index_json: serde_json::Value = serde_json::from_slice(&fs::read(index)?)?;
    let mut names = index_json["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("{}: weight_map is not an object", index.display()))?
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| anyhow!("invalid shard entry in {}", index.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    // Many tensors share one shard file.
    names.sort();
    names.dedup();
    Ok(names)
}

pub fn select_device(pref: DevicePreference) -> Result<Device> {
    match pref {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "requested CUDA device {ordinal} but initialization failed ({err}). Build with the \
                 `cuda` feature and ensure CUDA libraries are available."
            )
        }),
        DevicePreference::Auto => Ok(Device::cuda_if_available(0)?),
    }
}

/// Llama-architecture chat model (TinyLlama and friends) driven by candle.
pub struct LlamaGenerator {
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos_tokens: Vec<u32>,
}

impl LlamaGenerator {
    pub fn load(files: &ModelFiles, device: Device) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Tokenizer error: {e}"))?;

        let raw: LlamaConfig = serde_json::from_slice(&fs::read(&files.config)?)
            .with_context(|| format!("invalid model config {}", files.config.display()))?;
        let config = raw.into_config(false);

        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        info!(shards = files.weights.len(), ?device, ?dtype, "loading llama weights");
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        let eos_tokens = match config.eos_token_id.clone() {
            Some(LlamaEosToks::Single(id)) => vec![id],
            Some(LlamaEosToks::Multiple(ids)) => ids,
            None => tokenizer.token_to_id("</s>").into_iter().collect(),
        };
        if eos_tokens.is_empty() {
            warn!("model declares no EOS token; generation stops only at max_new_tokens");
        }

        info!(context_window = config.max_position_embeddings, "llama model ready");

        Ok(Self {
            model,
            config,
            tokenizer,
            device,
            dtype,
            eos_tokens,
        })
    }
}

impl TextGenerator for LlamaGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Vec<String>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        let mut tokens = encoding.get_ids().to_vec();
        let prompt_len = tokens.len();

        let window = self.config.max_position_embeddings;
        if prompt_len >= window {
            bail!("prompt is {prompt_len} tokens but the context window is {window}");
        }
        let budget = params.max_new_tokens.min(window - prompt_len);

        // Fresh KV cache per call; the model weights are shared read-only.
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut processor = LogitsProcessor::from_sampling(rand::random(), params.to_sampling());
        let mut index_pos = 0usize;

        for step in 0..budget {
            let ctx: &[u32] = if step == 0 {
                &tokens
            } else {
                &tokens[tokens.len() - 1..]
            };
            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, index_pos, &mut cache)?
                .squeeze(0)?;
            index_pos += ctx.len();

            let next_id = processor.sample(&logits)?;
            if self.eos_tokens.contains(&next_id) {
                break;
            }
            tokens.push(next_id);
        }

        let completion = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))?;
        debug!(
            prompt_tokens = prompt_len,
            new_tokens = tokens.len() - prompt_len,
            "generation finished"
        );

        Ok(vec![format!("{prompt}{completion}")])
    }
}
