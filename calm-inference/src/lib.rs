//! Inference engine for quantized decoder-only transformer checkpoints.
//!
//! Loads a checkpoint container, runs the forward pass with a KV cache and attention sinks,
//! and generates text with the embedded BPE tokenizer and a min-p sampler.

pub mod configuration;
pub mod error;
pub mod generation;
mod inspect;
pub mod kernels;
pub mod layers;
pub mod sampler;
pub mod tensors;
pub mod tokenizer;
pub mod transformer;
mod utils;
pub mod weights;

use anyhow::{Context, Result};
use log::debug;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::configuration::ModelConfig;
pub use crate::error::{CalmError, CalmResult};
pub use crate::inspect::inspect_checkpoint;
pub use crate::kernels::WeightEncoding;
pub use crate::sampler::Sampler;
pub use crate::tensors::{DType, Tensor, TensorStore};
pub use crate::tokenizer::{EncodeFlags, Tokenizer};
pub use crate::transformer::{ForwardMode, RunState, Transformer, TransformerBuilder};

use crate::generation::{chat, generate, study};

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub checkpoint_path: String,
    pub temperature: f32,
    pub min_p: f32,
    pub ctx_length: Option<usize>,
    pub mode: String,
    pub steps: usize,
    pub prompt: Option<String>,
    pub prompt_file: Option<String>,
    pub system_prompt: Option<String>,
    pub seed: u64,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    checkpoint_path: Option<String>,
    temperature: Option<f32>,
    min_p: Option<f32>,
    ctx_length: Option<usize>,
    mode: Option<String>,
    steps: Option<usize>,
    prompt: Option<String>,
    prompt_file: Option<String>,
    system_prompt: Option<String>,
    seed: Option<u64>,
}

impl InferenceConfigBuilder {
    pub fn checkpoint_path(mut self, path: Option<&String>) -> Self {
        self.checkpoint_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn min_p(mut self, min_p: Option<f32>) -> Self {
        self.min_p = min_p;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn mode(mut self, mode: Option<&String>) -> Self {
        self.mode = mode.cloned();
        self
    }
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn prompt_file(mut self, path: Option<&String>) -> Self {
        self.prompt_file = path.cloned();
        self
    }
    pub fn system_prompt(mut self, system_prompt: Option<&String>) -> Self {
        self.system_prompt = system_prompt.cloned();
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        let temperature = self.temperature.unwrap_or(1.0);
        if temperature.is_nan() || temperature < 0.0 {
            return Err(format!("temperature must be non-negative, got {temperature}"));
        }

        let min_p = self.min_p.unwrap_or(0.1);
        if !(0.0..=1.0).contains(&min_p) {
            return Err(format!("min_p must be between 0.0 and 1.0, got {min_p}"));
        }

        Ok(InferenceConfig {
            checkpoint_path: self.checkpoint_path.ok_or("checkpoint_path is required")?,
            temperature,
            min_p,
            ctx_length: self.ctx_length,
            mode: self.mode.unwrap_or_else(|| "generate".to_string()),
            steps: self.steps.unwrap_or(256),
            prompt: self.prompt,
            prompt_file: self.prompt_file,
            system_prompt: self.system_prompt,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
            }),
        })
    }
}

/// Runs inference.
pub fn run_inference(inference_config: InferenceConfig) -> Result<()> {
    debug!("{inference_config:#?}");

    let transformer = TransformerBuilder::new(&inference_config.checkpoint_path)
        .with_ctx_length(inference_config.ctx_length)
        .build()?;

    debug!("{transformer:#?}");

    let model_config = transformer.config();

    let tokenizer = Tokenizer::from_store(
        transformer.store(),
        model_config.vocab_size,
        model_config.bos_token_id,
        model_config.eos_token_id,
    )
    .context("Failed to load tokenizer")?;

    debug!("{tokenizer:#?}");

    let mut sampler = Sampler::new(
        model_config.vocab_size,
        inference_config.temperature,
        inference_config.min_p,
        inference_config.seed,
    );
    let mut state = transformer.new_state();

    let prompt = match &inference_config.prompt_file {
        Some(path) => Some(std::fs::read_to_string(path).with_context(|| format!("Failed to read prompt file: {path}"))?),
        None => inference_config.prompt.clone(),
    };
    let prompt = prompt.as_deref();
    let system_prompt = inference_config.system_prompt.as_deref();
    let steps = inference_config.steps;

    let mut out = io::stdout().lock();

    // Run
    match inference_config.mode.as_str() {
        "generate" => {
            generate(&transformer, &mut state, &tokenizer, &mut sampler, prompt.unwrap_or(""), steps, &mut out)?;
        }
        "chat" => chat(
            &transformer,
            &mut state,
            &tokenizer,
            &mut sampler,
            prompt,
            system_prompt,
            steps,
            &mut io::stdin().lock(),
            &mut out,
        )?,
        "study" => {
            let text = prompt.context("study mode needs a prompt or a prompt file")?;
            study(&transformer, &mut state, &tokenizer, text, &mut out)?;
        }
        _ => anyhow::bail!("Unknown mode: {}", inference_config.mode),
    }

    Ok(())
}
