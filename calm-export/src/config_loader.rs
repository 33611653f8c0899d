#[cfg(test)]
#[path = "../tests/unit/config_loader_test.rs"]
mod config_loader_test;

use anyhow::{Context, Result};
use calm_inference::configuration::{Activation, Normalization};
use calm_inference::{ModelConfig, WeightEncoding};
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::models::ArchitectureId;

/// Context length written when `config.json` does not declare one.
const FALLBACK_SEQ_LEN: usize = 4096;

/// Everything the exporter needs to know about a source model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub architecture: ArchitectureId,
    pub config: ModelConfig,
    pub tie_word_embeddings: bool,
}

/// Export options chosen by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub encoding: WeightEncoding,
    /// Caps the context length stored in the checkpoint.
    pub context: Option<usize>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { encoding: WeightEncoding::Fp8, context: None }
    }
}

/// `bos_token_id` / `eos_token_id` may be a single id or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    fn first(&self) -> Option<u32> {
        match self {
            TokenIds::Single(id) => Some(*id),
            TokenIds::Many(ids) => ids.first().copied(),
        }
    }
}

/// Fields of a HuggingFace `config.json` used by the supported architectures.
#[derive(Debug, Deserialize)]
struct HfConfig {
    hidden_size: usize,
    intermediate_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    #[serde(default)]
    num_key_value_heads: Option<usize>,
    vocab_size: usize,
    #[serde(default)]
    max_position_embeddings: Option<usize>,
    #[serde(default)]
    rms_norm_eps: Option<f32>,
    #[serde(default)]
    rope_theta: Option<f32>,
    #[serde(default)]
    head_dim: Option<usize>,
    #[serde(default)]
    partial_rotary_factor: Option<f32>,
    #[serde(default)]
    num_local_experts: Option<usize>,
    #[serde(default)]
    num_experts_per_tok: Option<usize>,
    #[serde(default)]
    hidden_act: Option<String>,
    #[serde(default)]
    hidden_activation: Option<String>,
    #[serde(default)]
    tie_word_embeddings: Option<bool>,
    #[serde(default)]
    bos_token_id: Option<TokenIds>,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    architectures: Option<Vec<String>>,
}

/// Loads `config.json` from a model directory.
pub fn load_model_info(model_path: &Path, options: ExportOptions) -> Result<ModelInfo> {
    let config_path = model_path.join("config.json");
    if !config_path.exists() {
        anyhow::bail!("No config.json found in {}", model_path.display());
    }

    load_hf_config(&config_path, options)
}

/// Parses a HuggingFace configuration into a validated [`ModelConfig`].
fn load_hf_config(config_path: &Path, options: ExportOptions) -> Result<ModelInfo> {
    let contents = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to open config.json at {}", config_path.display()))?;

    let hf: HfConfig =
        serde_json::from_str(&contents).map_err(|err| anyhow::anyhow!("Failed to parse config.json: {err}"))?;

    let architecture = match hf.architectures.as_deref() {
        Some([single]) => ArchitectureId::try_from(single.as_str())?,
        Some([]) | None => anyhow::bail!("Cannot determine architecture"),
        Some(many) => anyhow::bail!("Multiple architectures are not supported: {many:?}"),
    };

    if hf.num_attention_heads == 0 {
        anyhow::bail!("num_attention_heads must be positive");
    }

    let head_dim = hf.head_dim.unwrap_or(hf.hidden_size / hf.num_attention_heads);
    let rotary_dim = match hf.partial_rotary_factor {
        Some(factor) => (head_dim as f32 * factor) as usize,
        None => head_dim,
    };

    let activation = match hf.hidden_act.as_deref().or(hf.hidden_activation.as_deref()) {
        Some(act) if act.starts_with("gelu") => Activation::Gelu,
        Some("silu") | Some("swish") | None => Activation::Silu,
        Some(other) => {
            warn!("Unknown activation '{other}', using SiLU");
            Activation::Silu
        }
    };

    let declared_seq_len = hf.max_position_embeddings.unwrap_or_else(|| {
        warn!("max_position_embeddings is not set, using {FALLBACK_SEQ_LEN}");
        FALLBACK_SEQ_LEN
    });
    let seq_len = options.context.map_or(declared_seq_len, |context| context.min(declared_seq_len));

    let draft = ModelConfig {
        encoding: options.encoding,
        dim: hf.hidden_size,
        hidden_dim: hf.intermediate_size,
        head_dim,
        rotary_dim,
        n_layers: hf.num_hidden_layers,
        n_heads: hf.num_attention_heads,
        n_kv_heads: hf.num_key_value_heads.unwrap_or(hf.num_attention_heads),
        vocab_size: hf.vocab_size,
        seq_len,
        rope_theta: hf.rope_theta.unwrap_or(10000.0),
        n_experts: hf.num_local_experts.unwrap_or(0),
        n_experts_active: hf.num_experts_per_tok.unwrap_or(0),
        norm_eps: hf.rms_norm_eps.unwrap_or(1e-5),
        activation,
        normalization: Normalization::RmsNorm,
        qkv_clip: f32::MAX,
        kv_sinks: calm_inference::configuration::KV_SINKS,
        bos_token_id: hf.bos_token_id.as_ref().and_then(TokenIds::first),
        eos_token_id: hf.eos_token_id.as_ref().and_then(TokenIds::first),
    };

    // Round-trip through the metadata reader so the exported header is known to load.
    let metadata = config_metadata(&draft);
    let config = ModelConfig::from_metadata(|key| metadata.get(key).map(String::as_str))
        .context("Model configuration is not supported by the inference engine")?;

    info!("Model configuration loaded:");
    info!("   • Architecture: {architecture:?}");
    info!("   • Encoding: {}", config.encoding.name());
    info!("   • Dimensions: {} (hidden {})", config.dim, config.hidden_dim);
    info!("   • Layers: {}", config.n_layers);
    info!("   • Attention heads: {} (KV {})", config.n_heads, config.n_kv_heads);
    info!("   • Head dimension: {} (rotary {})", config.head_dim, config.rotary_dim);
    if config.n_experts > 0 {
        info!("   • Experts: {} ({} active)", config.n_experts, config.n_experts_active);
    }
    info!("   • Vocabulary size: {}", config.vocab_size);
    info!("   • Context length: {}", config.seq_len);

    Ok(ModelInfo { architecture, config, tie_word_embeddings: hf.tie_word_embeddings.unwrap_or(false) })
}

/// Checkpoint metadata describing `config`.
pub fn config_metadata(config: &ModelConfig) -> HashMap<String, String> {
    let mut metadata: HashMap<String, String> = [
        ("dtype", config.encoding.name().to_string()),
        ("dim", config.dim.to_string()),
        ("hidden_dim", config.hidden_dim.to_string()),
        ("head_dim", config.head_dim.to_string()),
        ("rotary_dim", config.rotary_dim.to_string()),
        ("n_layers", config.n_layers.to_string()),
        ("n_heads", config.n_heads.to_string()),
        ("n_kv_heads", config.n_kv_heads.to_string()),
        ("vocab_size", config.vocab_size.to_string()),
        ("max_seq_len", config.seq_len.to_string()),
        ("rope_theta", config.rope_theta.to_string()),
        ("n_experts", config.n_experts.to_string()),
        ("n_experts_active", config.n_experts_active.to_string()),
        ("norm_eps", config.norm_eps.to_string()),
        (
            "act_type",
            match config.activation {
                Activation::Gelu => "gelu",
                Activation::Silu => "silu",
            }
            .to_string(),
        ),
        (
            "norm_type",
            match config.normalization {
                Normalization::RmsNorm => "rmsnorm",
                Normalization::LayerNorm => "layernorm",
                Normalization::LayerNormParallel => "layernorm_par",
            }
            .to_string(),
        ),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect();

    if config.qkv_clip < f32::MAX {
        metadata.insert("qkv_clip".to_string(), config.qkv_clip.to_string());
    }
    if let Some(id) = config.bos_token_id {
        metadata.insert("bos_token_id".to_string(), id.to_string());
    }
    if let Some(id) = config.eos_token_id {
        metadata.insert("eos_token_id".to_string(), id.to_string());
    }

    metadata
}
