//! Source tensor layouts of the supported HuggingFace architectures.

#[cfg(test)]
#[path = "../../tests/unit/models_test.rs"]
mod models_test;

use anyhow::Result;
use calm_inference::weights::WeightRole;

use crate::ModelInfo;
use crate::tensor_reader::TensorReader;

mod llama;

pub use llama::Llama;

/// Architectures the exporter can convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureId {
    LlamaForCausalLM,
    MistralForCausalLM,
    Qwen2ForCausalLM,
    MixtralForCausalLM,
}

impl TryFrom<&str> for ArchitectureId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "LlamaForCausalLM" => Ok(Self::LlamaForCausalLM),
            "MistralForCausalLM" => Ok(Self::MistralForCausalLM),
            "Qwen2ForCausalLM" => Ok(Self::Qwen2ForCausalLM),
            "MixtralForCausalLM" => Ok(Self::MixtralForCausalLM),
            _ => anyhow::bail!("Unsupported architecture: {value}"),
        }
    }
}

/// One source tensor contributing to an output tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePart {
    pub name: String,
    /// Heads whose rotary rows are stored half-split and must be interleaved.
    pub rotary_heads: Option<usize>,
}

impl SourcePart {
    pub fn plain(name: String) -> Self {
        Self { name, rotary_heads: None }
    }

    pub fn rotary(name: String, heads: usize) -> Self {
        Self { name, rotary_heads: Some(heads) }
    }
}

/// Output tensor assembled from the flat concatenation of its parts.
///
/// Concatenation covers both bias fusion (`[q | k | v]`) and expert stacking (`[E, rows, cols]`).
#[derive(Debug, Clone)]
pub struct TensorMapping {
    pub role: WeightRole,
    pub layer: usize,
    pub parts: Vec<SourcePart>,
}

impl TensorMapping {
    pub fn new(role: WeightRole, layer: usize, parts: Vec<SourcePart>) -> Self {
        Self { role, layer, parts }
    }
}

pub trait Architecture {
    fn id(&self) -> ArchitectureId;

    /// Every output tensor in write order; optional tensors are listed only when present.
    fn mappings(&self, reader: &TensorReader) -> Vec<TensorMapping>;
}

pub fn create_architecture(model_info: &ModelInfo) -> Box<dyn Architecture> {
    match model_info.architecture {
        ArchitectureId::LlamaForCausalLM
        | ArchitectureId::MistralForCausalLM
        | ArchitectureId::Qwen2ForCausalLM
        | ArchitectureId::MixtralForCausalLM => Box::new(Llama::new(model_info)),
    }
}

/// Reorders the rotary rows of every head from the half-split layout (`x[i]` pairs with
/// `x[i + r/2]`) to interleaved pairs (`x[2i]`, `x[2i + 1]`).
///
/// `values` holds `heads * head_dim` rows of `cols` values; channels past `rotary_dim` are kept.
pub fn interleave_rotary(values: &[f32], heads: usize, head_dim: usize, rotary_dim: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(values.len(), heads * head_dim * cols);

    let half = rotary_dim / 2;
    let mut out = values.to_vec();

    for head in 0..heads {
        let base = head * head_dim;
        for i in 0..half {
            for (target, source) in [(2 * i, i), (2 * i + 1, i + half)] {
                let dst = (base + target) * cols;
                let src = (base + source) * cols;
                out[dst..dst + cols].copy_from_slice(&values[src..src + cols]);
            }
        }
    }

    out
}
