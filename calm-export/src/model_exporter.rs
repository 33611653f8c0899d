#[cfg(test)]
#[path = "../tests/unit/model_exporter_test.rs"]
mod model_exporter_test;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use calm_inference::tensors::layer_name;
use calm_inference::tokenizer::{SCORES_TENSOR, TOKENS_TENSOR};
use calm_inference::weights::{CalmNaming, TensorNaming, WeightRole};
use calm_inference::{DType, ModelConfig};
use log::{debug, info, warn};
use safetensors::Dtype;
use safetensors::tensor::TensorView;
use std::path::Path;

use crate::config_loader::config_metadata;
use crate::models::{TensorMapping, create_architecture, interleave_rotary};
use crate::quantization::quantize;
use crate::tensor_reader::TensorReader;
use crate::tokenizer_exporter::TokenizerTensors;
use crate::utils::ProgressTracker;
use crate::ModelInfo;

/// Layout of an output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// `[experts?, rows, cols]` matrix in the model's weight encoding.
    Matrix { experts: Option<usize>, rows: usize, cols: usize },
    /// F32 vector.
    Vector(usize),
}

impl Target {
    fn elements(self) -> usize {
        match self {
            Target::Matrix { experts, rows, cols } => experts.unwrap_or(1) * rows * cols,
            Target::Vector(len) => len,
        }
    }
}

/// A converted tensor ready for serialization.
#[derive(Debug)]
struct OutputTensor {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

/// Writes calm checkpoints: quantized matrices, F32 norms and biases, tokenizer tensors and
/// the configuration as header metadata.
pub struct CalmModelExporter {
    model_info: ModelInfo,
}

impl CalmModelExporter {
    pub fn new(model_info: &ModelInfo) -> Self {
        Self { model_info: model_info.clone() }
    }

    pub fn export(&self, model_path: &Path, output_path: &Path, tokenizer: &TokenizerTensors) -> Result<()> {
        let config = &self.model_info.config;
        let reader = TensorReader::new(model_path)?;

        let architecture = create_architecture(&self.model_info);
        let mappings = architecture.mappings(&reader);
        info!("Converting {} tensors of {:?} to {}", mappings.len(), architecture.id(), config.encoding.name());

        let progress = ProgressTracker::new(mappings.len(), "Converting");
        let mut outputs = Vec::with_capacity(mappings.len() + 2);
        let mut max_error = 0.0f32;

        for (idx, mapping) in mappings.iter().enumerate() {
            let name = layer_name(CalmNaming.template(mapping.role), mapping.layer);
            progress.set_current(idx, &name);

            let (output, error) = self.convert(&reader, mapping, name)?;
            max_error = max_error.max(error);
            outputs.push(output);
        }
        progress.set_current(mappings.len(), "done");

        outputs.extend(tokenizer_tensors(tokenizer, config.vocab_size)?);

        let views = outputs
            .iter()
            .map(|t| {
                TensorView::new(t.dtype, t.shape.clone(), &t.data)
                    .map(|view| (t.name.as_str(), view))
                    .with_context(|| format!("Invalid output tensor {}", t.name))
            })
            .collect::<Result<Vec<_>>>()?;

        safetensors::serialize_to_file(views, &Some(config_metadata(config)), output_path)
            .with_context(|| format!("Failed to write {}", output_path.display()))?;

        info!("📏 Max reconstruction error: {max_error}");
        info!("💾 Written model checkpoint to {}", output_path.display());

        if let Err(e) = reader.clear_cache() {
            warn!("Failed to clear cache: {e}");
        }

        Ok(())
    }

    /// Assembles, checks and encodes one output tensor; returns it with its encoding error.
    fn convert(&self, reader: &TensorReader, mapping: &TensorMapping, name: String) -> Result<(OutputTensor, f32)> {
        let config = &self.model_info.config;
        let target = target(config, mapping.role);

        let mut values = Vec::with_capacity(target.elements());
        for part in &mapping.parts {
            let tensor = reader.load_tensor(&part.name)?.with_context(|| format!("Missing tensor {}", part.name))?;

            match part.rotary_heads {
                Some(heads) => {
                    // Weights are [heads * head_dim, cols]; biases are vectors.
                    let cols = if tensor.shape.len() > 1 { tensor.shape[tensor.shape.len() - 1] } else { 1 };
                    if tensor.data.len() != heads * config.head_dim * cols {
                        anyhow::bail!(
                            "Tensor {} has shape {:?}, expected {heads} heads of {} rows",
                            part.name,
                            tensor.shape,
                            config.head_dim
                        );
                    }
                    values.extend(interleave_rotary(&tensor.data, heads, config.head_dim, config.rotary_dim, cols));
                }
                None => values.extend(tensor.data),
            }
        }

        if values.len() != target.elements() {
            anyhow::bail!("Tensor {name} has {} values, expected {} for {target:?}", values.len(), target.elements());
        }

        match target {
            Target::Matrix { experts, rows, cols } => {
                let encoding = config.encoding;
                let quantized = quantize(encoding, &values, cols).with_context(|| format!("Cannot encode {name}"))?;
                debug!("{name}: {} error {}", encoding.name(), quantized.max_error);

                let mut shape: Vec<usize> = experts.into_iter().collect();
                shape.extend([rows, cols / encoding.group_size()]);

                let output = OutputTensor { name, dtype: to_dtype(encoding.dtype()), shape, data: quantized.bytes };
                Ok((output, quantized.max_error))
            }
            Target::Vector(len) => {
                let mut data = vec![0u8; len * 4];
                LittleEndian::write_f32_into(&values, &mut data);
                Ok((OutputTensor { name, dtype: Dtype::F32, shape: vec![len], data }, 0.0))
            }
        }
    }
}

/// Output layout of `role` as the engine binds it.
fn target(config: &ModelConfig, role: WeightRole) -> Target {
    let ModelConfig { dim, hidden_dim, vocab_size, n_experts, .. } = *config;
    let (q_dim, kv_dim) = (config.q_dim(), config.kv_dim());
    let experts = (n_experts > 0).then_some(n_experts);

    let matrix = |rows, cols| Target::Matrix { experts: None, rows, cols };
    match role {
        WeightRole::Embedding | WeightRole::Classifier => matrix(vocab_size, dim),
        WeightRole::FinalNorm | WeightRole::AttnNorm | WeightRole::MlpNorm => Target::Vector(dim),
        WeightRole::Wq => matrix(q_dim, dim),
        WeightRole::Wk | WeightRole::Wv => matrix(kv_dim, dim),
        WeightRole::Wo => matrix(dim, q_dim),
        WeightRole::QkvBias => Target::Vector(q_dim + 2 * kv_dim),
        WeightRole::MoeGate => matrix(n_experts, dim),
        WeightRole::W1 | WeightRole::W3 => Target::Matrix { experts, rows: hidden_dim, cols: dim },
        WeightRole::W2 => Target::Matrix { experts, rows: dim, cols: hidden_dim },
    }
}

/// `tokenizer.tokens` as U8 and `tokenizer.scores` as F32.
fn tokenizer_tensors(tokenizer: &TokenizerTensors, vocab_size: usize) -> Result<[OutputTensor; 2]> {
    if tokenizer.scores.len() != vocab_size {
        anyhow::bail!("Tokenizer has {} scores for a vocabulary of {vocab_size}", tokenizer.scores.len());
    }

    let mut scores = vec![0u8; vocab_size * 4];
    LittleEndian::write_f32_into(&tokenizer.scores, &mut scores);

    Ok([
        OutputTensor {
            name: TOKENS_TENSOR.to_string(),
            dtype: Dtype::U8,
            shape: vec![tokenizer.tokens.len()],
            data: tokenizer.tokens.clone(),
        },
        OutputTensor { name: SCORES_TENSOR.to_string(), dtype: Dtype::F32, shape: vec![vocab_size], data: scores },
    ])
}

fn to_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F32 => Dtype::F32,
        DType::F16 => Dtype::F16,
        DType::BF16 => Dtype::BF16,
        DType::F8E5M2 => Dtype::F8_E5M2,
        DType::F8E4M3 => Dtype::F8_E4M3,
        DType::I32 => Dtype::I32,
        DType::I16 => Dtype::I16,
        DType::I8 => Dtype::I8,
        DType::U8 => Dtype::U8,
    }
}
