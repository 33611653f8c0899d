//! # calm-export
//!
//! Converts HuggingFace models (safetensors shards plus `config.json` and `tokenizer.json`)
//! into single-file calm checkpoints.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use calm_export::{ExportOptions, export_model};
//! use calm_inference::WeightEncoding;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let options = ExportOptions { encoding: WeightEncoding::Gf4, context: Some(8192) };
//! export_model(Path::new("path/to/huggingface/model"), Path::new("model.calm"), options)?;
//! # Ok(())
//! # }
//! ```

pub mod config_loader;
pub mod model_exporter;
pub mod models;
pub mod quantization;
pub mod tensor_reader;
pub mod tokenizer_exporter;
mod utils;

pub use config_loader::{ExportOptions, ModelInfo, config_metadata, load_model_info};
pub use model_exporter::CalmModelExporter;
pub use tokenizer_exporter::{TokenizerExporter, TokenizerTensors};

use anyhow::Result;
use log::info;
use std::path::Path;

/// Exports the model at `model_path` into one checkpoint at `output_path`:
/// - matrices are encoded with `options.encoding` (fp16, fp8 or gf4)
/// - norm weights and attention biases are kept in fp32
/// - the tokenizer is stored as `tokenizer.tokens` / `tokenizer.scores`
/// - the model configuration becomes the header metadata
pub fn export_model(model_path: &Path, output_path: &Path, options: ExportOptions) -> Result<()> {
    info!("🚀 Starting model export...");
    info!("");

    let model_info = load_model_info(model_path, options)?;
    info!("");

    info!("🔤 Exporting tokenizer...");
    let tokenizer = TokenizerExporter::new().export_tokenizer(model_path, model_info.config.vocab_size)?;
    info!("");

    info!("🧮 Exporting {} weights...", model_info.config.encoding.name());
    CalmModelExporter::new(&model_info).export(model_path, output_path, &tokenizer)?;

    info!("");
    info!("✅ Export finished successfully!");
    Ok(())
}
