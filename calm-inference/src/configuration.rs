#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use log::warn;
use std::str::FromStr;

use crate::error::{CalmError, CalmResult};
use crate::kernels::WeightEncoding;
use crate::tensors::TensorStore;

/// Number of leading KV cache slots kept as attention sinks once the context wraps.
pub const KV_SINKS: usize = 2;
/// Context length used when the checkpoint does not declare one.
const DEFAULT_SEQ_LEN: usize = 4096;
const DEFAULT_ROPE_THETA: f32 = 10000.0;
const DEFAULT_NORM_EPS: f32 = 1e-5;
/// Experts are tracked with a u64 mask during gating.
const MAX_EXPERTS: usize = 64;

/// FFN gating activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Silu,
    Gelu,
}

/// Normalization flavor of the residual stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    RmsNorm,
    LayerNorm,
    /// LayerNorm where attention and FFN share one normalization of the layer input.
    LayerNormParallel,
}

impl Normalization {
    pub fn subtracts_mean(self) -> bool {
        !matches!(self, Normalization::RmsNorm)
    }

    pub fn is_parallel(self) -> bool {
        matches!(self, Normalization::LayerNormParallel)
    }
}

/// Model hyper-parameters read from checkpoint metadata.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub encoding: WeightEncoding,
    pub dim: usize,
    pub hidden_dim: usize,
    pub head_dim: usize,
    pub rotary_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    pub rope_theta: f32,
    pub n_experts: usize,
    pub n_experts_active: usize,
    pub norm_eps: f32,
    pub activation: Activation,
    pub normalization: Normalization,
    pub qkv_clip: f32,
    pub kv_sinks: usize,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
}

impl ModelConfig {
    pub fn from_store(store: &TensorStore) -> CalmResult<Self> {
        Self::from_metadata(|key| store.metadata(key))
    }

    /// Builds and validates a configuration from a metadata lookup.
    pub fn from_metadata<'a, F>(lookup: F) -> CalmResult<Self>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let encoding = WeightEncoding::from_name(lookup("dtype").ok_or_else(|| missing("dtype"))?)?;

        let dim: usize = required(&lookup, "dim")?;
        let hidden_dim = required(&lookup, "hidden_dim")?;
        let n_layers = required(&lookup, "n_layers")?;
        let n_heads: usize = required(&lookup, "n_heads")?;
        let vocab_size = required(&lookup, "vocab_size")?;

        let n_kv_heads = optional(&lookup, "n_kv_heads")?.unwrap_or_else(|| {
            warn!("n_kv_heads is not set, using n_heads = {n_heads}");
            n_heads
        });

        if n_heads == 0 {
            return Err(CalmError::config("n_heads must be positive"));
        }
        let head_dim = optional(&lookup, "head_dim")?.unwrap_or_else(|| {
            warn!("head_dim is not set, using dim / n_heads = {}", dim / n_heads);
            dim / n_heads
        });
        let rotary_dim = optional(&lookup, "rotary_dim")?.unwrap_or_else(|| {
            warn!("rotary_dim is not set, using head_dim = {head_dim}");
            head_dim
        });

        let n_experts = match optional(&lookup, "n_experts")? {
            Some(value) => value,
            None => optional(&lookup, "n_exports")?.unwrap_or(0),
        };
        let n_experts_active = match optional(&lookup, "n_experts_active")? {
            Some(value) => value,
            None => optional(&lookup, "n_experts_ac")?.unwrap_or(0),
        };

        let activation = match lookup("act_type") {
            Some("gelu") => Activation::Gelu,
            _ => Activation::Silu,
        };
        let normalization = match lookup("norm_type") {
            Some("layernorm_par") => Normalization::LayerNormParallel,
            Some(kind) if kind.starts_with("layernorm") => Normalization::LayerNorm,
            _ => Normalization::RmsNorm,
        };

        let config = ModelConfig {
            encoding,
            dim,
            hidden_dim,
            head_dim,
            rotary_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            vocab_size,
            seq_len: optional(&lookup, "max_seq_len")?.unwrap_or(DEFAULT_SEQ_LEN),
            rope_theta: optional(&lookup, "rope_theta")?.unwrap_or(DEFAULT_ROPE_THETA),
            n_experts,
            n_experts_active,
            norm_eps: optional(&lookup, "norm_eps")?.unwrap_or(DEFAULT_NORM_EPS),
            activation,
            normalization,
            qkv_clip: optional(&lookup, "qkv_clip")?.unwrap_or(f32::MAX),
            kv_sinks: KV_SINKS,
            bos_token_id: token_id(&lookup, "bos_token_id")?,
            eos_token_id: token_id(&lookup, "eos_token_id")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Overrides the context length, e.g. from the command line.
    pub fn with_seq_len(mut self, seq_len: usize) -> CalmResult<Self> {
        self.seq_len = seq_len;
        self.validate()?;
        Ok(self)
    }

    pub fn q_dim(&self) -> usize {
        self.n_heads * self.head_dim
    }

    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Query heads sharing one KV head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Validates the configuration to ensure the forward pass supports it.
    fn validate(&self) -> CalmResult<()> {
        let dimensions = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("head_dim", self.head_dim),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                return Err(CalmError::config(format!("{name} must be positive")));
            }
        }

        if self.n_heads % self.n_kv_heads != 0 {
            return Err(CalmError::config(format!(
                "n_heads ({}) must be divisible by n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }

        if self.head_dim % 2 != 0 || self.rotary_dim % 2 != 0 || self.rotary_dim > self.head_dim {
            return Err(CalmError::config(format!(
                "rotary_dim ({}) and head_dim ({}) must be even with rotary_dim <= head_dim",
                self.rotary_dim, self.head_dim
            )));
        }

        let group_size = self.encoding.group_size();
        for (name, value) in [("dim", self.dim), ("hidden_dim", self.hidden_dim), ("n_heads * head_dim", self.q_dim())] {
            if value % group_size != 0 {
                return Err(CalmError::config(format!(
                    "{name} ({value}) must be divisible by {group_size} for {} weights",
                    self.encoding.name()
                )));
            }
        }

        if self.n_experts >= MAX_EXPERTS {
            return Err(CalmError::config(format!("n_experts ({}) must be below {MAX_EXPERTS}", self.n_experts)));
        }
        if self.n_experts > 0 && !(1..=self.n_experts).contains(&self.n_experts_active) {
            return Err(CalmError::config(format!(
                "n_experts_active ({}) must be in 1..={}",
                self.n_experts_active, self.n_experts
            )));
        }

        if self.seq_len <= self.kv_sinks {
            return Err(CalmError::config(format!(
                "seq_len ({}) must exceed the {} attention sinks",
                self.seq_len, self.kv_sinks
            )));
        }

        let numeric_ok = self.qkv_clip > 0.0 && self.norm_eps >= 0.0 && self.rope_theta.is_finite();
        if !numeric_ok {
            return Err(CalmError::config(format!(
                "invalid numeric parameters: qkv_clip {}, norm_eps {}, rope_theta {}",
                self.qkv_clip, self.norm_eps, self.rope_theta
            )));
        }

        Ok(())
    }
}

fn missing(key: &str) -> CalmError {
    CalmError::config(format!("missing metadata key '{key}'"))
}

fn optional<'a, T, F>(lookup: &F, key: &str) -> CalmResult<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<&'a str>,
{
    lookup(key)
        .map(|value| {
            value.trim().parse().map_err(|_| CalmError::config(format!("invalid value '{value}' for metadata key '{key}'")))
        })
        .transpose()
}

fn required<'a, T, F>(lookup: &F, key: &str) -> CalmResult<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<&'a str>,
{
    optional(lookup, key)?.ok_or_else(|| missing(key))
}

/// Special token ids; negative values mark an absent token.
fn token_id<'a, F>(lookup: &F, key: &str) -> CalmResult<Option<u32>>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let id: Option<i64> = optional(lookup, key)?;
    Ok(id.and_then(|id| u32::try_from(id).ok()))
}
