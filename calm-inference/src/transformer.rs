use anyhow::{Context, Result};
use half::f16;
use log::debug;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::configuration::{Activation, ModelConfig};
use crate::error::CalmResult;
use crate::kernels::matmul;
use crate::layers::{Rope, attention, clip, gelu, moe_gate, silu};
use crate::tensors::TensorStore;
use crate::weights::{CalmNaming, TensorNaming, Weights};

/// What a forward step produces besides the KV cache update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Run the classifier and return logits.
    Logits,
    /// Stop after the last layer; used while prefilling a prompt.
    UpdateKvOnly,
}

/// Runtime state for transformer inference.
///
/// All buffers are allocated once for a `(config, seq_len)` pair and overwritten every step.
#[derive(Debug)]
pub struct RunState {
    /// Residual stream
    /// Shape: [dim]
    pub x: Vec<f32>,

    /// Normalized residual stream, input of attention and FFN
    /// Shape: [dim]
    pub xb: Vec<f32>,

    /// Output of the attention and expert down projections
    /// Shape: [dim]
    pub xb2: Vec<f32>,

    /// Concatenated attention head outputs
    /// Shape: [n_heads * head_dim]
    pub xa: Vec<f32>,

    /// Shape: [hidden_dim]
    pub hb: Vec<f32>,
    /// Shape: [hidden_dim]
    pub hb2: Vec<f32>,

    /// Query, key and value of the current position
    /// Shapes: [n_heads * head_dim], [kv_dim], [kv_dim]
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,

    /// Attention scores
    /// Shape: [n_heads, seq_len]
    pub att: Vec<f32>,

    /// MoE gate logits
    /// Shape: [n_experts]
    pub moe_logits: Vec<f32>,
    /// Selected experts and their normalized weights
    /// Shape: [max(n_experts_active, 1)]
    pub expert_ids: Vec<usize>,
    pub expert_weights: Vec<f32>,

    /// Final output logits over vocabulary
    /// Shape: [vocab_size]
    pub logits: Vec<f32>,

    /// Keys: [n_layers, seq_len, kv_dim]
    pub key_cache: Vec<f16>,
    /// Values: [n_layers, seq_len, kv_dim]
    pub value_cache: Vec<f16>,
}

impl RunState {
    pub fn new(config: &ModelConfig) -> Self {
        let ModelConfig { dim, hidden_dim, n_heads, n_layers, vocab_size, seq_len, n_experts, n_experts_active, .. } =
            *config;
        let (q_dim, kv_dim) = (config.q_dim(), config.kv_dim());
        let active = if n_experts > 0 { n_experts_active } else { 1 };

        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            xa: vec![0.0; q_dim],
            hb: vec![0.0; hidden_dim],
            hb2: vec![0.0; hidden_dim],
            q: vec![0.0; q_dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; n_heads * seq_len],
            moe_logits: vec![0.0; n_experts],
            expert_ids: vec![0; active],
            expert_weights: vec![0.0; active],
            logits: vec![0.0; vocab_size],
            key_cache: vec![f16::ZERO; n_layers * seq_len * kv_dim],
            value_cache: vec![f16::ZERO; n_layers * seq_len * kv_dim],
        }
    }
}

/// KV cache slot of a position: the ring after the sinks wraps once `pos` reaches `seq_len`.
///
/// Returns `(kv_sink, kv_pos, kv_len)`.
pub fn kv_slot(pos: usize, seq_len: usize, kv_sinks: usize) -> (usize, usize, usize) {
    let kv_sink = if pos >= seq_len { kv_sinks } else { 0 };
    let kv_pos = kv_sink + (pos - kv_sink) % (seq_len - kv_sink);
    let kv_len = if pos >= seq_len { seq_len } else { pos + 1 };

    (kv_sink, kv_pos, kv_len)
}

/// A decoder-only transformer bound to a checkpoint.
///
/// Immutable and shareable across threads; every stream owns its [`RunState`].
pub struct Transformer {
    config: ModelConfig,
    store: Arc<TensorStore>,
    weights: Weights,
    rope: Rope,
}

impl Transformer {
    pub fn new(store: Arc<TensorStore>, config: ModelConfig) -> CalmResult<Self> {
        Self::with_naming(store, config, &CalmNaming)
    }

    pub fn with_naming(store: Arc<TensorStore>, config: ModelConfig, naming: &dyn TensorNaming) -> CalmResult<Self> {
        let weights = Weights::bind(&store, &config, naming)?;
        let rope = Rope::new(config.head_dim, config.rotary_dim, config.rope_theta);

        Ok(Self { config, store, weights, rope })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TensorStore> {
        &self.store
    }

    pub fn new_state(&self) -> RunState {
        RunState::new(&self.config)
    }

    /// Runs one decode step for `token` at absolute position `pos`.
    ///
    /// Returns logits borrowed from `state` (overwritten by the next call), or `None` in
    /// [`ForwardMode::UpdateKvOnly`].
    pub fn forward<'s>(&self, state: &'s mut RunState, token: usize, pos: usize, mode: ForwardMode) -> Option<&'s [f32]> {
        let config = &self.config;
        assert!(token < config.vocab_size, "token {token} is out of vocabulary range {}", config.vocab_size);

        let store = &*self.store;
        let encoding = config.encoding;
        let ModelConfig { dim, hidden_dim, head_dim, seq_len, vocab_size, .. } = *config;
        let (q_dim, kv_dim, kv_mul) = (config.q_dim(), config.kv_dim(), config.kv_mul());
        let expert_stride = encoding.row_bytes(dim) * hidden_dim;

        encoding.dequantize_row(store.slice(self.weights.embedding), token, &mut state.x);

        let (kv_sink, kv_pos, kv_len) = kv_slot(pos, seq_len, config.kv_sinks);

        for (l, layer) in self.weights.layers.iter().enumerate() {
            layer.attn_norm.forward(&mut state.xb, &state.x);

            let (bq, bk, bv) = match layer.qkv_bias.as_deref() {
                Some(bias) => {
                    let (bq, rest) = bias.split_at(q_dim);
                    let (bk, bv) = rest.split_at(kv_dim);
                    (Some(bq), Some(bk), Some(bv))
                }
                None => (None, None, None),
            };

            matmul(&mut state.q, &state.xb, store.slice(layer.wq), bq, dim, q_dim, encoding);
            matmul(&mut state.k, &state.xb, store.slice(layer.wk), bk, dim, kv_dim, encoding);
            matmul(&mut state.v, &state.xb, store.slice(layer.wv), bv, dim, kv_dim, encoding);

            clip(&mut state.q, config.qkv_clip);
            clip(&mut state.k, config.qkv_clip);
            clip(&mut state.v, config.qkv_clip);

            self.rope.apply(&mut state.q, pos as f32);
            self.rope.apply(&mut state.k, pos as f32);

            let cache_range = l * seq_len * kv_dim..(l + 1) * seq_len * kv_dim;
            let key_cache = &mut state.key_cache[cache_range.clone()];
            let value_cache = &mut state.value_cache[cache_range];

            let slot = kv_pos * kv_dim..(kv_pos + 1) * kv_dim;
            key_cache[slot.clone()].iter_mut().zip(&state.k).for_each(|(c, &k)| *c = f16::from_f32(k));
            value_cache[slot].iter_mut().zip(&state.v).for_each(|(c, &v)| *c = f16::from_f32(v));

            // Sinks keep their distance to the moving window.
            for r in 0..kv_sink {
                self.rope.apply_f16(&mut key_cache[r * kv_dim..(r + 1) * kv_dim], 1.0);
            }

            let key_cache = &*key_cache;
            let value_cache = &*value_cache;
            let q = &state.q;

            state.xa.par_chunks_mut(head_dim).zip(state.att.par_chunks_mut(seq_len)).enumerate().for_each(
                |(h, (out, att))| {
                    let q = &q[h * head_dim..(h + 1) * head_dim];
                    let head_offset = (h / kv_mul) * head_dim;
                    attention(out, att, q, key_cache, value_cache, kv_len, kv_dim, head_offset);
                },
            );

            matmul(&mut state.xb2, &state.xa, store.slice(layer.wo), None, q_dim, dim, encoding);
            state.x.iter_mut().zip(&state.xb2).for_each(|(x, &v)| *x += v);

            // Without a separate FFN norm, xb still holds the normalized layer input.
            if let Some(norm) = &layer.mlp_norm {
                norm.forward(&mut state.xb, &state.x);
            }

            match layer.moe_gate {
                Some(gate) => {
                    matmul(&mut state.moe_logits, &state.xb, store.slice(gate), None, dim, config.n_experts, encoding);
                    moe_gate(&mut state.expert_weights, &mut state.expert_ids, &state.moe_logits);
                }
                None => {
                    state.expert_ids[0] = 0;
                    state.expert_weights[0] = 1.0;
                }
            }

            for (&expert, &weight) in state.expert_ids.iter().zip(&state.expert_weights) {
                let offset = expert * expert_stride;
                let w1 = store.slice(layer.w1.subview(offset, expert_stride));
                let w2 = store.slice(layer.w2.subview(offset, expert_stride));
                let w3 = store.slice(layer.w3.subview(offset, expert_stride));

                matmul(&mut state.hb, &state.xb, w1, None, dim, hidden_dim, encoding);
                matmul(&mut state.hb2, &state.xb, w3, None, dim, hidden_dim, encoding);

                let activation = match config.activation {
                    Activation::Gelu => gelu,
                    Activation::Silu => silu,
                };
                state.hb.iter_mut().zip(&state.hb2).for_each(|(h, &h2)| *h = activation(*h) * h2);

                matmul(&mut state.xb2, &state.hb, w2, None, hidden_dim, dim, encoding);
                state.x.iter_mut().zip(&state.xb2).for_each(|(x, &v)| *x += v * weight);
            }
        }

        if mode == ForwardMode::UpdateKvOnly {
            return None;
        }

        self.weights.final_norm.forward_inplace(&mut state.x);
        matmul(&mut state.logits, &state.x, store.slice(self.weights.classifier), None, dim, vocab_size, encoding);

        Some(state.logits.as_slice())
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("rope", &self.rope)
            .field("weights", &self.weights)
            .finish()
    }
}

/// Builder pattern for creating a transformer from a checkpoint file
pub struct TransformerBuilder {
    checkpoint_path: PathBuf,
    ctx_length: Option<usize>,
}

impl TransformerBuilder {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self { checkpoint_path: checkpoint_path.as_ref().to_path_buf(), ctx_length: None }
    }

    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn build(self) -> Result<Transformer> {
        let store = TensorStore::open(&self.checkpoint_path)
            .with_context(|| format!("Failed to open checkpoint: {}", self.checkpoint_path.display()))?;

        let mut config = ModelConfig::from_store(&store).context("Failed to read model configuration")?;

        // Apply context length override if provided
        if let Some(ctx_len) = self.ctx_length {
            config = config.with_seq_len(ctx_len)?;
        }

        debug!("{config:#?}");

        Transformer::new(Arc::new(store), config).context("Failed to bind model weights")
    }
}
