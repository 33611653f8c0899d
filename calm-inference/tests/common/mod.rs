//! Synthetic checkpoints for integration tests.
//!
//! Containers are written with `safetensors::serialize`, which produces the same layout the
//! engine reads, so the tests do not depend on the engine's own writer.

#![allow(dead_code)]

use calm_inference::WeightEncoding;
use half::f16;
use safetensors::Dtype;
use safetensors::tensor::TensorView;
use std::collections::HashMap;

pub const BOS: u32 = 1;
pub const EOS: u32 = 2;

/// Tokens of the synthetic vocabulary: control tokens, letters, space, one merge and an end of turn.
pub fn vocab_tokens() -> Vec<String> {
    let mut tokens = vec!["<unk>".to_string(), "<s>".to_string(), "</s>".to_string()];
    tokens.extend((b'a'..=b'z').map(|c| (c as char).to_string()));
    tokens.push(" ".to_string());
    tokens.push("ab".to_string());
    tokens.push("<|im_end|>".to_string());
    tokens
}

pub const VOCAB_SIZE: usize = 32;

/// Deterministic generator for weights.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    /// Uniform in [-1, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 7) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
    }
}

pub fn fp8_decode(byte: u8) -> f32 {
    f16::from_bits((byte as u16) << 8).to_f32()
}

/// An encoded weight matrix together with the exact values it decodes to.
#[derive(Clone)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
    pub bytes: Vec<u8>,
}

impl Matrix {
    pub fn random(rng: &mut Lcg, encoding: WeightEncoding, rows: usize, cols: usize) -> Self {
        let mut values = Vec::with_capacity(rows * cols);
        let mut bytes = Vec::new();

        match encoding {
            WeightEncoding::Fp16 => {
                for _ in 0..rows * cols {
                    let half = f16::from_f32(rng.next_f32() * 0.5);
                    values.push(half.to_f32());
                    bytes.extend_from_slice(&half.to_le_bytes());
                }
            }
            WeightEncoding::Fp8 => {
                for _ in 0..rows * cols {
                    let byte = (f16::from_f32(rng.next_f32() * 0.5).to_bits() >> 8) as u8;
                    values.push(fp8_decode(byte));
                    bytes.push(byte);
                }
            }
            WeightEncoding::Gf4 => {
                for _ in 0..rows * cols / 8 {
                    let scale_byte = 0xB0 + (rng.next_u32() % 8) as u8;
                    let scale = fp8_decode(scale_byte) / -4.0;
                    let mut word = scale_byte as u32;
                    for k in 0..8 {
                        let q = rng.next_u32() % 8;
                        word |= q << (8 + 3 * k);
                        values.push((q as i32 - 4) as f32 * scale);
                    }
                    bytes.extend_from_slice(&word.to_le_bytes());
                }
            }
        }

        Self { rows, cols, values, bytes }
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.values[row * self.cols..(row + 1) * self.cols]
    }

    /// `W · x`
    pub fn apply(&self, x: &[f32]) -> Vec<f32> {
        (0..self.rows)
            .map(|r| self.row(r).iter().zip(x).fold(0.0f32, |acc, (&w, &x)| acc + w * x))
            .collect()
    }
}

/// Shape and flavor of a synthetic model.
#[derive(Debug, Clone)]
pub struct TinyParams {
    pub encoding: WeightEncoding,
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub rotary_dim: usize,
    pub seq_len: usize,
    pub n_experts: usize,
    pub n_experts_active: usize,
    pub norm_type: &'static str,
    pub gelu: bool,
    pub qkv_clip: Option<f32>,
    pub bias: bool,
    pub tied: bool,
    pub rope_theta: f32,
    pub norm_eps: f32,
}

impl Default for TinyParams {
    fn default() -> Self {
        Self {
            encoding: WeightEncoding::Fp16,
            dim: 16,
            hidden_dim: 32,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 4,
            rotary_dim: 4,
            seq_len: 16,
            n_experts: 0,
            n_experts_active: 0,
            norm_type: "rmsnorm",
            gelu: false,
            qkv_clip: None,
            bias: false,
            tied: false,
            rope_theta: 10000.0,
            norm_eps: 1e-5,
        }
    }
}

pub struct TinyLayer {
    pub attn_norm: Vec<f32>,
    pub mlp_norm: Option<Vec<f32>>,
    pub wq: Matrix,
    pub wk: Matrix,
    pub wv: Matrix,
    pub wo: Matrix,
    pub bias: Option<Vec<f32>>,
    pub gate: Option<Matrix>,
    pub w1: Vec<Matrix>,
    pub w2: Vec<Matrix>,
    pub w3: Vec<Matrix>,
}

pub struct TinyModel {
    pub params: TinyParams,
    pub embed: Matrix,
    pub output: Option<Matrix>,
    pub final_norm: Vec<f32>,
    pub layers: Vec<TinyLayer>,
}

/// A raw tensor ready to be serialized.
pub struct RawTensor {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

fn norm_weights(rng: &mut Lcg, dim: usize) -> Vec<f32> {
    (0..dim).map(|_| 1.0 + 0.1 * rng.next_f32()).collect()
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

impl TinyModel {
    pub fn new(params: TinyParams, seed: u64) -> Self {
        let mut rng = Lcg::new(seed);
        let enc = params.encoding;
        let q_dim = params.n_heads * params.head_dim;
        let kv_dim = params.n_kv_heads * params.head_dim;
        let experts = params.n_experts.max(1);

        let embed = Matrix::random(&mut rng, enc, VOCAB_SIZE, params.dim);
        let output = (!params.tied).then(|| Matrix::random(&mut rng, enc, VOCAB_SIZE, params.dim));
        let final_norm = norm_weights(&mut rng, params.dim);

        let layers = (0..params.n_layers)
            .map(|_| TinyLayer {
                attn_norm: norm_weights(&mut rng, params.dim),
                mlp_norm: (params.norm_type != "layernorm_par").then(|| norm_weights(&mut rng, params.dim)),
                wq: Matrix::random(&mut rng, enc, q_dim, params.dim),
                wk: Matrix::random(&mut rng, enc, kv_dim, params.dim),
                wv: Matrix::random(&mut rng, enc, kv_dim, params.dim),
                wo: Matrix::random(&mut rng, enc, params.dim, q_dim),
                bias: params.bias.then(|| (0..q_dim + 2 * kv_dim).map(|_| 0.1 * rng.next_f32()).collect()),
                gate: (params.n_experts > 0).then(|| Matrix::random(&mut rng, enc, params.n_experts, params.dim)),
                w1: (0..experts).map(|_| Matrix::random(&mut rng, enc, params.hidden_dim, params.dim)).collect(),
                w2: (0..experts).map(|_| Matrix::random(&mut rng, enc, params.dim, params.hidden_dim)).collect(),
                w3: (0..experts).map(|_| Matrix::random(&mut rng, enc, params.hidden_dim, params.dim)).collect(),
            })
            .collect();

        Self { params, embed, output, final_norm, layers }
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        let s = &self.params;
        let mut metadata: HashMap<String, String> = [
            ("dtype", s.encoding.name().to_string()),
            ("dim", s.dim.to_string()),
            ("hidden_dim", s.hidden_dim.to_string()),
            ("n_layers", s.n_layers.to_string()),
            ("n_heads", s.n_heads.to_string()),
            ("n_kv_heads", s.n_kv_heads.to_string()),
            ("head_dim", s.head_dim.to_string()),
            ("rotary_dim", s.rotary_dim.to_string()),
            ("vocab_size", VOCAB_SIZE.to_string()),
            ("max_seq_len", s.seq_len.to_string()),
            ("rope_theta", s.rope_theta.to_string()),
            ("norm_eps", s.norm_eps.to_string()),
            ("norm_type", s.norm_type.to_string()),
            ("act_type", if s.gelu { "gelu" } else { "silu" }.to_string()),
            ("n_experts", s.n_experts.to_string()),
            ("n_experts_active", s.n_experts_active.to_string()),
            ("bos_token_id", BOS.to_string()),
            ("eos_token_id", EOS.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        if let Some(clip) = s.qkv_clip {
            metadata.insert("qkv_clip".to_string(), clip.to_string());
        }
        metadata
    }

    fn weight_dtype(&self) -> Dtype {
        match self.params.encoding {
            WeightEncoding::Gf4 => Dtype::I32,
            WeightEncoding::Fp8 => Dtype::F8_E5M2,
            WeightEncoding::Fp16 => Dtype::F16,
        }
    }

    fn matrix_tensor(&self, name: String, matrix: &Matrix) -> RawTensor {
        let g = self.params.encoding.group_size();
        RawTensor { name, dtype: self.weight_dtype(), shape: vec![matrix.rows, matrix.cols / g], data: matrix.bytes.clone() }
    }

    fn expert_tensor(&self, name: String, experts: &[Matrix]) -> RawTensor {
        if self.params.n_experts == 0 {
            return self.matrix_tensor(name, &experts[0]);
        }
        let g = self.params.encoding.group_size();
        RawTensor {
            name,
            dtype: self.weight_dtype(),
            shape: vec![experts.len(), experts[0].rows, experts[0].cols / g],
            data: experts.iter().flat_map(|m| m.bytes.iter().copied()).collect(),
        }
    }

    fn f32_tensor(name: String, values: &[f32]) -> RawTensor {
        RawTensor { name, dtype: Dtype::F32, shape: vec![values.len()], data: f32_bytes(values) }
    }

    /// Every tensor of the checkpoint, tokenizer included.
    pub fn tensors(&self) -> Vec<RawTensor> {
        let mut tensors = vec![
            self.matrix_tensor("model.embed.weight".to_string(), &self.embed),
            Self::f32_tensor("model.norm.weight".to_string(), &self.final_norm),
        ];
        if let Some(output) = &self.output {
            tensors.push(self.matrix_tensor("model.output.weight".to_string(), output));
        }

        for (l, layer) in self.layers.iter().enumerate() {
            let name = |suffix: &str| format!("model.layers.{l}.{suffix}");

            tensors.push(Self::f32_tensor(name("attn.norm.weight"), &layer.attn_norm));
            if let Some(norm) = &layer.mlp_norm {
                tensors.push(Self::f32_tensor(name("mlp.norm.weight"), norm));
            }
            tensors.push(self.matrix_tensor(name("attn.wq.weight"), &layer.wq));
            tensors.push(self.matrix_tensor(name("attn.wk.weight"), &layer.wk));
            tensors.push(self.matrix_tensor(name("attn.wv.weight"), &layer.wv));
            tensors.push(self.matrix_tensor(name("attn.wo.weight"), &layer.wo));
            if let Some(bias) = &layer.bias {
                tensors.push(Self::f32_tensor(name("attn.wqkv.bias"), bias));
            }
            if let Some(gate) = &layer.gate {
                tensors.push(self.matrix_tensor(name("moegate.weight"), gate));
            }
            tensors.push(self.expert_tensor(name("mlp.w1.weight"), &layer.w1));
            tensors.push(self.expert_tensor(name("mlp.w2.weight"), &layer.w2));
            tensors.push(self.expert_tensor(name("mlp.w3.weight"), &layer.w3));
        }

        let mut blob = Vec::new();
        for token in vocab_tokens() {
            blob.extend_from_slice(token.as_bytes());
            blob.push(0);
        }
        let scores: Vec<f32> = vocab_tokens().iter().map(|t| if t == "ab" { 1.0 } else { 0.0 }).collect();

        tensors.push(RawTensor { name: "tokenizer.tokens".to_string(), dtype: Dtype::U8, shape: vec![blob.len()], data: blob });
        tensors.push(Self::f32_tensor("tokenizer.scores".to_string(), &scores));

        tensors
    }

    pub fn checkpoint(&self) -> Vec<u8> {
        serialize(&self.tensors(), &self.metadata())
    }
}

pub fn serialize(tensors: &[RawTensor], metadata: &HashMap<String, String>) -> Vec<u8> {
    let views: Vec<(String, TensorView)> = tensors
        .iter()
        .map(|t| (t.name.clone(), TensorView::new(t.dtype, t.shape.clone(), &t.data).unwrap()))
        .collect();

    safetensors::serialize(views, &Some(metadata.clone())).unwrap()
}
