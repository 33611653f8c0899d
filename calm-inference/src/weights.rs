//! Binds checkpoint tensors to the roles the forward pass needs.

use log::debug;

use crate::configuration::ModelConfig;
use crate::error::CalmResult;
use crate::layers::Norm;
use crate::tensors::{DType, MAX_DIMS, TensorStore, TensorView};

/// Role of a tensor in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightRole {
    Embedding,
    FinalNorm,
    Classifier,
    AttnNorm,
    MlpNorm,
    Wq,
    Wk,
    Wv,
    Wo,
    QkvBias,
    MoeGate,
    W1,
    W2,
    W3,
}

/// Maps weight roles to tensor name templates; per-layer templates contain one `%d`.
pub trait TensorNaming: Send + Sync {
    fn template(&self, role: WeightRole) -> &str;
}

/// Tensor names written by the `calm` converter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalmNaming;

impl TensorNaming for CalmNaming {
    fn template(&self, role: WeightRole) -> &str {
        match role {
            WeightRole::Embedding => "model.embed.weight",
            WeightRole::FinalNorm => "model.norm.weight",
            WeightRole::Classifier => "model.output.weight",
            WeightRole::AttnNorm => "model.layers.%d.attn.norm.weight",
            WeightRole::MlpNorm => "model.layers.%d.mlp.norm.weight",
            WeightRole::Wq => "model.layers.%d.attn.wq.weight",
            WeightRole::Wk => "model.layers.%d.attn.wk.weight",
            WeightRole::Wv => "model.layers.%d.attn.wv.weight",
            WeightRole::Wo => "model.layers.%d.attn.wo.weight",
            WeightRole::QkvBias => "model.layers.%d.attn.wqkv.bias",
            WeightRole::MoeGate => "model.layers.%d.moegate.weight",
            WeightRole::W1 => "model.layers.%d.mlp.w1.weight",
            WeightRole::W2 => "model.layers.%d.mlp.w2.weight",
            WeightRole::W3 => "model.layers.%d.mlp.w3.weight",
        }
    }
}

/// Weights of one transformer block.
pub struct LayerWeights {
    pub attn_norm: Norm,
    /// Absent when attention and FFN share the input normalization.
    pub mlp_norm: Option<Norm>,
    pub wq: TensorView,
    pub wk: TensorView,
    pub wv: TensorView,
    pub wo: TensorView,
    /// Concatenated `[q | k | v]` bias.
    pub qkv_bias: Option<Vec<f32>>,
    pub moe_gate: Option<TensorView>,
    /// `[n_experts?, hidden_dim, dim]`
    pub w1: TensorView,
    /// `[n_experts?, dim, hidden_dim]`
    pub w2: TensorView,
    /// `[n_experts?, hidden_dim, dim]`
    pub w3: TensorView,
}

impl std::fmt::Debug for LayerWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerWeights")
            .field("attn_norm", &self.attn_norm)
            .field("mlp_norm", &self.mlp_norm)
            .field("qkv_bias", &self.qkv_bias.is_some())
            .field("moe_gate", &self.moe_gate.is_some())
            .finish()
    }
}

/// Every tensor the forward pass reads, as views into the store plus decoded small vectors.
#[derive(Debug)]
pub struct Weights {
    pub embedding: TensorView,
    pub final_norm: Norm,
    /// The embedding table when the checkpoint has no separate classifier.
    pub classifier: TensorView,
    pub layers: Vec<LayerWeights>,
}

impl Weights {
    pub fn bind(store: &TensorStore, config: &ModelConfig, naming: &dyn TensorNaming) -> CalmResult<Self> {
        let binder = Binder { store, config, naming };
        let ModelConfig { dim, hidden_dim, vocab_size, n_experts, .. } = *config;
        let (q_dim, kv_dim) = (config.q_dim(), config.kv_dim());

        let embedding = binder.matrix(WeightRole::Embedding, 0, vocab_size, dim)?;
        let final_norm = binder.norm(WeightRole::FinalNorm, 0)?;

        let classifier = if store.find(naming.template(WeightRole::Classifier)).is_some() {
            binder.matrix(WeightRole::Classifier, 0, vocab_size, dim)?
        } else {
            debug!("No classifier tensor, using tied embeddings");
            embedding
        };

        let layers = (0..config.n_layers)
            .map(|l| {
                let mlp_norm = if config.normalization.is_parallel() {
                    None
                } else {
                    Some(binder.norm(WeightRole::MlpNorm, l)?)
                };

                let qkv_bias = if store.find_layer(naming.template(WeightRole::QkvBias), l).is_some() {
                    let tensor = store.get(
                        naming.template(WeightRole::QkvBias),
                        l,
                        DType::F32,
                        [q_dim + 2 * kv_dim, 0, 0, 0],
                    )?;
                    Some(store.f32_values(tensor))
                } else {
                    None
                };

                let moe_gate =
                    if n_experts > 0 { Some(binder.matrix(WeightRole::MoeGate, l, n_experts, dim)?) } else { None };

                Ok(LayerWeights {
                    attn_norm: binder.norm(WeightRole::AttnNorm, l)?,
                    mlp_norm,
                    wq: binder.matrix(WeightRole::Wq, l, q_dim, dim)?,
                    wk: binder.matrix(WeightRole::Wk, l, kv_dim, dim)?,
                    wv: binder.matrix(WeightRole::Wv, l, kv_dim, dim)?,
                    wo: binder.matrix(WeightRole::Wo, l, dim, q_dim)?,
                    qkv_bias,
                    moe_gate,
                    w1: binder.experts(WeightRole::W1, l, hidden_dim, dim)?,
                    w2: binder.experts(WeightRole::W2, l, dim, hidden_dim)?,
                    w3: binder.experts(WeightRole::W3, l, hidden_dim, dim)?,
                })
            })
            .collect::<CalmResult<Vec<_>>>()?;

        Ok(Self { embedding, final_norm, classifier, layers })
    }
}

struct Binder<'a> {
    store: &'a TensorStore,
    config: &'a ModelConfig,
    naming: &'a dyn TensorNaming,
}

impl Binder<'_> {
    /// `[rows, cols / g]` matrix in the model's weight encoding.
    fn matrix(&self, role: WeightRole, layer: usize, rows: usize, cols: usize) -> CalmResult<TensorView> {
        let encoding = self.config.encoding;
        self.view(role, layer, [rows, cols / encoding.group_size(), 0, 0])
    }

    /// `[n_experts, rows, cols / g]` when the model has experts, else a plain matrix.
    fn experts(&self, role: WeightRole, layer: usize, rows: usize, cols: usize) -> CalmResult<TensorView> {
        let encoding = self.config.encoding;
        match self.config.n_experts {
            0 => self.matrix(role, layer, rows, cols),
            n_experts => self.view(role, layer, [n_experts, rows, cols / encoding.group_size(), 0]),
        }
    }

    fn view(&self, role: WeightRole, layer: usize, shape: [usize; MAX_DIMS]) -> CalmResult<TensorView> {
        let tensor = self.store.get(self.naming.template(role), layer, self.config.encoding.dtype(), shape)?;
        Ok(self.store.view(tensor))
    }

    fn norm(&self, role: WeightRole, layer: usize) -> CalmResult<Norm> {
        let tensor = self.store.get(self.naming.template(role), layer, DType::F32, [self.config.dim, 0, 0, 0])?;
        Ok(Norm::new(self.store.f32_values(tensor), self.config.normalization, self.config.norm_eps))
    }
}
