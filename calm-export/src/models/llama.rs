use calm_inference::ModelConfig;

use super::*;

/// Llama-family decoder: Llama, Mistral, Qwen2 (QKV biases) and Mixtral (sparse experts).
pub struct Llama {
    architecture: ArchitectureId,
    config: ModelConfig,
    tie_word_embeddings: bool,
}

impl Llama {
    const EMBED_TOKENS_KEY: &'static str = "model.embed_tokens.weight";
    const LM_HEAD_KEY: &'static str = "lm_head.weight";
    const FINAL_NORM_KEY: &'static str = "model.norm.weight";

    pub fn new(model_info: &ModelInfo) -> Self {
        Self {
            architecture: model_info.architecture,
            config: model_info.config.clone(),
            tie_word_embeddings: model_info.tie_word_embeddings,
        }
    }

    fn attention(&self, layer: usize, reader: &TensorReader, mappings: &mut Vec<TensorMapping>) {
        let ModelConfig { n_heads, n_kv_heads, .. } = self.config;
        let name = |proj: &str, kind: &str| format!("model.layers.{layer}.self_attn.{proj}.{kind}");

        mappings.extend([
            TensorMapping::new(WeightRole::Wq, layer, vec![SourcePart::rotary(name("q_proj", "weight"), n_heads)]),
            TensorMapping::new(WeightRole::Wk, layer, vec![SourcePart::rotary(name("k_proj", "weight"), n_kv_heads)]),
            TensorMapping::new(WeightRole::Wv, layer, vec![SourcePart::plain(name("v_proj", "weight"))]),
            TensorMapping::new(WeightRole::Wo, layer, vec![SourcePart::plain(name("o_proj", "weight"))]),
        ]);

        if reader.contains(&name("q_proj", "bias")) {
            mappings.push(TensorMapping::new(
                WeightRole::QkvBias,
                layer,
                vec![
                    SourcePart::rotary(name("q_proj", "bias"), n_heads),
                    SourcePart::rotary(name("k_proj", "bias"), n_kv_heads),
                    SourcePart::plain(name("v_proj", "bias")),
                ],
            ));
        }
    }

    fn feed_forward(&self, layer: usize, mappings: &mut Vec<TensorMapping>) {
        let prefix = format!("model.layers.{layer}");

        if self.config.n_experts == 0 {
            for (role, proj) in [(WeightRole::W1, "gate_proj"), (WeightRole::W2, "down_proj"), (WeightRole::W3, "up_proj")] {
                mappings.push(TensorMapping::new(role, layer, vec![SourcePart::plain(format!("{prefix}.mlp.{proj}.weight"))]));
            }
            return;
        }

        let moe = format!("{prefix}.block_sparse_moe");
        mappings.push(TensorMapping::new(WeightRole::MoeGate, layer, vec![SourcePart::plain(format!("{moe}.gate.weight"))]));

        for (role, w) in [(WeightRole::W1, "w1"), (WeightRole::W2, "w2"), (WeightRole::W3, "w3")] {
            let experts =
                (0..self.config.n_experts).map(|e| SourcePart::plain(format!("{moe}.experts.{e}.{w}.weight"))).collect();
            mappings.push(TensorMapping::new(role, layer, experts));
        }
    }
}

impl Architecture for Llama {
    fn id(&self) -> ArchitectureId {
        self.architecture
    }

    fn mappings(&self, reader: &TensorReader) -> Vec<TensorMapping> {
        let mut mappings = vec![
            TensorMapping::new(WeightRole::Embedding, 0, vec![SourcePart::plain(Self::EMBED_TOKENS_KEY.to_string())]),
            TensorMapping::new(WeightRole::FinalNorm, 0, vec![SourcePart::plain(Self::FINAL_NORM_KEY.to_string())]),
        ];

        // A missing or tied head is served from the embedding table at load time.
        if !self.tie_word_embeddings && reader.contains(Self::LM_HEAD_KEY) {
            mappings.push(TensorMapping::new(
                WeightRole::Classifier,
                0,
                vec![SourcePart::plain(Self::LM_HEAD_KEY.to_string())],
            ));
        }

        for layer in 0..self.config.n_layers {
            let prefix = format!("model.layers.{layer}");
            mappings.push(TensorMapping::new(
                WeightRole::AttnNorm,
                layer,
                vec![SourcePart::plain(format!("{prefix}.input_layernorm.weight"))],
            ));
            mappings.push(TensorMapping::new(
                WeightRole::MlpNorm,
                layer,
                vec![SourcePart::plain(format!("{prefix}.post_attention_layernorm.weight"))],
            ));

            self.attention(layer, reader, &mut mappings);
            self.feed_forward(layer, &mut mappings);
        }

        mappings
    }
}
