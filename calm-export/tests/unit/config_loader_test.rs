use super::*;
use serde_json::json;
use tempfile::TempDir;

fn write_config(dir: &TempDir, config: serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join("config.json");
    fs::write(&path, config.to_string()).unwrap();
    path
}

fn llama_config() -> serde_json::Value {
    json!({
        "architectures": ["LlamaForCausalLM"],
        "hidden_size": 256,
        "intermediate_size": 1024,
        "num_hidden_layers": 4,
        "num_attention_heads": 8,
        "num_key_value_heads": 2,
        "vocab_size": 1000,
        "max_position_embeddings": 2048,
        "rms_norm_eps": 1e-6,
        "rope_theta": 500000.0,
        "hidden_act": "silu",
        "bos_token_id": 1,
        "eos_token_id": [2, 3],
        "tie_word_embeddings": false
    })
}

#[test]
fn test_load_llama_config() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, llama_config());

    let info = load_model_info(dir.path(), ExportOptions::default()).unwrap();
    let config = &info.config;

    assert_eq!(info.architecture, ArchitectureId::LlamaForCausalLM);
    assert!(!info.tie_word_embeddings);
    assert_eq!(config.encoding, WeightEncoding::Fp8);
    assert_eq!((config.dim, config.hidden_dim, config.n_layers), (256, 1024, 4));
    assert_eq!((config.n_heads, config.n_kv_heads, config.head_dim, config.rotary_dim), (8, 2, 32, 32));
    assert_eq!(config.seq_len, 2048);
    assert_eq!(config.rope_theta, 500000.0);
    assert_eq!(config.norm_eps, 1e-6);
    assert_eq!(config.activation, Activation::Silu);
    assert_eq!((config.bos_token_id, config.eos_token_id), (Some(1), Some(2)));
}

#[test]
fn test_context_caps_sequence_length() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, llama_config());

    let options = ExportOptions { encoding: WeightEncoding::Gf4, context: Some(512) };
    assert_eq!(load_model_info(dir.path(), options).unwrap().config.seq_len, 512);

    let options = ExportOptions { encoding: WeightEncoding::Gf4, context: Some(1 << 20) };
    assert_eq!(load_model_info(dir.path(), options).unwrap().config.seq_len, 2048);
}

#[test]
fn test_mixtral_and_partial_rotary() {
    let dir = TempDir::new().unwrap();
    let mut config = llama_config();
    config["architectures"] = json!(["MixtralForCausalLM"]);
    config["num_local_experts"] = json!(8);
    config["num_experts_per_tok"] = json!(2);
    config["partial_rotary_factor"] = json!(0.5);
    config["hidden_act"] = json!("gelu_pytorch_tanh");
    write_config(&dir, config);

    let info = load_model_info(dir.path(), ExportOptions::default()).unwrap();
    assert_eq!(info.architecture, ArchitectureId::MixtralForCausalLM);
    assert_eq!((info.config.n_experts, info.config.n_experts_active), (8, 2));
    assert_eq!(info.config.rotary_dim, 16);
    assert_eq!(info.config.activation, Activation::Gelu);
}

#[test]
fn test_defaults() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        json!({
            "architectures": ["MistralForCausalLM"],
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 1,
            "num_attention_heads": 4,
            "vocab_size": 100
        }),
    );

    let config = load_model_info(dir.path(), ExportOptions::default()).unwrap().config;
    assert_eq!(config.n_kv_heads, 4);
    assert_eq!(config.head_dim, 16);
    assert_eq!(config.seq_len, FALLBACK_SEQ_LEN);
    assert_eq!(config.norm_eps, 1e-5);
    assert_eq!((config.bos_token_id, config.eos_token_id), (None, None));
}

#[test]
fn test_rejected_configs() {
    let dir = TempDir::new().unwrap();
    assert!(load_model_info(dir.path(), ExportOptions::default()).is_err());

    write_config(&dir, json!({ "hidden_size": 64 }));
    let err = load_model_info(dir.path(), ExportOptions::default()).unwrap_err();
    assert!(err.to_string().starts_with("Failed to parse config.json: missing field"));

    let mut config = llama_config();
    config["architectures"] = json!(["GPTNeoXForCausalLM"]);
    write_config(&dir, config);
    assert!(load_model_info(dir.path(), ExportOptions::default()).is_err());

    let mut config = llama_config();
    config["architectures"] = json!(["LlamaForCausalLM", "MistralForCausalLM"]);
    write_config(&dir, config);
    assert!(load_model_info(dir.path(), ExportOptions::default()).is_err());

    // gf4 needs the hidden size to be a multiple of 8.
    let mut config = llama_config();
    config["intermediate_size"] = json!(1020);
    write_config(&dir, config);
    let options = ExportOptions { encoding: WeightEncoding::Gf4, context: None };
    assert!(load_model_info(dir.path(), options).is_err());
}

#[test]
fn test_metadata_round_trip() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, llama_config());
    let config = load_model_info(dir.path(), ExportOptions::default()).unwrap().config;

    let metadata = config_metadata(&config);
    assert_eq!(metadata["dtype"], "fp8");
    assert_eq!(metadata["max_seq_len"], "2048");
    assert_eq!(metadata["norm_type"], "rmsnorm");
    assert!(!metadata.contains_key("qkv_clip"));

    let reloaded = ModelConfig::from_metadata(|key| metadata.get(key).map(String::as_str)).unwrap();
    assert_eq!(reloaded.rope_theta, config.rope_theta);
    assert_eq!(reloaded.eos_token_id, config.eos_token_id);
}
