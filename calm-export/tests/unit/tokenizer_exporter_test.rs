use super::*;
use calm_inference::{EncodeFlags, Tokenizer};
use serde_json::json;
use tempfile::TempDir;

fn model_dir(tokenizer: Value, tokenizer_config: Option<Value>) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("tokenizer.json"), tokenizer.to_string()).unwrap();
    if let Some(config) = tokenizer_config {
        fs::write(dir.path().join("tokenizer_config.json"), config.to_string()).unwrap();
    }
    dir
}

fn split_tokens(blob: &[u8]) -> Vec<&[u8]> {
    let mut tokens: Vec<&[u8]> = blob.split(|&b| b == 0).collect();
    // The blob ends with a terminator.
    assert_eq!(tokens.pop(), Some(&b""[..]));
    tokens
}

fn byte_level_tokenizer() -> Value {
    json!({
        "model": {
            "type": "BPE",
            "vocab": { "a": 0, "b": 1, "ab": 2, "Ġ": 3, "Ġa": 4, "far": 99 },
            "merges": ["a b", "Ġ a"]
        },
        "added_tokens": [
            { "id": 5, "content": "<|im_end|>", "special": true }
        ]
    })
}

#[test]
fn test_unicode_to_byte_map() {
    let u2b_map = UnicodeToByteMap::new();

    assert_eq!(u2b_map.mapping.len(), 256);
    assert_eq!(u2b_map.token_to_bytes("A"), vec![65]);
    assert_eq!(u2b_map.token_to_bytes("hello"), b"hello".to_vec());
    assert_eq!(u2b_map.token_to_bytes("Ā"), vec![0]);
    assert_eq!(u2b_map.token_to_bytes("Ġ"), vec![b' ']);
    assert_eq!(u2b_map.token_to_bytes("Ċ"), vec![b'\n']);
    assert_eq!(u2b_map.token_to_bytes("¡"), vec![0xA1]);
    assert_eq!(u2b_map.token_to_bytes(""), Vec::<u8>::new());
    // Outside the table the UTF-8 encoding is kept.
    assert_eq!(u2b_map.token_to_bytes("€"), "€".as_bytes().to_vec());
}

#[test]
fn test_byte_level_export() {
    let dir = model_dir(byte_level_tokenizer(), None);
    let tensors = TokenizerExporter::new().export_tokenizer(dir.path(), 8).unwrap();

    let tokens = split_tokens(&tensors.tokens);
    assert_eq!(tokens, vec![&b"a"[..], b"b", b"ab", b" ", b" a", b"<|im_end|>", b"", b""]);

    assert_eq!(tensors.scores.len(), 8);
    assert_eq!(tensors.scores[0], TokenizerExporter::DEFAULT_SCORE);
    assert_eq!(tensors.scores[2], 0.0);
    assert!((tensors.scores[4] + 2f32.ln()).abs() < 1e-6);
    assert_eq!(tensors.scores[5], TokenizerExporter::DEFAULT_SCORE);
}

#[test]
fn test_exported_vocabulary_loads_in_engine() {
    let dir = model_dir(byte_level_tokenizer(), None);
    let tensors = TokenizerExporter::new().export_tokenizer(dir.path(), 8).unwrap();

    let tokenizer = Tokenizer::new(&tensors.tokens, &tensors.scores, 8, None, None).unwrap();
    assert_eq!(tokenizer.eot_token_id(), Some(5));
    assert_eq!(tokenizer.encode("ab a", EncodeFlags { bos: false, eos: false }), vec![2, 4]);
}

#[test]
fn test_sentencepiece_export() {
    let tokenizer = json!({
        "model": {
            "type": "BPE",
            "byte_fallback": true,
            "vocab": { "<unk>": 0, "<0x00>": 1, "<0x41>": 2, "▁": 3, "h": 4, "▁h": 5, "▁hello": 6 },
            "merges": [["▁", "h"]]
        }
    });
    let config = json!({
        "added_tokens_decoder": {
            "7": { "content": "</s>", "special": true },
            "0": { "content": "<unk>", "special": true }
        }
    });
    let dir = model_dir(tokenizer, Some(config));

    let tensors = TokenizerExporter::new().export_tokenizer(dir.path(), 8).unwrap();
    let tokens = split_tokens(&tensors.tokens);

    assert_eq!(tokens, vec![&b"<unk>"[..], b"<0x00>", b"<0x41>", b" ", b"h", b" h", b" hello", b"</s>"]);
    assert_eq!(tensors.scores[5], 0.0);
    assert_eq!(tensors.scores[6], TokenizerExporter::DEFAULT_SCORE);
}

#[test]
fn test_merge_ranks() {
    let data = json!({ "model": { "merges": ["a b", ["ab", "c"], "a b", 7, "nospace"] } });
    let ranks = TokenizerExporter::new().extract_merge_ranks(&data);

    assert_eq!(ranks.len(), 2);
    assert_eq!(ranks["ab"], 0);
    assert_eq!(ranks["abc"], 1);
}

#[test]
fn test_missing_files_and_vocab() {
    let dir = TempDir::new().unwrap();
    assert!(TokenizerExporter::new().export_tokenizer(dir.path(), 8).is_err());

    let dir = model_dir(json!({ "model": { "type": "BPE" } }), None);
    let err = TokenizerExporter::new().export_tokenizer(dir.path(), 8).unwrap_err();
    assert_eq!(err.to_string(), "Could not find vocabulary in tokenizer.json");
}
