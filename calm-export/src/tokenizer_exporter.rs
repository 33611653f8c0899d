#[cfg(test)]
#[path = "../tests/unit/tokenizer_exporter_test.rs"]
mod tokenizer_exporter_test;

use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::Value;
use std::{collections::HashMap, fs, path::Path};

/// Vocabulary in the layout of the `tokenizer.tokens` / `tokenizer.scores` tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizerTensors {
    /// NUL-terminated token strings, one per id.
    pub tokens: Vec<u8>,
    pub scores: Vec<f32>,
}

/// How vocabulary strings map to bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenStyle {
    /// GPT-2 byte-level BPE: every char stands for one byte.
    ByteLevel,
    /// SentencePiece BPE: `▁` marks a space and `<0xNN>` tokens carry raw bytes.
    SentencePiece,
}

/// GPT-2 style Unicode to byte mapping
#[derive(Debug)]
struct UnicodeToByteMap {
    mapping: HashMap<char, u8>,
}

impl UnicodeToByteMap {
    fn new() -> Self {
        let printable = |b: u8| matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);

        let mut mapping = HashMap::with_capacity(256);
        let mut shifted = 0u32;
        for b in 0..=255u8 {
            if printable(b) {
                mapping.insert(b as char, b);
            } else if let Some(ch) = char::from_u32(256 + shifted) {
                mapping.insert(ch, b);
                shifted += 1;
            }
        }

        Self { mapping }
    }

    /// Maps every char back to its byte; chars outside the table keep their UTF-8 encoding.
    fn token_to_bytes(&self, token: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(token.len());
        for ch in token.chars() {
            match self.mapping.get(&ch) {
                Some(&b) => bytes.push(b),
                None => bytes.extend_from_slice(ch.encode_utf8(&mut [0; 4]).as_bytes()),
            }
        }
        bytes
    }
}

/// Converts a HuggingFace `tokenizer.json` into checkpoint tokenizer tensors.
#[derive(Debug, Default)]
pub struct TokenizerExporter;

impl TokenizerExporter {
    const TOKENIZER_FILE_NAME: &'static str = "tokenizer.json";
    const TOKENIZER_CONFIG_FILE_NAME: &'static str = "tokenizer_config.json";
    /// Score of tokens no merge produces.
    const DEFAULT_SCORE: f32 = -1e6;

    pub const fn new() -> Self {
        Self
    }

    /// Builds tokenizer tensors with exactly `vocab_size` entries.
    pub fn export_tokenizer(&self, model_path: &Path, vocab_size: usize) -> Result<TokenizerTensors> {
        let tokenizer_data = self.load_json_file(&model_path.join(Self::TOKENIZER_FILE_NAME))?;

        let mut vocab = self.extract_vocabulary(&tokenizer_data)?;
        let added = self.extract_added_tokens(&tokenizer_data, model_path, &mut vocab)?;
        let merge_ranks = self.extract_merge_ranks(&tokenizer_data);

        let style = if vocab.contains_key("<0x00>") { TokenStyle::SentencePiece } else { TokenStyle::ByteLevel };
        info!("📊 Found {} tokens ({} added, {} merges, {style:?})", vocab.len(), added.len(), merge_ranks.len());

        Ok(self.build_tensors(&vocab, &added, &merge_ranks, style, vocab_size))
    }

    fn build_tensors(
        &self,
        vocab: &HashMap<String, u32>,
        added: &[String],
        merge_ranks: &HashMap<String, usize>,
        style: TokenStyle,
        vocab_size: usize,
    ) -> TokenizerTensors {
        let mut by_id: Vec<Option<&str>> = vec![None; vocab_size];
        for (token, &id) in vocab {
            match by_id.get_mut(id as usize) {
                Some(slot) => *slot = Some(token.as_str()),
                None => warn!("Dropping token {token:?} with id {id} beyond vocabulary size {vocab_size}"),
            }
        }

        let missing = by_id.iter().filter(|token| token.is_none()).count();
        if missing > 0 {
            warn!("{missing} ids have no token and are exported as empty strings");
        }

        let u2b_map = UnicodeToByteMap::new();
        let mut tokens = Vec::new();
        let mut scores = Vec::with_capacity(vocab_size);

        for token in by_id {
            let token = token.unwrap_or_default();
            let is_added = added.binary_search_by(|a| a.as_str().cmp(token)).is_ok();

            let mut bytes = match style {
                _ if is_added => token.as_bytes().to_vec(),
                TokenStyle::ByteLevel => u2b_map.token_to_bytes(token),
                TokenStyle::SentencePiece => token.replace('▁', " ").into_bytes(),
            };
            if bytes.contains(&0) {
                warn!("Token {token:?} contains a NUL byte, exported truncated");
                bytes.truncate(bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len()));
            }

            tokens.extend_from_slice(&bytes);
            tokens.push(0);

            scores.push(merge_ranks.get(token).map_or(Self::DEFAULT_SCORE, |&rank| -((rank + 1) as f32).ln()));
        }

        TokenizerTensors { tokens, scores }
    }

    fn extract_vocabulary(&self, tokenizer_data: &Value) -> Result<HashMap<String, u32>> {
        let vocab = tokenizer_data
            .pointer("/model/vocab")
            .or_else(|| tokenizer_data.pointer("/vocab"))
            .and_then(Value::as_object)
            .context("Could not find vocabulary in tokenizer.json")?;

        Ok(vocab.iter().filter_map(|(token, id)| Some((token.clone(), u32::try_from(id.as_u64()?).ok()?))).collect())
    }

    /// Merges produce the concatenation of their two parts; the first merge of a token wins.
    ///
    /// Merges are either `"a b"` strings or `["a", "b"]` pairs.
    fn extract_merge_ranks(&self, tokenizer_data: &Value) -> HashMap<String, usize> {
        let Some(merges) = tokenizer_data.pointer("/model/merges").and_then(Value::as_array) else {
            return HashMap::new();
        };

        let mut ranks = HashMap::with_capacity(merges.len());
        for (rank, merge) in merges.iter().enumerate() {
            let merged = match merge {
                Value::String(pair) => pair.split_once(' ').map(|(a, b)| format!("{a}{b}")),
                Value::Array(pair) => match pair.as_slice() {
                    [Value::String(a), Value::String(b)] => Some(format!("{a}{b}")),
                    _ => None,
                },
                _ => None,
            };

            match merged {
                Some(token) => {
                    ranks.entry(token).or_insert(rank);
                }
                None => warn!("Skipping malformed merge #{rank}: {merge}"),
            }
        }
        ranks
    }

    /// Adds `added_tokens` of tokenizer.json and `added_tokens_decoder` of tokenizer_config.json.
    ///
    /// Returns the added token strings; they are stored verbatim.
    fn extract_added_tokens(
        &self,
        tokenizer_data: &Value,
        model_path: &Path,
        vocab: &mut HashMap<String, u32>,
    ) -> Result<Vec<String>> {
        let mut added = Vec::new();

        let mut add = |id: Option<u64>, content: Option<&str>| {
            if let (Some(id), Some(content)) = (id.and_then(|id| u32::try_from(id).ok()), content) {
                vocab.entry(content.to_string()).or_insert(id);
                added.push(content.to_string());
            }
        };

        if let Some(tokens) = tokenizer_data.pointer("/added_tokens").and_then(Value::as_array) {
            for token in tokens {
                add(token.pointer("/id").and_then(Value::as_u64), token.pointer("/content").and_then(Value::as_str));
            }
        }

        let config_path = model_path.join(Self::TOKENIZER_CONFIG_FILE_NAME);
        if config_path.exists() {
            let config = self.load_json_file(&config_path)?;
            if let Some(decoder) = config.pointer("/added_tokens_decoder").and_then(Value::as_object) {
                for (id, token) in decoder {
                    add(id.parse().ok(), token.pointer("/content").and_then(Value::as_str));
                }
            }
        }

        added.sort();
        added.dedup();
        Ok(added)
    }

    fn load_json_file(&self, path: &Path) -> Result<Value> {
        let contents = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("Failed to parse JSON from {}", path.display()))
    }
}
