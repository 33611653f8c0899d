//! BPE tokenizer stored inside the checkpoint.
//!
//! - Loads the vocabulary from `tokenizer.tokens` (NUL-terminated strings) and `tokenizer.scores`.
//! - Encodes text by looking up special tokens and codepoints, then merging adjacent pairs by
//!   descending merge score with a priority queue.
//! - Decodes token ids back to raw bytes, mapping byte-fallback tokens `<0xNN>` to single bytes.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tokenizer_test;

use log::warn;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{CalmError, CalmResult};
use crate::tensors::{DType, TensorStore};

pub const TOKENS_TENSOR: &str = "tokenizer.tokens";
pub const SCORES_TENSOR: &str = "tokenizer.scores";

/// Longest `<|...|>` span looked up as a single special token.
const MAX_SPECIAL_LENGTH: usize = 512;
/// End-of-turn markers, probed in order.
const EOT_TOKENS: [&str; 3] = ["<|eot_id|>", "<|end|>", "<|im_end|>"];
const BYTE_FALLBACK_START: &[u8] = b"<0x00>";

/// Every byte value, so byte-fallback tokens can decode to a borrowed single-byte slice.
static BYTES: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }
    table
};

/// Special tokens added around the encoded text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeFlags {
    pub bos: bool,
    pub eos: bool,
}

/// Tokenizer for byte-level and SentencePiece-style BPE vocabularies.
pub struct Tokenizer {
    /// Token strings concatenated without separators.
    buffer: Vec<u8>,
    /// `(offset, length)` of every token in `buffer`.
    spans: Vec<(usize, usize)>,
    scores: Vec<f32>,
    /// Token ids sorted by their bytes.
    sorted: Vec<u32>,
    /// Id of `<0x00>`; the next 255 ids are the remaining byte values.
    byte_fallback: Option<u32>,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    eot_token_id: Option<u32>,
}

impl Tokenizer {
    /// Loads the vocabulary from the tokenizer tensors of a checkpoint.
    pub fn from_store(
        store: &TensorStore,
        vocab_size: usize,
        bos_token_id: Option<u32>,
        eos_token_id: Option<u32>,
    ) -> CalmResult<Self> {
        let tokens = store.find(TOKENS_TENSOR).ok_or_else(|| CalmError::MissingTensor(TOKENS_TENSOR.to_string()))?;
        let scores = store.find(SCORES_TENSOR).ok_or_else(|| CalmError::MissingTensor(SCORES_TENSOR.to_string()))?;

        for (tensor, dtype) in [(tokens, DType::U8), (scores, DType::F32)] {
            if tensor.dtype != dtype {
                return Err(CalmError::format(format!(
                    "tensor '{}' must be {}, found {}",
                    tensor.name,
                    dtype.name(),
                    tensor.dtype.name()
                )));
            }
        }

        Self::new(store.bytes(tokens), &store.f32_values(scores), vocab_size, bos_token_id, eos_token_id)
    }

    /// Builds the vocabulary from a blob of NUL-terminated token strings and their scores.
    pub fn new(
        tokens: &[u8],
        scores: &[f32],
        vocab_size: usize,
        bos_token_id: Option<u32>,
        eos_token_id: Option<u32>,
    ) -> CalmResult<Self> {
        if scores.len() < vocab_size {
            return Err(CalmError::format(format!("{} token scores for a vocabulary of {vocab_size}", scores.len())));
        }

        let mut buffer = Vec::with_capacity(tokens.len());
        let mut spans = Vec::with_capacity(vocab_size);
        let mut rest = tokens;

        for id in 0..vocab_size {
            let end = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| CalmError::format(format!("token strings end before token {id} of {vocab_size}")))?;
            spans.push((buffer.len(), end));
            buffer.extend_from_slice(&rest[..end]);
            rest = &rest[end + 1..];
        }

        let mut tokenizer = Self {
            buffer,
            spans,
            scores: scores[..vocab_size].to_vec(),
            sorted: (0..vocab_size as u32).collect(),
            byte_fallback: None,
            bos_token_id,
            eos_token_id,
            eot_token_id: None,
        };

        // Stable sort keeps the lowest id first among duplicate strings.
        let mut sorted = std::mem::take(&mut tokenizer.sorted);
        sorted.sort_by(|&a, &b| tokenizer.token(a).cmp(tokenizer.token(b)));
        tokenizer.sorted = sorted;

        tokenizer.byte_fallback =
            tokenizer.lookup(BYTE_FALLBACK_START).filter(|&start| start as usize + 256 <= vocab_size);
        tokenizer.eot_token_id = EOT_TOKENS.iter().find_map(|eot| tokenizer.lookup(eot.as_bytes()));

        Ok(tokenizer)
    }

    pub fn vocab_size(&self) -> usize {
        self.spans.len()
    }

    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// The first of `<|eot_id|>`, `<|end|>`, `<|im_end|>` present in the vocabulary.
    pub fn eot_token_id(&self) -> Option<u32> {
        self.eot_token_id
    }

    pub fn byte_fallback(&self) -> Option<u32> {
        self.byte_fallback
    }

    /// Whether `token` ends generation (EOS or end of turn).
    pub fn is_stop(&self, token: u32) -> bool {
        Some(token) == self.eos_token_id || Some(token) == self.eot_token_id
    }

    /// Raw bytes of a token; empty for ids outside of the vocabulary.
    pub fn token(&self, id: u32) -> &[u8] {
        match self.spans.get(id as usize) {
            Some(&(offset, len)) => &self.buffer[offset..offset + len],
            None => &[],
        }
    }

    pub fn score(&self, id: u32) -> f32 {
        self.scores[id as usize]
    }

    /// Exact-match lookup of a token string.
    pub fn lookup(&self, bytes: &[u8]) -> Option<u32> {
        let idx = self.sorted.partition_point(|&id| self.token(id) < bytes);
        self.sorted.get(idx).copied().filter(|&id| self.token(id) == bytes)
    }

    /// Encodes text into token ids.
    ///
    /// 1. Emits BOS if requested, then looks up `<|...|>` special tokens and single UTF-8 codepoints, falling back to byte tokens.
    /// 2. Repeatedly merges the adjacent pair whose merged token has the highest score (leftmost
    ///    first on ties) until no adjacent pair forms a known token.
    pub fn encode(&self, text: &str, flags: EncodeFlags) -> Vec<u32> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::with_capacity(bytes.len() + 2);
        if flags.bos {
            tokens.extend(self.bos_token_id);
        }

        let mut i = 0;
        while i < bytes.len() {
            if let Some(end) = special_token_end(bytes, i) {
                if let Some(id) = self.lookup(&bytes[i..end]) {
                    tokens.push(id);
                    i = end;
                    continue;
                }
            }

            let mut end = i + 1;
            while end < bytes.len() && end - i < 4 && bytes[end] & 0xC0 == 0x80 {
                end += 1;
            }

            match (self.lookup(&bytes[i..end]), self.byte_fallback) {
                (Some(id), _) => tokens.push(id),
                (None, Some(start)) => tokens.extend(bytes[i..end].iter().map(|&b| start + b as u32)),
                (None, None) => warn!("Dropping {:?}: not in vocabulary and no byte fallback", &text[i..end]),
            }
            i = end;
        }

        let mut tokens = self.merge(tokens);
        if flags.eos {
            if let Some(eos) = self.eos_token_id {
                tokens.push(eos);
            }
        }

        tokens
    }

    fn merge(&self, mut ids: Vec<u32>) -> Vec<u32> {
        let n = ids.len();
        if n < 2 {
            return ids;
        }

        let mut alive = vec![true; n];
        let mut prev: Vec<Option<usize>> = (0..n).map(|i| i.checked_sub(1)).collect();
        let mut next: Vec<Option<usize>> = (0..n).map(|i| Some(i + 1).filter(|&j| j < n)).collect();

        let mut heap = BinaryHeap::new();
        let mut scratch = Vec::new();

        for pos in 0..n - 1 {
            if let Some(candidate) = self.candidate(&mut scratch, pos, ids[pos], ids[pos + 1]) {
                heap.push(candidate);
            }
        }

        while let Some(candidate) = heap.pop() {
            let Some(right) = next[candidate.pos] else { continue };
            if !alive[candidate.pos] || ids[candidate.pos] != candidate.left || ids[right] != candidate.right {
                continue;
            }

            ids[candidate.pos] = candidate.merged;
            alive[right] = false;
            next[candidate.pos] = next[right];
            if let Some(after) = next[right] {
                prev[after] = Some(candidate.pos);
            }

            if let Some(before) = prev[candidate.pos] {
                if let Some(c) = self.candidate(&mut scratch, before, ids[before], ids[candidate.pos]) {
                    heap.push(c);
                }
            }
            if let Some(after) = next[candidate.pos] {
                if let Some(c) = self.candidate(&mut scratch, candidate.pos, ids[candidate.pos], ids[after]) {
                    heap.push(c);
                }
            }
        }

        ids.into_iter().zip(alive).filter_map(|(id, alive)| alive.then_some(id)).collect()
    }

    fn candidate(&self, scratch: &mut Vec<u8>, pos: usize, left: u32, right: u32) -> Option<MergeCandidate> {
        scratch.clear();
        scratch.extend_from_slice(self.token(left));
        scratch.extend_from_slice(self.token(right));

        self.lookup(scratch).map(|merged| MergeCandidate { score: self.score(merged), pos, left, right, merged })
    }

    /// Bytes to print for `token` following `prev`.
    ///
    /// Strips the leading space of the first token after BOS; byte-fallback tokens decode to
    /// their raw byte.
    pub fn decode(&self, prev: Option<u32>, token: u32) -> &[u8] {
        if let Some(start) = self.byte_fallback {
            if (start..start + 256).contains(&token) {
                return std::slice::from_ref(&BYTES[(token - start) as usize]);
            }
        }

        let piece = self.token(token);
        match piece.split_first() {
            Some((b' ', rest)) if prev.is_some() && prev == self.bos_token_id => rest,
            _ => piece,
        }
    }

    /// Decodes a whole sequence, each token following its predecessor.
    pub fn decode_all(&self, tokens: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut prev = None;
        for &token in tokens {
            out.extend_from_slice(self.decode(prev, token));
            prev = Some(token);
        }
        out
    }
}

/// End (exclusive) of a `<|...|>` span starting at `start`, if one closes within the limit.
fn special_token_end(bytes: &[u8], start: usize) -> Option<usize> {
    if !bytes[start..].starts_with(b"<|") {
        return None;
    }

    let limit = bytes.len().min(start + MAX_SPECIAL_LENGTH);
    bytes[start + 1..limit].windows(2).position(|w| w == b"|>").map(|offset| start + 1 + offset + 2)
}

/// Pending merge of the pair starting at slot `pos`, valid while both slots still hold the
/// recorded ids.
#[derive(Debug, Clone, Copy)]
struct MergeCandidate {
    score: f32,
    pos: usize,
    left: u32,
    right: u32,
    merged: u32,
}

impl Ord for MergeCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score).then_with(|| other.pos.cmp(&self.pos))
    }
}

impl PartialOrd for MergeCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeCandidate {}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let named = |id: Option<u32>| id.map(|id| (id, String::from_utf8_lossy(self.token(id)).into_owned()));

        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token_id", &named(self.bos_token_id))
            .field("eos_token_id", &named(self.eos_token_id))
            .field("eot_token_id", &named(self.eot_token_id))
            .field("byte_fallback", &self.byte_fallback)
            .finish_non_exhaustive()
    }
}
