#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod layers_test;

use half::f16;

use crate::configuration::Normalization;

/// RMSNorm or LayerNorm with a learned per-channel weight (no bias).
///
/// **Mathematical Formula**:
/// ```text
/// Norm(x) = (x - μ) / sqrt(mean((x - μ)²) + ε) * γ
/// ```
/// where `μ` is the mean of `x` for LayerNorm and 0 for RMSNorm.
pub struct Norm {
    pub weight: Vec<f32>,
    pub kind: Normalization,
    pub eps: f32,
}

impl Norm {
    pub fn new(weight: Vec<f32>, kind: Normalization, eps: f32) -> Self {
        Self { weight, kind, eps }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len(), self.weight.len());

        let (mean, scale) = self.factors(input);

        output.iter_mut().zip(input).zip(&self.weight).for_each(|((out, &inp), &w)| {
            *out = (inp - mean) * scale * w;
        });
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len(), self.weight.len());

        let (mean, scale) = self.factors(x);

        x.iter_mut().zip(&self.weight).for_each(|(val, &w)| {
            *val = (*val - mean) * scale * w;
        });
    }

    fn factors(&self, x: &[f32]) -> (f32, f32) {
        let size = x.len() as f32;
        let mean = if self.kind.subtracts_mean() { x.iter().sum::<f32>() / size } else { 0.0 };
        let sum_of_squares = x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>();

        (mean, 1.0 / (sum_of_squares / size + self.eps).sqrt())
    }
}

impl std::fmt::Debug for Norm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Norm").field("kind", &self.kind).field("dim", &self.weight.len()).field("eps", &self.eps).finish()
    }
}

/// Rotary Position Embedding over interleaved pairs `(i, i + 1)`.
///
/// Only the first `rotary_dim` channels of every head rotate; the rest keep a zero frequency.
#[derive(Debug, Clone)]
pub struct Rope {
    pub head_dim: usize,
    pub rotary_dim: usize,
    pub theta: f32,
}

impl Rope {
    pub fn new(head_dim: usize, rotary_dim: usize, theta: f32) -> Self {
        Self { head_dim, rotary_dim, theta }
    }

    /// Frequency of the pair starting at channel `j` of a head.
    pub fn freq(&self, j: usize) -> f32 {
        if j >= self.rotary_dim { 0.0 } else { 1.0 / self.theta.powf(j as f32 / self.rotary_dim as f32) }
    }

    /// Rotates every pair of `vec` (a sequence of heads) by `pos`.
    pub fn apply(&self, vec: &mut [f32], pos: f32) {
        debug_assert_eq!(vec.len() % 2, 0);

        for (pair_idx, pair) in vec.chunks_exact_mut(2).enumerate() {
            let j = (pair_idx * 2) % self.head_dim;
            let angle = pos * self.freq(j);
            let (sin, cos) = angle.sin_cos();

            let (v0, v1) = (pair[0], pair[1]);
            pair[0] = v0 * cos - v1 * sin;
            pair[1] = v0 * sin + v1 * cos;
        }
    }

    /// Same as [`Rope::apply`] on keys stored in half precision.
    pub fn apply_f16(&self, vec: &mut [f16], pos: f32) {
        for (pair_idx, pair) in vec.chunks_exact_mut(2).enumerate() {
            let j = (pair_idx * 2) % self.head_dim;
            let angle = pos * self.freq(j);
            let (sin, cos) = angle.sin_cos();

            let (v0, v1) = (pair[0].to_f32(), pair[1].to_f32());
            pair[0] = f16::from_f32(v0 * cos - v1 * sin);
            pair[1] = f16::from_f32(v0 * sin + v1 * cos);
        }
    }
}

/// Scaled dot-product attention of one query head over `kv_len` cached positions.
///
/// `key_cache` and `value_cache` are `[seq_len, kv_dim]` slices of one layer; the head reads
/// channels `head_offset..head_offset + head_dim` of every position.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    out: &mut [f32],
    att: &mut [f32],
    q: &[f32],
    key_cache: &[f16],
    value_cache: &[f16],
    kv_len: usize,
    kv_dim: usize,
    head_offset: usize,
) {
    let head_dim = q.len();
    let scale = (head_dim as f32).sqrt();
    let att = &mut att[..kv_len];

    for (t, score) in att.iter_mut().enumerate() {
        let key = &key_cache[t * kv_dim + head_offset..t * kv_dim + head_offset + head_dim];
        *score = q.iter().zip(key).map(|(&q, &k)| q * k.to_f32()).sum::<f32>() / scale;
    }

    let max = att.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let mut sum = 0.0f32;
    for score in att.iter_mut() {
        *score = (*score - max).exp();
        sum += *score;
    }

    out.fill(0.0);
    for (t, &weight) in att.iter().enumerate() {
        let value = &value_cache[t * kv_dim + head_offset..t * kv_dim + head_offset + head_dim];
        let weight = weight / sum;
        out.iter_mut().zip(value).for_each(|(o, &v)| *o += weight * v.to_f32());
    }
}

#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.797885 * (x + 0.044715 * x * x * x)).tanh())
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Clamps every element to `[-bound, bound]`.
pub fn clip(x: &mut [f32], bound: f32) {
    x.iter_mut().for_each(|v| *v = v.clamp(-bound, bound));
}

/// Selects the `experts.len()` largest gate logits and writes their normalized weights.
///
/// Ties go to the lowest index. Weights are `exp(l - max)` renormalized over the chosen set.
pub fn moe_gate(weights: &mut [f32], experts: &mut [usize], logits: &[f32]) {
    assert!(logits.len() < 64, "at most 63 experts are supported, got {}", logits.len());
    assert!(experts.len() <= logits.len() && weights.len() == experts.len());

    let max = logits.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));

    let mut mask = 0u64;
    let mut sum = 0.0f32;

    for (weight, expert) in weights.iter_mut().zip(experts.iter_mut()) {
        let mut best: Option<usize> = None;
        for (j, &logit) in logits.iter().enumerate() {
            if mask & (1 << j) == 0 && best.is_none_or(|b| logit > logits[b]) {
                best = Some(j);
            }
        }

        // The mask always leaves an unchosen index while experts.len() <= logits.len().
        let best = best.unwrap_or_default();
        *expert = best;
        *weight = (logits[best] - max).exp();
        sum += *weight;
        mask |= 1 << best;
    }

    weights.iter_mut().for_each(|w| *w /= sum);
}
