#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

/// PCG-XSH-RR multiplier.
const PCG_MULTIPLIER: u64 = 6364136223846793005;
/// PCG-XSH-RR increment.
const PCG_INCREMENT: u64 = 1442695040888963407;

/// Temperature / min-p sampler for language model logits.
///
/// The random stream is a PCG-XSH-RR 64/32 generator owned by the sampler, so a fixed seed
/// reproduces the same sequence of tokens.
#[derive(Debug, Clone)]
pub struct Sampler {
    pub vocab_size: usize,
    pub temperature: f32,
    pub min_p: f32,
    pub rng_state: u64,
}

impl Sampler {
    /// Creates a new sampler.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary
    /// * `temperature` - Temperature for sampling (0.0 for greedy)
    /// * `min_p` - Tokens below `min_p` times the top probability are dropped (1.0 for greedy)
    /// * `rng_seed` - Random seed for reproducibility
    pub fn new(vocab_size: usize, temperature: f32, min_p: f32, rng_seed: u64) -> Self {
        assert!(vocab_size > 0, "Vocab size must be positive");
        assert!(temperature >= 0.0, "Temperature must be non-negative");
        assert!((0.0..=1.0).contains(&min_p), "min-p must be between 0.0 and 1.0");

        Self { vocab_size, temperature, min_p, rng_state: rng_seed }
    }

    /// Next 32-bit output of the generator.
    pub fn random_u32(&mut self) -> u32 {
        let old = self.rng_state;
        let count = (old >> 59) as u32;

        self.rng_state = old.wrapping_mul(PCG_MULTIPLIER).wrapping_add(PCG_INCREMENT);

        let x = old ^ (old >> 18);
        ((x >> 27) as u32).rotate_right(count)
    }

    /// Returns a random float in [0, 1).
    pub fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Index of the maximum logit; the first one wins ties.
    pub fn sample_argmax(logits: &[f32]) -> usize {
        let mut best = 0;
        for (i, &logit) in logits.iter().enumerate().skip(1) {
            if logit > logits[best] {
                best = i;
            }
        }
        best
    }

    /// Samples a token index, overwriting `logits` with unnormalized probabilities.
    ///
    /// - If temperature is 0 or min-p is 1, returns the argmax (greedy).
    /// - Otherwise keeps logits within `ln(min_p) * temperature` of the maximum and draws from
    ///   their temperature-scaled distribution.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        let logits = &mut logits[..self.vocab_size];

        if self.temperature == 0.0 || self.min_p >= 1.0 {
            return Self::sample_argmax(logits);
        }

        let max = logits.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let cutoff = max + self.min_p.ln() * self.temperature;

        let mut sum = 0.0f32;
        let mut fallback = 0;
        for (i, logit) in logits.iter_mut().enumerate() {
            if *logit >= cutoff {
                *logit = ((*logit - max) / self.temperature).exp();
                sum += *logit;
                fallback = i;
            } else {
                *logit = 0.0;
            }
        }

        let r = self.random_f32() * sum;
        let mut cdf = 0.0f32;
        for (i, &prob) in logits.iter().enumerate() {
            cdf += prob;
            if r < cdf {
                return i;
            }
        }

        fallback
    }

    /// Softmax probability of `idx` under `logits`.
    pub fn sample_prob(idx: usize, logits: &[f32]) -> f32 {
        let max = logits.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>();

        (logits[idx] - max).exp() / sum
    }
}
