#[cfg(test)]
#[path = "../tests/unit/generation_test.rs"]
mod generation_test;

use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::time::Instant;

use crate::sampler::Sampler;
use crate::tokenizer::{EncodeFlags, Tokenizer};
use crate::transformer::{ForwardMode, RunState, Transformer};

/// Prompt format of instruction-tuned models, picked from the end-of-turn token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|eot_id|>`
    Llama3,
    /// `<|im_end|>`
    ChatMl,
    /// `<|end|>`
    Phi3,
    /// `[INST] ... [/INST]`
    Inst,
}

impl ChatTemplate {
    pub fn detect(tokenizer: &Tokenizer) -> Self {
        let eot = tokenizer.eot_token_id().map(|id| tokenizer.token(id));
        match eot {
            Some(b"<|eot_id|>") => ChatTemplate::Llama3,
            Some(b"<|im_end|>") => ChatTemplate::ChatMl,
            Some(b"<|end|>") => ChatTemplate::Phi3,
            _ => ChatTemplate::Inst,
        }
    }

    /// Renders one user turn; `first` marks the start of the conversation.
    pub fn render(self, system: Option<&str>, user: &str, first: bool) -> String {
        let separator = if first { "" } else { "\n" };

        match (self, system) {
            (ChatTemplate::Llama3, Some(system)) => format!(
                "<|start_header_id|>system<|end_header_id|>\n\n{system}<|eot_id|>\
                 <|start_header_id|>user<|end_header_id|>\n\n{user}<|eot_id|>\
                 <|start_header_id|>assistant<|end_header_id|>\n\n"
            ),
            (ChatTemplate::Llama3, None) => format!(
                "<|start_header_id|>user<|end_header_id|>\n\n{user}<|eot_id|>\
                 <|start_header_id|>assistant<|end_header_id|>\n\n"
            ),
            (ChatTemplate::ChatMl, Some(system)) => format!(
                "{separator}<|im_start|>system\n{system}<|im_end|>\n<|im_start|>user\n{user}<|im_end|>\n<|im_start|>assistant\n"
            ),
            (ChatTemplate::ChatMl, None) => {
                format!("{separator}<|im_start|>user\n{user}<|im_end|>\n<|im_start|>assistant\n")
            }
            (ChatTemplate::Phi3, Some(system)) => {
                format!("{separator}<|system|>\n{system}<|end|>\n<|user|>\n{user}<|end|>\n<|assistant|>\n")
            }
            (ChatTemplate::Phi3, None) => format!("{separator}<|user|>\n{user}<|end|>\n<|assistant|>\n"),
            (ChatTemplate::Inst, Some(system)) => format!("[INST] {system}\n\n{user} [/INST]"),
            (ChatTemplate::Inst, None) => format!("[INST] {user} [/INST]"),
        }
    }
}

/// Completes `prompt` with up to `steps` sampled tokens, streaming text to `out`.
///
/// Returns the generated token ids (the stop token excluded).
pub fn generate<W: Write>(
    transformer: &Transformer,
    state: &mut RunState,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: &str,
    steps: usize,
    out: &mut W,
) -> Result<Vec<u32>> {
    let prompt_tokens = tokenizer.encode(prompt, EncodeFlags { bos: true, eos: false });

    let Some((&last, prefix)) = prompt_tokens.split_last() else {
        anyhow::bail!("Please provide a prompt");
    };

    let mut prev = None;
    for (pos, &token) in prefix.iter().chain([&last]).enumerate() {
        if pos < prefix.len() {
            transformer.forward(state, token as usize, pos, ForwardMode::UpdateKvOnly);
        }
        // BOS is not echoed.
        if Some(token) != tokenizer.bos_token_id() {
            output_token(out, tokenizer, prev, token)?;
        }
        prev = Some(token);
    }

    let mut metrics = TokenMetrics::new();
    let mut generated = Vec::with_capacity(steps);
    let mut token = last;
    let mut pos = prefix.len();

    for _ in 0..steps {
        metrics.start_generation();
        let next = next_token(transformer, state, sampler, token, pos)?;
        metrics.increment_token();

        if tokenizer.is_stop(next) {
            break;
        }

        output_token(out, tokenizer, Some(token), next)?;
        generated.push(next);
        token = next;
        pos += 1;
    }

    writeln!(out)?;
    metrics.report_and_reset(out)?;
    Ok(generated)
}

/// Interactive chat: reads user turns from `input` until an empty line or EOF.
///
/// With `cli_user_prompt` a single turn is answered. The context keeps growing across turns
/// and wraps through the attention sinks once it exceeds the sequence length.
#[allow(clippy::too_many_arguments)]
pub fn chat<R: BufRead, W: Write>(
    transformer: &Transformer,
    state: &mut RunState,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    cli_user_prompt: Option<&str>,
    system_prompt: Option<&str>,
    steps: usize,
    input: &mut R,
    out: &mut W,
) -> Result<()> {
    let template = ChatTemplate::detect(tokenizer);
    let mut metrics = TokenMetrics::new();
    let mut pos = 0;

    loop {
        let user_prompt = match (pos, cli_user_prompt) {
            (0, Some(prompt)) => prompt.to_string(),
            (_, Some(_)) => break,
            _ => match read_user_input(input, out)? {
                Some(line) => line,
                None => break,
            },
        };

        let first = pos == 0;
        let rendered = template.render(if first { system_prompt } else { None }, &user_prompt, first);
        let prompt_tokens = tokenizer.encode(&rendered, EncodeFlags { bos: first, eos: false });

        let Some((&last, prefix)) = prompt_tokens.split_last() else {
            continue;
        };

        for &token in prefix {
            transformer.forward(state, token as usize, pos, ForwardMode::UpdateKvOnly);
            pos += 1;
        }

        let mut token = last;
        for _ in 0..steps {
            metrics.start_generation();
            let next = next_token(transformer, state, sampler, token, pos)?;
            metrics.increment_token();
            pos += 1;

            if tokenizer.is_stop(next) {
                // Keep the end of turn in context for the next turn.
                transformer.forward(state, next as usize, pos, ForwardMode::UpdateKvOnly);
                pos += 1;
                break;
            }

            output_token(out, tokenizer, Some(token), next)?;
            token = next;
        }

        writeln!(out)?;
        metrics.report_and_reset(out)?;
    }

    Ok(())
}

/// Perplexity of `text` under the model.
///
/// Each position predicts the next token; the result is `exp(mean(-ln p(next)))`.
pub fn study<W: Write>(transformer: &Transformer, state: &mut RunState, tokenizer: &Tokenizer, text: &str, out: &mut W) -> Result<f64> {
    let tokens = tokenizer.encode(text, EncodeFlags { bos: true, eos: false });
    if tokens.len() < 2 {
        anyhow::bail!("Need at least two tokens to evaluate perplexity, got {}", tokens.len());
    }

    let start = Instant::now();
    let mut nll = 0.0f64;

    for (pos, pair) in tokens.windows(2).enumerate() {
        let logits = transformer
            .forward(state, pair[0] as usize, pos, ForwardMode::Logits)
            .context("Forward pass produced no logits")?;
        let prob = Sampler::sample_prob(pair[1] as usize, logits);
        nll -= f64::from(prob).ln();
    }

    let evaluated = tokens.len() - 1;
    let perplexity = (nll / evaluated as f64).exp();

    writeln!(
        out,
        "[Perplexity {perplexity:.4} over {evaluated} tokens in {:.2}s]",
        start.elapsed().as_secs_f64()
    )?;
    Ok(perplexity)
}

fn next_token(transformer: &Transformer, state: &mut RunState, sampler: &mut Sampler, token: u32, pos: usize) -> Result<u32> {
    let logits = transformer
        .forward(state, token as usize, pos, ForwardMode::Logits)
        .context("Forward pass produced no logits")?;
    let mut logits_copy = logits.to_vec();
    Ok(sampler.sample(&mut logits_copy) as u32)
}

fn output_token<W: Write>(out: &mut W, tokenizer: &Tokenizer, prev: Option<u32>, token: u32) -> Result<()> {
    out.write_all(tokenizer.decode(prev, token))?;
    out.flush()?;
    Ok(())
}

fn read_user_input<R: BufRead, W: Write>(input: &mut R, out: &mut W) -> Result<Option<String>> {
    write!(out, "> ")?;
    out.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }

    let line = line.trim();
    Ok(if line.is_empty() { None } else { Some(line.to_string()) })
}

/// Tracks token generation performance metrics
pub struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    pub fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    pub fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    pub fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    pub fn generated_count(&self) -> usize {
        self.generated_count
    }

    pub fn report_and_reset<W: Write>(&mut self, out: &mut W) -> Result<()> {
        if let Some(start_time) = self.start_time.take() {
            let duration = start_time.elapsed().as_secs_f64();
            if self.generated_count > 0 && duration > 0.0 {
                let tps = self.generated_count as f64 / duration;
                writeln!(out, "[Generated {} tokens in {duration:.2}s - {tps:.2} tokens/sec]", self.generated_count)?;
            }
        }
        self.generated_count = 0;
        Ok(())
    }
}

impl Default for TokenMetrics {
    fn default() -> Self {
        Self::new()
    }
}
