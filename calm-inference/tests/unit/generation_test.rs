use super::*;

fn tokenizer_with(tokens: &[&str]) -> Tokenizer {
    let mut blob = Vec::new();
    for token in tokens {
        blob.extend_from_slice(token.as_bytes());
        blob.push(0);
    }
    Tokenizer::new(&blob, &vec![0.0; tokens.len()], tokens.len(), None, None).unwrap()
}

#[test]
fn test_template_detection() {
    assert_eq!(ChatTemplate::detect(&tokenizer_with(&["a", "<|eot_id|>"])), ChatTemplate::Llama3);
    assert_eq!(ChatTemplate::detect(&tokenizer_with(&["<|im_end|>", "a"])), ChatTemplate::ChatMl);
    assert_eq!(ChatTemplate::detect(&tokenizer_with(&["<|end|>"])), ChatTemplate::Phi3);
    assert_eq!(ChatTemplate::detect(&tokenizer_with(&["a", "b"])), ChatTemplate::Inst);

    // Llama 3 wins when several markers are present.
    assert_eq!(ChatTemplate::detect(&tokenizer_with(&["<|im_end|>", "<|eot_id|>"])), ChatTemplate::Llama3);
}

#[test]
fn test_render_llama3() {
    let rendered = ChatTemplate::Llama3.render(Some("Be brief."), "Hi", true);
    assert_eq!(
        rendered,
        "<|start_header_id|>system<|end_header_id|>\n\nBe brief.<|eot_id|>\
         <|start_header_id|>user<|end_header_id|>\n\nHi<|eot_id|>\
         <|start_header_id|>assistant<|end_header_id|>\n\n"
    );
}

#[test]
fn test_render_chatml_turns() {
    let first = ChatTemplate::ChatMl.render(None, "Hi", true);
    assert_eq!(first, "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n");

    let next = ChatTemplate::ChatMl.render(None, "More", false);
    assert!(next.starts_with("\n<|im_start|>user\nMore"));
}

#[test]
fn test_render_inst() {
    assert_eq!(ChatTemplate::Inst.render(None, "Hi", true), "[INST] Hi [/INST]");
    assert_eq!(ChatTemplate::Inst.render(Some("Sys"), "Hi", true), "[INST] Sys\n\nHi [/INST]");
    assert_eq!(ChatTemplate::Phi3.render(None, "Hi", true), "<|user|>\nHi<|end|>\n<|assistant|>\n");
}

#[test]
fn test_token_metrics_reset() {
    let mut metrics = TokenMetrics::new();
    metrics.start_generation();
    metrics.increment_token();
    metrics.increment_token();
    assert_eq!(metrics.generated_count(), 2);

    let mut out = Vec::new();
    metrics.report_and_reset(&mut out).unwrap();
    assert_eq!(metrics.generated_count(), 0);

    // Nothing is reported without a started generation.
    let mut out = Vec::new();
    metrics.report_and_reset(&mut out).unwrap();
    assert!(out.is_empty());
}
