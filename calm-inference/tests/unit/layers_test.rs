use super::*;

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tolerance, "index {i}: {a} != {e}");
    }
}

#[test]
fn test_rms_norm() {
    let norm = Norm::new(vec![1.0, 1.0, 2.0, 2.0], Normalization::RmsNorm, 0.0);
    let input = [1.0f32, -1.0, 1.0, -1.0];
    let mut output = [0.0f32; 4];

    norm.forward(&mut output, &input);
    assert_close(&output, &[1.0, -1.0, 2.0, -2.0], 1e-6);
}

#[test]
fn test_layer_norm_subtracts_mean() {
    let norm = Norm::new(vec![1.0; 4], Normalization::LayerNorm, 0.0);
    let mut x = [2.0f32, 4.0, 2.0, 4.0];

    norm.forward_inplace(&mut x);
    assert_close(&x, &[-1.0, 1.0, -1.0, 1.0], 1e-6);

    // Parallel LayerNorm normalizes the same way.
    let parallel = Norm::new(vec![1.0; 4], Normalization::LayerNormParallel, 0.0);
    let mut y = [2.0f32, 4.0, 2.0, 4.0];
    parallel.forward_inplace(&mut y);
    assert_eq!(x, y);
}

#[test]
fn test_norm_eps_keeps_zero_input_finite() {
    let norm = Norm::new(vec![1.0; 3], Normalization::RmsNorm, 1e-5);
    let mut x = [0.0f32; 3];
    norm.forward_inplace(&mut x);
    assert!(x.iter().all(|v| *v == 0.0));
}

#[test]
fn test_rope_rotates_pairs() {
    let rope = Rope::new(4, 4, 10000.0);
    assert_eq!(rope.freq(0), 1.0);
    assert!((rope.freq(2) - 0.01).abs() < 1e-7);

    let mut v = [1.0f32, 0.0, 1.0, 0.0];
    rope.apply(&mut v, 1.0);

    let (sin1, cos1) = 1.0f32.sin_cos();
    let (sin2, cos2) = 0.01f32.sin_cos();
    assert_close(&v, &[cos1, sin1, cos2, sin2], 1e-6);
}

#[test]
fn test_rope_partial_rotary_dim() {
    // Only the first two channels of each head rotate.
    let rope = Rope::new(4, 2, 10000.0);
    let mut v = [1.0f32, 0.0, 3.0, 4.0, 1.0, 0.0, 5.0, 6.0];
    rope.apply(&mut v, 2.0);

    let (sin, cos) = 2.0f32.sin_cos();
    assert_close(&v, &[cos, sin, 3.0, 4.0, cos, sin, 5.0, 6.0], 1e-6);
}

#[test]
fn test_rope_position_zero_is_identity() {
    let rope = Rope::new(4, 4, 500.0);
    let mut v = [0.3f32, -1.2, 2.5, 0.7];
    let original = v;
    rope.apply(&mut v, 0.0);
    assert_eq!(v, original);

    let mut h: Vec<f16> = original.iter().map(|&x| f16::from_f32(x)).collect();
    rope.apply_f16(&mut h, 0.0);
    assert!(h.iter().zip(&original).all(|(a, &b)| a.to_f32() == f16::from_f32(b).to_f32()));
}

#[test]
fn test_attention_weights_values() {
    // One head of size 2, two cached positions.
    let q = [1.0f32, 0.0];
    let keys: Vec<f16> = [2.0f32, 0.0, 0.0, 0.0].iter().map(|&v| f16::from_f32(v)).collect();
    let values: Vec<f16> = [1.0f32, 0.0, 0.0, 1.0].iter().map(|&v| f16::from_f32(v)).collect();

    let mut att = [0.0f32; 4];
    let mut out = [0.0f32; 2];
    attention(&mut out, &mut att, &q, &keys, &values, 2, 2, 0);

    let s = 2.0f32 / 2.0f32.sqrt();
    let p0 = s.exp() / (s.exp() + 1.0);
    assert_close(&out, &[p0, 1.0 - p0], 1e-6);
}

#[test]
fn test_attention_single_position_copies_value() {
    let q = [0.5f32, -0.5];
    // kv_dim 4 with the head at offset 2.
    let keys: Vec<f16> = [9.0f32, 9.0, 1.0, 1.0].iter().map(|&v| f16::from_f32(v)).collect();
    let values: Vec<f16> = [7.0f32, 7.0, 0.25, -3.0].iter().map(|&v| f16::from_f32(v)).collect();

    let mut att = [0.0f32; 1];
    let mut out = [0.0f32; 2];
    attention(&mut out, &mut att, &q, &keys, &values, 1, 4, 2);
    assert_close(&out, &[0.25, -3.0], 1e-6);
}

#[test]
fn test_activations() {
    assert_eq!(silu(0.0), 0.0);
    assert!((silu(1.0) - 0.7310586).abs() < 1e-6);
    assert_eq!(gelu(0.0), 0.0);
    assert!((gelu(1.0) - 0.8411920).abs() < 1e-5);
    assert!(gelu(-10.0).abs() < 1e-6);
}

#[test]
fn test_clip() {
    let mut x = [-5.0f32, 0.5, 7.0];
    clip(&mut x, 2.0);
    assert_eq!(x, [-2.0, 0.5, 2.0]);

    let mut y = [f32::MAX, -1e30];
    clip(&mut y, f32::MAX);
    assert_eq!(y, [f32::MAX, -1e30]);
}

#[test]
fn test_moe_gate_ties_go_to_lowest_index() {
    let mut weights = [0.0f32; 2];
    let mut experts = [0usize; 2];
    moe_gate(&mut weights, &mut experts, &[3.0, 3.0, 1.0]);

    assert_eq!(experts, [0, 1]);
    assert!((weights[0] - 0.5).abs() < 1e-6);
    assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
}

#[test]
fn test_moe_gate_picks_top_k_in_order() {
    let logits = [0.1f32, 2.0, -1.0, 1.0];
    let mut weights = [0.0f32; 2];
    let mut experts = [0usize; 2];
    moe_gate(&mut weights, &mut experts, &logits);

    assert_eq!(experts, [1, 3]);
    let e = (-1.0f32).exp();
    assert!((weights[0] - 1.0 / (1.0 + e)).abs() < 1e-6);
    assert!((weights[1] - e / (1.0 + e)).abs() < 1e-6);
}
