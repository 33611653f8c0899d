use super::*;

fn fp16_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|&v| f16::from_f32(v).to_le_bytes()).collect()
}

/// Packs eight 3-bit fields (already offset by 4) with a scale byte.
fn gf4_word(scale_byte: u8, fields: [u32; 8]) -> u32 {
    fields.iter().enumerate().fold(scale_byte as u32, |word, (k, &q)| word | (q & 7) << (8 + 3 * k))
}

#[test]
fn test_encoding_from_dbits() {
    assert_eq!(WeightEncoding::from_dbits(4).unwrap(), WeightEncoding::Gf4);
    assert_eq!(WeightEncoding::from_dbits(8).unwrap(), WeightEncoding::Fp8);
    assert_eq!(WeightEncoding::from_dbits(16).unwrap(), WeightEncoding::Fp16);

    for dbits in [0, 2, 5, 32] {
        assert!(matches!(WeightEncoding::from_dbits(dbits), Err(CalmError::UnsupportedDbits(d)) if d == dbits));
    }
}

#[test]
fn test_encoding_from_name() {
    for encoding in [WeightEncoding::Gf4, WeightEncoding::Fp8, WeightEncoding::Fp16] {
        assert_eq!(WeightEncoding::from_name(encoding.name()).unwrap(), encoding);
        assert_eq!(WeightEncoding::from_dbits(encoding.dbits()).unwrap(), encoding);
    }
    assert!(matches!(WeightEncoding::from_name("q8"), Err(CalmError::Config(_))));
}

#[test]
fn test_encoding_storage_layout() {
    assert_eq!(WeightEncoding::Gf4.dtype(), DType::I32);
    assert_eq!(WeightEncoding::Fp8.dtype(), DType::F8E5M2);
    assert_eq!(WeightEncoding::Fp16.dtype(), DType::F16);

    assert_eq!(WeightEncoding::Gf4.group_size(), 8);
    assert_eq!(WeightEncoding::Gf4.row_bytes(16), 8);
    assert_eq!(WeightEncoding::Fp8.row_bytes(16), 16);
    assert_eq!(WeightEncoding::Fp16.row_bytes(16), 32);
}

#[test]
fn test_fp8_decode() {
    assert_eq!(fp8_to_f32(0), 0.0);
    assert_eq!(fp8_to_f32(0x3C), 1.0);
    assert_eq!(fp8_to_f32(0xBC), -1.0);
    assert_eq!(fp8_to_f32(0x40), 2.0);
    assert_eq!(fp8_to_f32(0x38), 0.5);

    // Monotonic over the finite positive range.
    for byte in 1u8..0x7C {
        assert!(fp8_to_f32(byte) > fp8_to_f32(byte - 1), "byte {byte:#x}");
    }
}

#[test]
fn test_fp16_bit_patterns_survive() {
    for bits in [0x0000u16, 0x3C00, 0xC000, 0x7BFF, 0x0001, 0x8400] {
        let decoded = f16::from_bits(bits).to_f32();
        assert_eq!(f16::from_f32(decoded).to_bits(), bits);

        let mut out = [0.0f32];
        WeightEncoding::Fp16.dequantize_row(&bits.to_le_bytes(), 0, &mut out);
        assert_eq!(out[0], decoded);
    }
}

#[test]
fn test_gf4_fields_decode_exactly() {
    // Scale byte 0xBC decodes to -1.0, so the scale is 0.25.
    let word = gf4_word(0xBC, [0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(gf4_scale(word), 0.25);

    for k in 0..8 {
        assert_eq!(gf4_field(word, k), k as i32 - 4);
    }

    let mut out = [0.0f32; 8];
    WeightEncoding::Gf4.dequantize_row(&word.to_le_bytes(), 0, &mut out);
    assert_eq!(out, [-1.0, -0.75, -0.5, -0.25, 0.0, 0.25, 0.5, 0.75]);
}

#[test]
fn test_gf4_zero_scale() {
    let word = gf4_word(0, [7, 0, 3, 5, 1, 2, 6, 4]);
    assert_eq!(gf4_scale(word), 0.0);

    let mut out = [1.0f32; 8];
    WeightEncoding::Gf4.dequantize_row(&word.to_le_bytes(), 0, &mut out);
    assert!(out.iter().all(|v| *v == 0.0 && v.is_finite()));
}

#[test]
fn test_dotprod_matches_dequantized_row() {
    let x: Vec<f32> = (0..16).map(|i| (i as f32 - 7.5) * 0.125).collect();

    let fp16 = fp16_bytes(&(0..32).map(|i| (i as f32) * 0.0625 - 1.0).collect::<Vec<_>>());
    let fp8: Vec<u8> = (0..32).map(|i| 0x30 + (i % 16) as u8).collect();
    let gf4: Vec<u8> = (0..4u32)
        .flat_map(|i| gf4_word(0xB8 + i as u8, [i, 7 - i, 3, 4, 5, 1, 6, 2]).to_le_bytes())
        .collect();

    for (encoding, w) in [(WeightEncoding::Fp16, &fp16), (WeightEncoding::Fp8, &fp8), (WeightEncoding::Gf4, &gf4)] {
        for row in 0..2 {
            let mut dequantized = vec![0.0f32; 16];
            encoding.dequantize_row(w, row, &mut dequantized);
            let expected = dequantized.iter().zip(&x).fold(0.0f32, |acc, (&w, &x)| acc + w * x);

            let actual = encoding.kernel()(w, 16, row, &x);
            assert!((actual - expected).abs() <= 1e-5 * expected.abs().max(1.0), "{encoding:?} row {row}");
        }
    }
}

#[test]
fn test_matmul_with_bias() {
    // [[1, 2], [3, 4], [5, 6]] in fp16
    let w = fp16_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let x = [1.0f32, -1.0];
    let bias = [0.5f32, 0.0, -0.5];

    let mut out = [0.0f32; 3];
    matmul(&mut out, &x, &w, None, 2, 3, WeightEncoding::Fp16);
    assert_eq!(out, [-1.0, -1.0, -1.0]);

    matmul(&mut out, &x, &w, Some(&bias), 2, 3, WeightEncoding::Fp16);
    assert_eq!(out, [-0.5, -1.0, -1.5]);
}

#[test]
#[should_panic]
fn test_matmul_rejects_short_weights() {
    let w = fp16_bytes(&[1.0, 2.0]);
    let mut out = [0.0f32; 2];
    matmul(&mut out, &[1.0, 1.0], &w, None, 2, 2, WeightEncoding::Fp16);
}
