//! Encoders for the checkpoint weight encodings.
//!
//! Each encoder is the inverse of the matching decoder in `calm_inference::kernels`; the
//! reconstruction error is measured with those decoders.

#[cfg(test)]
#[path = "../tests/unit/quantization_test.rs"]
mod quantization_test;

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use calm_inference::WeightEncoding;
use calm_inference::kernels::GF4_GROUP_SIZE;
use half::f16;
use rayon::prelude::*;

/// Largest finite fp8 byte magnitude (57344).
const FP8_MAX_FINITE: u8 = 0x7B;
const FP8_NAN: u8 = 0x7E;

/// Encoded weight matrix.
#[derive(Debug)]
pub struct QuantizedTensor {
    pub bytes: Vec<u8>,
    pub max_error: f32,
}

/// Encodes a row-major matrix with rows of `cols` values.
pub fn quantize(encoding: WeightEncoding, values: &[f32], cols: usize) -> Result<QuantizedTensor> {
    if cols == 0 || values.len() % cols != 0 {
        anyhow::bail!("{} values do not form rows of {cols}", values.len());
    }
    if cols % encoding.group_size() != 0 {
        anyhow::bail!("Row length {cols} is not a multiple of the {} group size {}", encoding.name(), encoding.group_size());
    }

    let row_bytes = encoding.row_bytes(cols);
    let mut bytes = vec![0u8; values.len() / cols * row_bytes];

    let max_error = bytes
        .par_chunks_mut(row_bytes)
        .zip(values.par_chunks(cols))
        .map(|(out, row)| {
            encode_row(encoding, row, out);

            let mut decoded = vec![0.0f32; cols];
            encoding.dequantize_row(out, 0, &mut decoded);
            row.iter().zip(&decoded).map(|(&x, &y)| (x - y).abs()).fold(0.0f32, f32::max)
        })
        .reduce(|| 0.0, f32::max);

    Ok(QuantizedTensor { bytes, max_error })
}

fn encode_row(encoding: WeightEncoding, row: &[f32], out: &mut [u8]) {
    match encoding {
        WeightEncoding::Fp16 => {
            for (&x, half) in row.iter().zip(out.chunks_exact_mut(2)) {
                LittleEndian::write_u16(half, f16::from_f32(x).to_bits());
            }
        }
        WeightEncoding::Fp8 => {
            for (&x, byte) in row.iter().zip(out.iter_mut()) {
                *byte = encode_fp8(x);
            }
        }
        WeightEncoding::Gf4 => {
            for (group, word) in row.chunks_exact(GF4_GROUP_SIZE).zip(out.chunks_exact_mut(4)) {
                LittleEndian::write_u32(word, encode_gf4(group));
            }
        }
    }
}

/// Rounds `x` to a half value and keeps its top byte, rounding the dropped byte to nearest even.
///
/// Values beyond the fp8 range saturate to the largest finite magnitude.
pub fn encode_fp8(x: f32) -> u8 {
    if x.is_nan() {
        return FP8_NAN;
    }

    let bits = f16::from_f32(x).to_bits();
    let sign = (bits >> 8) as u8 & 0x80;
    let magnitude = bits & 0x7FFF;

    let rounded = (magnitude + 0x7F + ((magnitude >> 8) & 1)) >> 8;
    let rounded = if x.is_infinite() { 0x7C } else { (rounded as u8).min(FP8_MAX_FINITE) };

    sign | rounded
}

/// Packs 8 values into a gf4 word.
///
/// The scale byte is the fp8 value of the largest-magnitude element (sign included), so that
/// element decodes exactly to field 0; fields are `clamp(round(x / s), -4, 3) + 4` with
/// `s = fp8(byte) / -4`.
pub fn encode_gf4(group: &[f32]) -> u32 {
    debug_assert_eq!(group.len(), GF4_GROUP_SIZE);

    let extreme = group.iter().fold(0.0f32, |acc, &x| if x.abs() > acc.abs() { x } else { acc });
    let scale_byte = encode_fp8(extreme);
    let scale = calm_inference::kernels::fp8_to_f32(scale_byte) / -4.0;

    group.iter().enumerate().fold(scale_byte as u32, |word, (k, &x)| {
        let q = if scale == 0.0 { 0 } else { (x / scale).round().clamp(-4.0, 3.0) as i32 };
        word | (((q + 4) as u32) << (8 + 3 * k))
    })
}
