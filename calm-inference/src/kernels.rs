//! Dequantization and dot-product kernels for the supported weight encodings.

#[cfg(test)]
#[path = "../tests/unit/kernels_test.rs"]
mod kernels_test;

use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use rayon::prelude::*;

use crate::error::{CalmError, CalmResult};
use crate::tensors::DType;

/// Number of values packed into one gf4 word.
pub const GF4_GROUP_SIZE: usize = 8;

/// Inner product of row `row` (of length `n`) of a row-major weight matrix with `x`.
pub type DotKernel = fn(w: &[u8], n: usize, row: usize, x: &[f32]) -> f32;

/// Weight encoding shared by every quantized matrix of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightEncoding {
    /// Groups of 8 values in a little-endian u32: an fp8 scale byte and eight 3-bit fields.
    Gf4,
    /// Top byte of an IEEE half value.
    Fp8,
    /// IEEE half value.
    Fp16,
}

impl WeightEncoding {
    pub fn from_dbits(dbits: u32) -> CalmResult<Self> {
        match dbits {
            4 => Ok(WeightEncoding::Gf4),
            8 => Ok(WeightEncoding::Fp8),
            16 => Ok(WeightEncoding::Fp16),
            other => Err(CalmError::UnsupportedDbits(other)),
        }
    }

    /// Parses the `dtype` metadata value of a checkpoint.
    pub fn from_name(name: &str) -> CalmResult<Self> {
        match name {
            "gf4" => Ok(WeightEncoding::Gf4),
            "fp8" => Ok(WeightEncoding::Fp8),
            "fp16" => Ok(WeightEncoding::Fp16),
            other => Err(CalmError::config(format!("unsupported weight dtype '{other}', expected gf4, fp8 or fp16"))),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            WeightEncoding::Gf4 => "gf4",
            WeightEncoding::Fp8 => "fp8",
            WeightEncoding::Fp16 => "fp16",
        }
    }

    /// Bits per weight.
    pub const fn dbits(self) -> u32 {
        match self {
            WeightEncoding::Gf4 => 4,
            WeightEncoding::Fp8 => 8,
            WeightEncoding::Fp16 => 16,
        }
    }

    /// Container dtype used to store matrices with this encoding.
    pub const fn dtype(self) -> DType {
        match self {
            WeightEncoding::Gf4 => DType::I32,
            WeightEncoding::Fp8 => DType::F8E5M2,
            WeightEncoding::Fp16 => DType::F16,
        }
    }

    /// Number of weights held by one stored element.
    pub const fn group_size(self) -> usize {
        match self {
            WeightEncoding::Gf4 => GF4_GROUP_SIZE,
            WeightEncoding::Fp8 | WeightEncoding::Fp16 => 1,
        }
    }

    /// Bytes taken by `n` weights.
    pub const fn row_bytes(self, n: usize) -> usize {
        n * self.dbits() as usize / 8
    }

    pub fn kernel(self) -> DotKernel {
        match self {
            WeightEncoding::Gf4 => dotprod_gf4,
            WeightEncoding::Fp8 => dotprod_fp8,
            WeightEncoding::Fp16 => dotprod_fp16,
        }
    }

    /// Decodes row `row` of length `out.len()` into `out`.
    pub fn dequantize_row(self, w: &[u8], row: usize, out: &mut [f32]) {
        let n = out.len();
        let bytes = &w[row * self.row_bytes(n)..(row + 1) * self.row_bytes(n)];

        match self {
            WeightEncoding::Gf4 => {
                for (word, values) in bytes.chunks_exact(4).zip(out.chunks_exact_mut(GF4_GROUP_SIZE)) {
                    let word = LittleEndian::read_u32(word);
                    let scale = gf4_scale(word);
                    for (k, value) in values.iter_mut().enumerate() {
                        *value = gf4_field(word, k) as f32 * scale;
                    }
                }
            }
            WeightEncoding::Fp8 => {
                for (&byte, value) in bytes.iter().zip(out.iter_mut()) {
                    *value = fp8_to_f32(byte);
                }
            }
            WeightEncoding::Fp16 => {
                for (half, value) in bytes.chunks_exact(2).zip(out.iter_mut()) {
                    *value = f16::from_bits(LittleEndian::read_u16(half)).to_f32();
                }
            }
        }
    }
}

/// Decodes an fp8 byte: the high byte of a half value whose low byte is zero.
#[inline]
pub fn fp8_to_f32(byte: u8) -> f32 {
    f16::from_bits((byte as u16) << 8).to_f32()
}

/// Scale of a gf4 word.
#[inline]
pub fn gf4_scale(word: u32) -> f32 {
    fp8_to_f32(word as u8) / -4.0
}

/// Signed quantized value `k` of a gf4 word, in `[-4, 3]`.
#[inline]
pub fn gf4_field(word: u32, k: usize) -> i32 {
    ((word >> (8 + 3 * k)) & 7) as i32 - 4
}

fn dotprod_fp16(w: &[u8], n: usize, row: usize, x: &[f32]) -> f32 {
    let bytes = &w[row * n * 2..(row + 1) * n * 2];

    bytes
        .chunks_exact(2)
        .zip(&x[..n])
        .fold(0.0f32, |acc, (half, &x)| acc + f16::from_bits(LittleEndian::read_u16(half)).to_f32() * x)
}

fn dotprod_fp8(w: &[u8], n: usize, row: usize, x: &[f32]) -> f32 {
    let bytes = &w[row * n..(row + 1) * n];

    bytes.iter().zip(&x[..n]).fold(0.0f32, |acc, (&byte, &x)| acc + fp8_to_f32(byte) * x)
}

fn dotprod_gf4(w: &[u8], n: usize, row: usize, x: &[f32]) -> f32 {
    debug_assert_eq!(n % GF4_GROUP_SIZE, 0, "n must be divisible by {GF4_GROUP_SIZE}");

    let row_bytes = n / 2;
    let bytes = &w[row * row_bytes..(row + 1) * row_bytes];

    let mut acc = 0.0f32;
    for (word, xs) in bytes.chunks_exact(4).zip(x[..n].chunks_exact(GF4_GROUP_SIZE)) {
        let word = LittleEndian::read_u32(word);
        let scale = gf4_scale(word);
        for (k, &x) in xs.iter().enumerate() {
            acc += gf4_field(word, k) as f32 * scale * x;
        }
    }
    acc
}

/// Computes `out[i] = dot(w[i], x) + bias[i]` for the first `d` rows of an `[d, n]` matrix.
///
/// Rows run in parallel; the accumulation order within a row is fixed.
pub fn matmul(
    out: &mut [f32],
    x: &[f32],
    w: &[u8],
    bias: Option<&[f32]>,
    n: usize,
    d: usize,
    encoding: WeightEncoding,
) {
    assert!(out.len() >= d, "Output slice length must be at least d parameter: {} >= {}", out.len(), d);
    assert!(x.len() >= n, "Input slice length must be at least n parameter: {} >= {}", x.len(), n);
    assert!(w.len() >= encoding.row_bytes(n) * d, "Weight matrix is too small: {} bytes for [{d}, {n}]", w.len());

    let kernel = encoding.kernel();

    out[..d].par_iter_mut().enumerate().for_each(|(row, out_val)| {
        let mut value = kernel(w, n, row, x);
        if let Some(bias) = bias {
            value += bias[row];
        }
        *out_val = value;
    });
}
