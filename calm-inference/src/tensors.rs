//! Tensor container parser.
//!
//! A checkpoint is laid out as:
//!
//! ```text
//! [u64 LE header length L][L bytes of JSON header][payload]
//! ```
//!
//! The header is a restricted JSON object: every key except `__metadata__` names a tensor
//! described by `dtype`, `shape` (1-4 integers) and `data_offsets` (relative to the payload).
//! `__metadata__` holds a flat string to string map. Strings cannot contain escapes and
//! numbers are plain decimal integers. Tensor payloads are never copied: the store keeps the
//! whole file and hands out byte views into it.

#[cfg(test)]
#[path = "../tests/unit/tensors_test.rs"]
mod tensors_test;

use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{CalmError, CalmResult};
use crate::utils::Storage;

/// Size of the little-endian header length prefix.
const HEADER_LENGTH_SIZE: usize = 8;
/// Reserved header key holding string metadata.
const METADATA_KEY: &str = "__metadata__";
/// Maximum number of tensor dimensions.
pub const MAX_DIMS: usize = 4;
/// Upper bound on the number of elements of a single tensor.
const MAX_ELEMENTS: usize = i32::MAX as usize;

/// Element type of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
    F8E5M2,
    F8E4M3,
    I32,
    I16,
    I8,
    U8,
}

impl DType {
    /// Size of a single element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::F8E5M2 | DType::F8E4M3 | DType::I8 | DType::U8 => 1,
        }
    }

    /// Name used in the container header.
    pub const fn name(self) -> &'static str {
        match self {
            DType::F32 => "F32",
            DType::F16 => "F16",
            DType::BF16 => "BF16",
            DType::F8E5M2 => "F8_E5M2",
            DType::F8E4M3 => "F8_E4M3",
            DType::I32 => "I32",
            DType::I16 => "I16",
            DType::I8 => "I8",
            DType::U8 => "U8",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "F32" => DType::F32,
            "F16" => DType::F16,
            "BF16" => DType::BF16,
            "F8_E5M2" => DType::F8E5M2,
            "F8_E4M3" => DType::F8E4M3,
            "I32" => DType::I32,
            "I16" => DType::I16,
            "I8" => DType::I8,
            "U8" => DType::U8,
            _ => return None,
        })
    }
}

/// Descriptor of a tensor stored in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub name: String,
    pub dtype: DType,
    /// Dimension sizes; unused trailing dimensions are 0.
    pub shape: [usize; MAX_DIMS],
    /// Number of dimensions declared in the header.
    pub rank: usize,
    /// Byte offset relative to the start of the payload region.
    pub offset: usize,
    /// Length in bytes.
    pub size: usize,
}

impl Tensor {
    /// Declared dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.shape[..self.rank]
    }

    pub fn elements(&self) -> usize {
        self.size / self.dtype.size()
    }
}

/// Non-owning view of a byte range inside the store's buffer (absolute offsets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    offset: usize,
    len: usize,
}

impl TensorView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrows the view to `len` bytes starting `offset` bytes into it.
    pub fn subview(&self, offset: usize, len: usize) -> TensorView {
        assert!(offset + len <= self.len, "subview {offset}+{len} is out of bounds of {}", self.len);
        TensorView { offset: self.offset + offset, len }
    }
}

/// Parsed checkpoint: owns the file bytes and describes the tensors and metadata inside.
pub struct TensorStore {
    storage: Storage,
    payload_start: usize,
    tensors: Vec<Tensor>,
    metadata: Vec<(String, String)>,
}

impl TensorStore {
    /// Memory-maps and parses the checkpoint at `path`.
    pub fn open(path: impl AsRef<Path>) -> CalmResult<Self> {
        Self::parse(Storage::map(path.as_ref())?)
    }

    /// Parses a checkpoint held in memory, taking ownership of the buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> CalmResult<Self> {
        Self::parse(Storage::from(bytes))
    }

    fn parse(storage: Storage) -> CalmResult<Self> {
        let bytes: &[u8] = &storage;
        if bytes.len() < HEADER_LENGTH_SIZE {
            return Err(CalmError::format(format!("file is too small for a header: {} bytes", bytes.len())));
        }

        let header_len = LittleEndian::read_u64(&bytes[..HEADER_LENGTH_SIZE]);
        let available = bytes.len() - HEADER_LENGTH_SIZE;
        let header_len = usize::try_from(header_len)
            .ok()
            .filter(|&len| len > 0 && len <= available)
            .ok_or_else(|| CalmError::format(format!("invalid header length {header_len}, file has {available} bytes")))?;

        let payload_start = HEADER_LENGTH_SIZE + header_len;
        let payload_size = bytes.len() - payload_start;
        let header = &bytes[HEADER_LENGTH_SIZE..payload_start];

        let (tensors, metadata) = HeaderParser::new(header, payload_size).parse()?;

        Ok(Self { storage, payload_start, tensors, metadata })
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// Metadata pairs in header order.
    pub fn metadata_entries(&self) -> &[(String, String)] {
        &self.metadata
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Size of the payload region in bytes.
    pub fn payload_size(&self) -> usize {
        self.storage.len() - self.payload_start
    }

    pub fn find(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|tensor| tensor.name == name)
    }

    /// Finds a tensor by a name template with a single `%d` replaced by `layer`.
    pub fn find_layer(&self, template: &str, layer: usize) -> Option<&Tensor> {
        self.find(&layer_name(template, layer))
    }

    /// Finds a tensor and checks that its dtype and shape are exactly as expected.
    pub fn get(&self, template: &str, layer: usize, dtype: DType, shape: [usize; MAX_DIMS]) -> CalmResult<&Tensor> {
        let name = layer_name(template, layer);
        let tensor = self.find(&name).ok_or_else(|| CalmError::MissingTensor(name.clone()))?;

        if tensor.dtype != dtype || tensor.shape != shape {
            return Err(CalmError::TensorMismatch {
                name,
                expected_dtype: dtype,
                expected_shape: shape,
                actual_dtype: tensor.dtype,
                actual_shape: tensor.shape,
            });
        }

        Ok(tensor)
    }

    pub fn view(&self, tensor: &Tensor) -> TensorView {
        TensorView { offset: self.payload_start + tensor.offset, len: tensor.size }
    }

    pub fn slice(&self, view: TensorView) -> &[u8] {
        &self.storage[view.offset..view.offset + view.len]
    }

    /// Raw payload bytes of a tensor.
    pub fn bytes(&self, tensor: &Tensor) -> &[u8] {
        self.slice(self.view(tensor))
    }

    /// Reinterprets the tensor bytes as little-endian f32 values, whatever the declared dtype.
    pub fn f32_values(&self, tensor: &Tensor) -> Vec<f32> {
        let bytes = self.bytes(tensor);
        let count = bytes.len() / std::mem::size_of::<f32>();
        let mut values = vec![0.0; count];
        LittleEndian::read_f32_into(&bytes[..count * std::mem::size_of::<f32>()], &mut values);
        values
    }
}

impl std::fmt::Debug for TensorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorStore")
            .field("tensors", &self.tensors.len())
            .field("metadata", &self.metadata)
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

/// Substitutes the first `%d` in `template` with the layer index.
pub fn layer_name(template: &str, layer: usize) -> String {
    template.replacen("%d", &layer.to_string(), 1)
}

/// Returns the byte size implied by dtype and shape, or `None` when the element count does not
/// fit into the element budget. Zero dimensions count as one.
fn expected_size(dtype: DType, shape: &[usize; MAX_DIMS]) -> Option<usize> {
    let mut elements = 1usize;
    let mut remaining = MAX_ELEMENTS;

    for &dim in shape {
        let dim = dim.max(1);
        if dim > remaining {
            return None;
        }
        elements *= dim;
        remaining /= dim;
    }

    elements.checked_mul(dtype.size())
}

type Metadata = Vec<(String, String)>;

/// Recursive-descent parser over the restricted JSON header.
struct HeaderParser<'a> {
    json: &'a [u8],
    pos: usize,
    payload_size: usize,
}

impl<'a> HeaderParser<'a> {
    fn new(json: &'a [u8], payload_size: usize) -> Self {
        Self { json, pos: 0, payload_size }
    }

    fn parse(mut self) -> CalmResult<(Vec<Tensor>, Metadata)> {
        let mut tensors = Vec::new();
        let mut metadata = Vec::new();
        let mut seen = HashSet::new();

        self.object(|parser, key| {
            if !seen.insert(key) {
                return Err(parser.error(&format!("duplicate key '{key}'")));
            }
            if key == METADATA_KEY {
                parser.metadata(&mut metadata)
            } else {
                tensors.push(parser.tensor(key)?);
                Ok(())
            }
        })?;

        // Whatever follows the object can only be padding.
        if let Some(offset) = self.json[self.pos..].iter().position(|&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0)) {
            return Err(self.error_at(self.pos + offset, "unexpected data after the header object"));
        }

        Ok((tensors, metadata))
    }

    /// Parses `{ "key": value, ... }`, calling `on_entry` positioned at each value.
    fn object<F>(&mut self, mut on_entry: F) -> CalmResult<()>
    where
        F: FnMut(&mut Self, &'a str) -> CalmResult<()>,
    {
        self.skip_ws();
        self.expect(b'{')?;
        self.skip_ws();

        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(());
        }

        loop {
            let key = self.string()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();

            on_entry(self, key)?;

            self.skip_ws();
            match self.next() {
                Some(b',') => self.skip_ws(),
                Some(b'}') => return Ok(()),
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn metadata(&mut self, metadata: &mut Metadata) -> CalmResult<()> {
        let mut seen = HashSet::new();
        self.object(|parser, key| {
            if !seen.insert(key) {
                return Err(parser.error(&format!("duplicate metadata key '{key}'")));
            }
            let value = parser.string()?;
            metadata.push((key.to_string(), value.to_string()));
            Ok(())
        })
    }

    fn tensor(&mut self, name: &str) -> CalmResult<Tensor> {
        let mut dtype = None;
        let mut shape = None;
        let mut offsets = None;

        self.object(|parser, key| {
            match key {
                "dtype" => {
                    let value = parser.string()?;
                    let parsed = DType::from_name(value)
                        .ok_or_else(|| CalmError::format(format!("unknown dtype '{value}' of tensor '{name}'")))?;
                    dtype = Some(parsed);
                }
                "shape" => {
                    let (dims, rank) = parser.integers::<MAX_DIMS>()?;
                    let mut parsed = [0usize; MAX_DIMS];
                    for (out, &dim) in parsed.iter_mut().zip(dims.iter()) {
                        *out = usize::try_from(dim)
                            .ok()
                            .filter(|&dim| dim <= MAX_ELEMENTS)
                            .ok_or_else(|| CalmError::format(format!("invalid dimension {dim} of tensor '{name}'")))?;
                    }
                    shape = Some((parsed, rank));
                }
                "data_offsets" => {
                    let (values, count) = parser.integers::<2>()?;
                    if count != 2 {
                        return Err(CalmError::format(format!("tensor '{name}' needs two data offsets")));
                    }
                    offsets = Some((values[0], values[1]));
                }
                other => return Err(CalmError::format(format!("unexpected key '{other}' in tensor '{name}'"))),
            }
            Ok(())
        })?;

        let missing = |field: &str| CalmError::format(format!("tensor '{name}' has no {field}"));
        let dtype = dtype.ok_or_else(|| missing("dtype"))?;
        let (shape, rank) = shape.ok_or_else(|| missing("shape"))?;
        let (begin, end) = offsets.ok_or_else(|| missing("data_offsets"))?;

        if begin < 0 || end <= begin || end as u64 > self.payload_size as u64 {
            return Err(CalmError::format(format!(
                "tensor '{name}' has data offsets [{begin}, {end}) outside of the {} byte payload",
                self.payload_size
            )));
        }
        let (offset, size) = (begin as usize, (end - begin) as usize);

        match expected_size(dtype, &shape) {
            Some(expected) if expected == size => {}
            expected => {
                return Err(CalmError::format(format!(
                    "tensor '{name}' of {} {shape:?} occupies {size} bytes, expected {expected:?}",
                    dtype.name()
                )));
            }
        }

        Ok(Tensor { name: name.to_string(), dtype, shape, rank, offset, size })
    }

    /// Parses a string without escapes, borrowing it from the header.
    fn string(&mut self) -> CalmResult<&'a str> {
        self.expect(b'"')?;
        let start = self.pos;

        loop {
            match self.next() {
                Some(b'"') => break,
                Some(b'\\') => return Err(self.error("escape sequences are not supported")),
                Some(0) => return Err(self.error("NUL byte inside a string")),
                Some(_) => {}
                None => return Err(self.error("unterminated string")),
            }
        }

        let json = self.json;
        std::str::from_utf8(&json[start..self.pos - 1]).map_err(|_| self.error_at(start, "string is not valid UTF-8"))
    }

    /// Parses `[n, ...]` with 1..=N plain decimal integers, returning the values and their count.
    fn integers<const N: usize>(&mut self) -> CalmResult<([i64; N], usize)> {
        let mut values = [0i64; N];
        let mut count = 0;

        self.expect(b'[')?;
        loop {
            self.skip_ws();
            if count == N {
                return Err(self.error(&format!("array has more than {N} elements")));
            }
            values[count] = self.integer()?;
            count += 1;

            self.skip_ws();
            match self.next() {
                Some(b',') => {}
                Some(b']') => return Ok((values, count)),
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn integer(&mut self) -> CalmResult<i64> {
        let negative = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                true
            }
            Some(b'+') => {
                self.pos += 1;
                false
            }
            _ => false,
        };

        let start = self.pos;
        let mut value = 0i64;
        while let Some(digit @ b'0'..=b'9') = self.peek() {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(i64::from(digit - b'0')))
                .ok_or_else(|| self.error("integer overflow"))?;
            self.pos += 1;
        }

        if self.pos == start {
            return Err(self.error("expected an integer"));
        }

        Ok(if negative { -value } else { value })
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.json.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn expect(&mut self, expected: u8) -> CalmResult<()> {
        match self.next() {
            Some(byte) if byte == expected => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", expected as char))),
        }
    }

    fn error(&self, message: &str) -> CalmError {
        self.error_at(self.pos, message)
    }

    fn error_at(&self, pos: usize, message: &str) -> CalmError {
        CalmError::format(format!("header byte {pos}: {message}"))
    }
}
