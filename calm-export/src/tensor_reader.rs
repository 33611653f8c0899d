#[cfg(test)]
#[path = "../tests/unit/tensor_reader_test.rs"]
mod tensor_reader_test;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};
use log::{debug, info};
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors};
use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Files kept mapped at once.
const MAX_CACHED_FILES: usize = 10;

/// A source tensor converted to f32.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Reads tensors from the safetensors shards of a model directory.
#[derive(Debug)]
pub struct TensorReader {
    files: Vec<PathBuf>,
    /// Tensor name to index into `files`.
    index: HashMap<String, usize>,
    mmap_cache: Mutex<MmapCache>,
}

impl TensorReader {
    pub fn new(model_path: &Path) -> Result<Self> {
        let mut files = std::fs::read_dir(model_path)
            .with_context(|| format!("Failed to read directory: {}", model_path.display()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == "safetensors").then_some(path)
            })
            .collect::<Vec<_>>();
        files.sort();

        if files.is_empty() {
            anyhow::bail!("No SafeTensors files found in {}", model_path.display());
        }

        let reader = Self { files, index: HashMap::new(), mmap_cache: Mutex::new(MmapCache::new(MAX_CACHED_FILES)) };

        let mut index = HashMap::new();
        for (file_idx, path) in reader.files.iter().enumerate() {
            let mmap = reader.mmap(path)?;
            let (_, metadata) = SafeTensors::read_metadata(&mmap)
                .with_context(|| format!("Failed to read safetensors header of {}", path.display()))?;
            for name in metadata.tensors().into_keys() {
                index.insert(name, file_idx);
            }
        }

        info!("Found {} tensors in {} safetensors files", index.len(), reader.files.len());
        Ok(Self { index, ..reader })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Loads a tensor by name, converting F32/F16/BF16 data to f32.
    pub fn load_tensor(&self, name: &str) -> Result<Option<SourceTensor>> {
        let Some(&file_idx) = self.index.get(name) else {
            return Ok(None);
        };

        let path = &self.files[file_idx];
        let mmap = self.mmap(path)?;
        let safetensors =
            SafeTensors::deserialize(&mmap).with_context(|| format!("Failed to deserialize {}", path.display()))?;
        let view = safetensors.tensor(name).with_context(|| format!("Failed to read tensor {name}"))?;

        let data = convert_to_f32(view.dtype(), view.data()).with_context(|| format!("Cannot convert tensor {name}"))?;
        debug!("Loaded {name} {:?} from {}", view.shape(), path.display());

        Ok(Some(SourceTensor { shape: view.shape().to_vec(), data }))
    }

    /// Drops every cached mapping.
    pub fn clear_cache(&self) -> Result<()> {
        self.mmap_cache.lock().map_err(|_| anyhow::anyhow!("Failed to acquire cache lock"))?.clear();
        Ok(())
    }

    fn mmap(&self, path: &Path) -> Result<Arc<Mmap>> {
        let mut cache = self.mmap_cache.lock().map_err(|_| anyhow::anyhow!("Failed to acquire cache lock"))?;

        if let Some(mmap) = cache.get(path) {
            return Ok(mmap);
        }

        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

        // SAFETY: shards are only read; a shard modified by another process during export is
        // undefined behavior we cannot rule out.
        let mmap =
            Arc::new(unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to memory map {}", path.display()))?);

        cache.insert(path.to_path_buf(), Arc::clone(&mmap));
        Ok(mmap)
    }
}

fn convert_to_f32(dtype: Dtype, data: &[u8]) -> Result<Vec<f32>> {
    match dtype {
        Dtype::F32 => {
            let mut values = vec![0.0; data.len() / 4];
            LittleEndian::read_f32_into(data, &mut values);
            Ok(values)
        }
        Dtype::F16 => Ok(data.chunks_exact(2).map(|h| f16::from_bits(LittleEndian::read_u16(h)).to_f32()).collect()),
        Dtype::BF16 => Ok(data.chunks_exact(2).map(|h| bf16::from_bits(LittleEndian::read_u16(h)).to_f32()).collect()),
        other => anyhow::bail!("Unsupported tensor dtype {other:?}"),
    }
}

/// LRU cache of file mappings.
#[derive(Debug)]
struct MmapCache {
    cache: HashMap<PathBuf, Arc<Mmap>>,
    access_order: VecDeque<PathBuf>,
    max_size: usize,
}

impl MmapCache {
    fn new(max_size: usize) -> Self {
        Self { cache: HashMap::new(), access_order: VecDeque::new(), max_size }
    }

    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.access_order.iter().position(|p| p == path) {
            self.access_order.remove(pos);
        }
        self.access_order.push_front(path.to_path_buf());
    }

    fn get(&mut self, path: &Path) -> Option<Arc<Mmap>> {
        let mmap = self.cache.get(path).cloned()?;
        self.touch(path);
        Some(mmap)
    }

    fn insert(&mut self, path: PathBuf, mmap: Arc<Mmap>) {
        if !self.cache.contains_key(&path) {
            while self.cache.len() >= self.max_size {
                let Some(lru) = self.access_order.pop_back() else { break };
                self.cache.remove(&lru);
            }
        }

        self.touch(&path);
        self.cache.insert(path, mmap);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cache.len()
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.access_order.clear();
    }
}
