use memmap2::Mmap;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use crate::error::CalmResult;

/// Backing bytes of a checkpoint: either a read-only file mapping or an owned buffer.
#[derive(Debug)]
pub(crate) enum Storage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Storage {
    pub fn map(path: &Path) -> CalmResult<Self> {
        let file = File::open(path)?;

        // SAFETY: the mapping is read-only and the checkpoint is not expected to be modified
        // while the model is loaded; any such modification is outside of our control.
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };

        Ok(Self::Mapped(mmap))
    }
}

impl Deref for Storage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Storage::Mapped(mmap) => mmap,
            Storage::Owned(bytes) => bytes,
        }
    }
}

impl From<Vec<u8>> for Storage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes)
    }
}
