use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

use crate::tensors::TensorStore;

/// Prints checkpoint metadata and the tensor table.
pub fn inspect_checkpoint<W: Write>(path: impl AsRef<Path>, out: &mut W) -> Result<()> {
    let path = path.as_ref();
    let store = TensorStore::open(path).with_context(|| format!("Failed to open checkpoint: {}", path.display()))?;

    writeln!(out, "{}", path.display())?;
    writeln!(out, "metadata:")?;
    for (key, value) in store.metadata_entries() {
        writeln!(out, "  {key}: {value}")?;
    }

    writeln!(out, "tensors:")?;
    let mut total = 0usize;
    for tensor in store.tensors() {
        total += tensor.size;
        writeln!(out, "  {}: {} {:?} ({} bytes)", tensor.name, tensor.dtype.name(), tensor.dims(), tensor.size)?;
    }

    writeln!(
        out,
        "{} tensors, {:.2} MiB of {:.2} MiB payload",
        store.tensors().len(),
        total as f64 / (1024.0 * 1024.0),
        store.payload_size() as f64 / (1024.0 * 1024.0)
    )?;

    Ok(())
}
