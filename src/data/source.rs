use std::{fs, io, path::Path};

use safetensors::{Dtype, SafeTensors};

use super::dataset::InMemoryDataset;
use crate::error::Result;

/// Loads an `InMemoryDataset` from a safetensors file holding two tensors:
/// `images` (`F32`, shape `[n, d]`) and `labels` (`U8`, shape `[n]`).
///
/// Image decoding is out of scope; datasets arrive pre-decoded as tensors.
pub fn load_dataset(path: &Path) -> Result<InMemoryDataset> {
    let raw = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&raw).map_err(|e| invalid(path, e.to_string()))?;

    let images = tensors
        .tensor("images")
        .map_err(|e| invalid(path, e.to_string()))?;
    if images.dtype() != Dtype::F32 || images.shape().len() != 2 {
        return Err(invalid(path, "`images` must be F32 with shape [n, d]").into());
    }

    let labels = tensors
        .tensor("labels")
        .map_err(|e| invalid(path, e.to_string()))?;
    if labels.dtype() != Dtype::U8 || labels.shape().len() != 1 {
        return Err(invalid(path, "`labels` must be U8 with shape [n]").into());
    }

    if images.shape()[0] != labels.shape()[0] {
        return Err(invalid(path, "`images` and `labels` disagree on sample count").into());
    }
    if labels.shape()[0] == 0 || images.shape()[1] == 0 {
        return Err(invalid(path, "dataset must hold at least one non-empty sample").into());
    }

    // safetensors buffers are little-endian and possibly unaligned
    let features: Vec<f32> = images
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(InMemoryDataset::new(
        features,
        labels.data().to_vec(),
        images.shape()[1],
    ))
}

fn invalid(path: &Path, msg: impl Into<String>) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {}", path.display(), msg.into()),
    )
}
