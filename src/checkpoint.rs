use std::{io, path::PathBuf};

use safetensors::tensor::{Dtype, TensorView};

/// Final-parameter persistence capability.
///
/// Only rank 0 ever calls `persist`; the trait exists so tests can count
/// invocations without touching the filesystem.
pub trait CheckpointSink {
    /// Writes the flat parameter buffer in its entirety.
    ///
    /// # Errors
    /// Any underlying storage error. The session treats a failed persist as
    /// fatal for the whole run.
    fn persist(&mut self, params: &[f32]) -> io::Result<()>;
}

/// Writes parameters to a safetensors file, split into named tensors.
pub struct FileSink {
    path: PathBuf,
    /// `(name, shape)` pairs in flat-buffer order; the element counts must
    /// sum to the parameter count.
    schema: Vec<(String, Vec<usize>)>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, schema: Vec<(String, Vec<usize>)>) -> Self {
        assert!(!schema.is_empty(), "schema must name at least one tensor");
        Self {
            path: path.into(),
            schema,
        }
    }
}

impl CheckpointSink for FileSink {
    fn persist(&mut self, params: &[f32]) -> io::Result<()> {
        let mut tensors = Vec::with_capacity(self.schema.len());
        let mut rest = params;

        for (name, shape) in &self.schema {
            let len: usize = shape.iter().product();
            if rest.len() < len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("parameter buffer too short for tensor {name}"),
                ));
            }
            let (data, tail) = rest.split_at(len);
            rest = tail;

            let view = TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(data))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")))?;
            tensors.push((name.clone(), view));
        }

        if !rest.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} parameters left over after the schema", rest.len()),
            ));
        }

        safetensors::serialize_to_file(tensors, &None, &self.path)
            .map_err(|e| io::Error::other(format!("{e}")))
    }
}
