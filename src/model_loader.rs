// Loads safetensors checkpoints into f32 ndarray tensors.

use crate::model::ModelError;
use half::{bf16, f16};
use log::{debug, info};
use memmap2::Mmap;
use ndarray::{Array1, Array2, ArrayD, Ix1, Ix2, IxDyn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::{SafeTensorError, SafeTensors};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("no weight files to load")]
    NoWeights,
    #[error("failed to read weights file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid safetensors file {}: {source}", path.display())]
    SafeTensors {
        path: PathBuf,
        #[source]
        source: SafeTensorError,
    },
    #[error("tensor '{name}' has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },
    #[error("tensor '{name}' data does not match its shape: {source}")]
    Shape {
        name: String,
        #[source]
        source: ndarray::ShapeError,
    },
    #[error("tensor '{0}' appears in more than one shard")]
    DuplicateTensor(String),
}

/// Named tensors read from a checkpoint, consumed as the model is built.
#[derive(Debug, Default)]
pub struct WeightMap {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    fn take_with_shape(&mut self, name: &str, expected: &[usize]) -> Result<ArrayD<f32>, ModelError> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))?;
        if tensor.shape() != expected {
            return Err(ModelError::WeightShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }
        Ok(tensor)
    }

    pub fn take_matrix(&mut self, name: &str, expected: [usize; 2]) -> Result<Array2<f32>, ModelError> {
        Ok(self.take_with_shape(name, &expected)?.into_dimensionality::<Ix2>()?)
    }

    pub fn take_vector(&mut self, name: &str, len: usize) -> Result<Array1<f32>, ModelError> {
        Ok(self.take_with_shape(name, &[len])?.into_dimensionality::<Ix1>()?)
    }

    pub fn take_optional_vector(&mut self, name: &str, len: usize) -> Result<Option<Array1<f32>>, ModelError> {
        if self.contains(name) {
            self.take_vector(name, len).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Converts a tensor's little-endian payload to f32.
pub fn decode_tensor(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>, LoaderError> {
    let bytes = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(bytemuck::pod_collect_to_vec::<u8, f32>(bytes)),
        Dtype::F16 => Ok(bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()),
        Dtype::BF16 => Ok(bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()),
        other => Err(LoaderError::UnsupportedDtype {
            name: name.to_string(),
            dtype: format!("{:?}", other),
        }),
    }
}

fn load_file(path: &Path, weights: &mut WeightMap) -> Result<(), LoaderError> {
    let io_err = |source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    // SAFETY: the map is read-only and dropped before this function returns.
    let mmap = unsafe { Mmap::map(&file) }.map_err(io_err)?;
    let tensors = SafeTensors::deserialize(&mmap).map_err(|source| LoaderError::SafeTensors {
        path: path.to_path_buf(),
        source,
    })?;

    for (name, view) in tensors.tensors() {
        let data = decode_tensor(&name, &view)?;
        let array = ArrayD::from_shape_vec(IxDyn(view.shape()), data).map_err(|source| LoaderError::Shape {
            name: name.clone(),
            source,
        })?;
        debug!("Loaded tensor {} {:?} ({:?})", name, view.shape(), view.dtype());
        if weights.insert(name.clone(), array).is_some() {
            return Err(LoaderError::DuplicateTensor(name));
        }
    }
    Ok(())
}

/// Loads every tensor from one or more safetensors shards.
pub fn load_safetensors(paths: &[PathBuf]) -> Result<WeightMap, LoaderError> {
    if paths.is_empty() {
        return Err(LoaderError::NoWeights);
    }
    let mut weights = WeightMap::new();
    for (i, path) in paths.iter().enumerate() {
        info!("Loading weights shard {}/{}: {}", i + 1, paths.len(), path.display());
        load_file(path, &mut weights)?;
    }
    info!("Loaded {} tensors", weights.len());
    Ok(weights)
}

/// Total on-disk size of the given files, used as a lower bound on memory needs.
pub fn checkpoint_size(paths: &[PathBuf]) -> u64 {
    paths
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}
