//! Checkpoint I/O using the safetensors format
//!
//! Every variable of a `VarStore` is written under its var-store name, and the
//! training position (epoch, validation accuracy) goes into the safetensors
//! header metadata. Loading is strict: a checkpoint must provide every
//! variable of the model with the same shape.

use safetensors::serialize_to_file;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tch::{nn, Kind, Tensor};

use crate::{ExperimentError, Result};

const EPOCH_KEY: &str = "epoch";
const VALID_ACCURACY_KEY: &str = "valid_accuracy";

/// Training position stored alongside the weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub valid_accuracy: f64,
}

impl CheckpointMeta {
    fn to_header(self) -> HashMap<String, String> {
        HashMap::from([
            (EPOCH_KEY.to_string(), self.epoch.to_string()),
            (VALID_ACCURACY_KEY.to_string(), self.valid_accuracy.to_string()),
        ])
    }

    fn from_header(header: Option<&HashMap<String, String>>) -> Result<Self> {
        let field = |key: &str| {
            header
                .and_then(|h| h.get(key))
                .ok_or_else(|| ExperimentError::Checkpoint(format!("missing '{}' in header", key)))
        };
        let epoch = field(EPOCH_KEY)?
            .parse()
            .map_err(|e| ExperimentError::Checkpoint(format!("bad epoch: {}", e)))?;
        let valid_accuracy = field(VALID_ACCURACY_KEY)?
            .parse()
            .map_err(|e| ExperimentError::Checkpoint(format!("bad valid_accuracy: {}", e)))?;
        Ok(Self {
            epoch,
            valid_accuracy,
        })
    }
}

/// Save every variable of `vs` to a safetensors file
pub fn save_checkpoint(
    vs: &nn::VarStore,
    path: impl AsRef<Path>,
    meta: CheckpointMeta,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut encoded: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::new();
    for (name, tensor) in vs.variables() {
        let shape: Vec<usize> = tensor.size().iter().map(|&x| x as usize).collect();
        let (dtype, bytes) = tensor_to_bytes(&tensor)?;
        encoded.push((name, dtype, shape, bytes));
    }

    let views = encoded
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(*dtype, shape.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|e| ExperimentError::Checkpoint(format!("{}: {}", name, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    serialize_to_file(views, &Some(meta.to_header()), path)
        .map_err(|e| ExperimentError::Checkpoint(format!("{}: {}", path.display(), e)))?;

    log::debug!("Saved {} tensors to {}", encoded.len(), path.display());
    Ok(())
}

/// Load a checkpoint into `vs` and return its training position
pub fn load_checkpoint(vs: &mut nn::VarStore, path: impl AsRef<Path>) -> Result<CheckpointMeta> {
    let path = path.as_ref();
    let buffer = fs::read(path)?;

    let (_, header) = SafeTensors::read_metadata(&buffer)
        .map_err(|e| ExperimentError::Checkpoint(format!("{}: {}", path.display(), e)))?;
    let meta = CheckpointMeta::from_header(header.metadata().as_ref())?;

    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| ExperimentError::Checkpoint(format!("{}: {}", path.display(), e)))?;

    for (name, mut var) in vs.variables() {
        let view = tensors.tensor(&name).map_err(|_| {
            ExperimentError::Checkpoint(format!(
                "tensor '{}' not found in {}",
                name,
                path.display()
            ))
        })?;
        let loaded = tensor_view_to_tensor(&view)?;
        if loaded.size() != var.size() {
            return Err(ExperimentError::Checkpoint(format!(
                "tensor '{}' has shape {:?} in checkpoint, model expects {:?}",
                name,
                loaded.size(),
                var.size()
            )));
        }

        tch::no_grad(|| {
            var.copy_(&loaded);
        });
    }

    log::info!(
        "Loaded checkpoint {} (epoch {}, valid accuracy {:.2}%)",
        path.display(),
        meta.epoch,
        meta.valid_accuracy * 100.0
    );
    Ok(meta)
}

fn tensor_to_bytes(tensor: &Tensor) -> Result<(Dtype, Vec<u8>)> {
    let tensor = tensor.to_device(tch::Device::Cpu).flatten(0, -1).contiguous();

    match tensor.kind() {
        Kind::Double => {
            let data = Vec::<f64>::try_from(&tensor)?;
            Ok((Dtype::F64, data.iter().flat_map(|x| x.to_le_bytes()).collect()))
        }
        Kind::Float | Kind::Half | Kind::BFloat16 => {
            // reduced precision is widened, copy_ narrows it back on load
            let data = Vec::<f32>::try_from(&tensor.to_kind(Kind::Float))?;
            Ok((Dtype::F32, data.iter().flat_map(|x| x.to_le_bytes()).collect()))
        }
        kind => Err(ExperimentError::Checkpoint(format!(
            "unsupported tensor kind: {:?}",
            kind
        ))),
    }
}

fn tensor_view_to_tensor(view: &TensorView) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
    let data = view.data();

    match view.dtype() {
        Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            Ok(Tensor::from_slice(&floats).reshape(&shape))
        }
        Dtype::F64 => {
            let doubles: Vec<f64> = data
                .chunks_exact(8)
                .map(|chunk| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    f64::from_le_bytes(bytes)
                })
                .collect();
            Ok(Tensor::from_slice(&doubles).reshape(&shape))
        }
        dtype => Err(ExperimentError::Checkpoint(format!("unsupported dtype: {:?}", dtype))),
    }
}
