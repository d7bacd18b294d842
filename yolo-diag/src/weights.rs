//! Loading YOLOv8 weights from safetensors files.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle::safetensors::MmapedSafetensors;
use candle::{DType, Device, Var};
use candle_nn::VarBuilder;

use crate::error::{Error, Result};
use crate::model::{self, Multiples, YoloV8};

/// Memory-maps a safetensors file.
pub fn open<P: AsRef<Path>>(path: P) -> Result<MmapedSafetensors> {
    let path = path.as_ref();
    // SAFETY: the file is expected to stay unmodified while the tools run.
    unsafe { MmapedSafetensors::new(path) }.map_err(|e| Error::load(path, e))
}

/// Tensor shapes keyed by name.
pub fn shapes(st: &MmapedSafetensors) -> HashMap<String, Vec<usize>> {
    st.tensors()
        .into_iter()
        .map(|(name, view)| (name, view.shape().to_vec()))
        .collect()
}

fn resolve_model(
    path: &Path,
    shapes: &HashMap<String, Vec<usize>>,
    multiples: Option<Multiples>,
) -> Result<(Multiples, usize)> {
    let multiples = match multiples {
        Some(m) => m,
        None => Multiples::infer(shapes).map_err(|e| Error::load(path, e))?,
    };
    let num_classes = model::num_classes(shapes).map_err(|e| Error::load(path, e))?;
    tracing::debug!(?multiples, num_classes, "resolved model variant");
    Ok((multiples, num_classes))
}

/// Loads a model for inference, the variant being inferred from the weights unless given.
pub fn load_model<P: AsRef<Path>>(
    path: P,
    multiples: Option<Multiples>,
    device: &Device,
) -> Result<YoloV8> {
    let path = path.as_ref();
    let st = open(path)?;
    let (multiples, num_classes) = resolve_model(path, &shapes(&st), multiples)?;
    // SAFETY: see `open`.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
        .map_err(|e| Error::load(path, e))?;
    let model = YoloV8::load(vb, multiples, num_classes).map_err(|e| Error::load(path, e))?;
    tracing::info!(?path, "model loaded");
    Ok(model)
}

/// Every tensor of a weight file held as a trainable `f32` variable.
///
/// Models built from these weights track gradients for all their parameters.
#[derive(Debug)]
pub struct TrainableWeights {
    path: PathBuf,
    vars: Vec<(String, Var)>,
}

impl TrainableWeights {
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let st = open(path)?;
        let mut vars = Vec::new();
        for (name, _) in st.tensors() {
            let var = st
                .load(&name, device)
                .and_then(|t| t.to_dtype(DType::F32))
                .and_then(|t| Var::from_tensor(&t))
                .map_err(|e| Error::load(path, e))?;
            vars.push((name, var));
        }
        vars.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(Self {
            path: path.to_path_buf(),
            vars,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn vars(&self) -> &[(String, Var)] {
        &self.vars
    }

    pub fn shapes(&self) -> HashMap<String, Vec<usize>> {
        self.vars
            .iter()
            .map(|(name, var)| (name.clone(), var.dims().to_vec()))
            .collect()
    }

    /// Builds the network on top of the variables so gradients flow back to them.
    pub fn build_model(&self, multiples: Option<Multiples>, device: &Device) -> Result<YoloV8> {
        let (multiples, num_classes) = resolve_model(&self.path, &self.shapes(), multiples)?;
        let tensors = self
            .vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let model =
            YoloV8::load(vb, multiples, num_classes).map_err(|e| Error::load(&self.path, e))?;
        tracing::info!(path = ?self.path, vars = self.vars.len(), "trainable model loaded");
        Ok(model)
    }
}
