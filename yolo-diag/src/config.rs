//! Run configuration for the diagnostic tools.
//!
//! Both configurations can be read from a JSON file, missing fields taking their default
//! value. They are built once when a tool starts and never modified afterwards.
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::inspect::ParamScope;
use crate::model::Multiples;

/// YOLOv8 model size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Which {
    N,
    S,
    M,
    L,
    X,
}

impl Which {
    pub fn multiples(&self) -> Multiples {
        match self {
            Self::N => Multiples::n(),
            Self::S => Multiples::s(),
            Self::M => Multiples::m(),
            Self::L => Multiples::l(),
            Self::X => Multiples::x(),
        }
    }

    pub fn size(&self) -> &'static str {
        match self {
            Self::N => "n",
            Self::S => "s",
            Self::M => "m",
            Self::L => "l",
            Self::X => "x",
        }
    }
}

impl FromStr for Which {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "n" => Ok(Self::N),
            "s" => Ok(Self::S),
            "m" => Ok(Self::M),
            "l" => Ok(Self::L),
            "x" => Ok(Self::X),
            _ => Err(format!("unknown model size {s}, expected one of n, s, m, l, x")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerStatsConfig {
    /// Model weights, in safetensors format.
    pub model: Option<PathBuf>,
    /// Model size, inferred from the weights when unset.
    pub which: Option<Which>,
    /// Shape `(channels, height, width)` of the synthetic profiling input.
    pub input_shape: (usize, usize, usize),
    pub scope: ParamScope,
    /// Backpropagate through one synthetic forward pass before checking gradients.
    pub backward: bool,
    /// Print the cost of every profiled layer.
    pub per_layer: bool,
    pub cpu: bool,
}

impl Default for LayerStatsConfig {
    fn default() -> Self {
        Self {
            model: None,
            which: None,
            input_shape: (3, 640, 640),
            scope: ParamScope::Direct,
            backward: false,
            per_layer: false,
            cpu: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub input_dir: PathBuf,
    /// Created when missing, existing files with the same name are overwritten.
    pub output_dir: PathBuf,
    pub model: Option<PathBuf>,
    pub which: Option<Which>,
    /// Length of the longest side of the network input.
    pub image_size: usize,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub cpu: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("images"),
            output_dir: PathBuf::from("results"),
            model: None,
            which: None,
            image_size: 640,
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            cpu: false,
        }
    }
}

pub fn from_json_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|e| Error::filesystem(path, e))?;
    serde_json::from_str(&data).map_err(|e| Error::Config {
        path: path.to_path_buf(),
        msg: e.to_string(),
    })
}
