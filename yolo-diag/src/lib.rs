//! Diagnostics for YOLOv8 object detectors: per-module parameter and gradient statistics,
//! FLOPs profiling, and timed batch inference over a directory of images.
pub mod batch;
pub mod config;
mod error;
pub mod inspect;
pub mod model;
pub mod predict;
pub mod profile;
pub mod report;
pub mod weights;

pub use config::{BatchConfig, LayerStatsConfig, Which};
pub use error::{Error, Result};
