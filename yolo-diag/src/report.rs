//! The layer-statistics report: parameters, gradients and FLOPs of a trainable model.
use std::io::Write;

use candle::Device;

use crate::config::LayerStatsConfig;
use crate::error::Result;
use crate::inspect::{self, GradientStatus, LayerStats, ModuleTree};
use crate::profile::{self, ProfileSummary};
use crate::weights::TrainableWeights;

#[derive(Debug, Clone)]
pub struct LayerReport {
    pub stats: LayerStats,
    pub gradients: Vec<GradientStatus>,
    pub profile: ProfileSummary,
}

/// Builds the model from `weights`, writes every section of the report to `out` and returns
/// the collected figures.
pub fn layer_report<W: Write>(
    weights: &TrainableWeights,
    config: &LayerStatsConfig,
    device: &Device,
    out: &mut W,
) -> Result<LayerReport> {
    let model = weights.build_model(config.which.map(|w| w.multiples()), device)?;
    writeln!(out, "Model loaded successfully: {}", weights.path().display())?;

    let grads = if config.backward {
        profile::check_input_shape(&model, config.input_shape)?;
        Some(inspect::synthetic_gradients(
            &model,
            config.input_shape,
            device,
        )?)
    } else {
        None
    };
    let vars = weights.vars().iter().map(|(name, var)| (name.as_str(), var));
    let tree = ModuleTree::from_vars(vars, grads.as_ref(), config.scope);

    let stats = inspect::layer_stats(tree.nodes());
    inspect::write_layer_stats(out, &stats)?;

    let gradients = inspect::gradient_status(tree.nodes())?;
    inspect::write_gradient_status(out, &gradients)?;

    inspect::write_header(out, "GFLOPs Calculation")?;
    let profile = profile::profile(&model, config.input_shape, device)?;
    profile.write(out, config.per_layer)?;
    inspect::write_rule(out)?;

    writeln!(
        out,
        "\nSummary: Total Params {:.2} M, GFLOPs {:.2} G",
        stats.total as f64 / 1e6,
        profile.gflops()
    )?;
    writeln!(out, "Analysis completed!")?;
    Ok(LayerReport {
        stats,
        gradients,
        profile,
    })
}
