use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use yolo_diag::config::{self, LayerStatsConfig, Which};
use yolo_diag::inspect::ParamScope;
use yolo_diag::report::layer_report;
use yolo_diag::weights::TrainableWeights;

fn parse_shape(s: &str) -> std::result::Result<(usize, usize, usize), String> {
    let dims = s
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid shape {s}: {e}"))?;
    match dims.as_slice() {
        &[c, h, w] => Ok((c, h, w)),
        _ => Err(format!("expected channels,height,width, got {s}")),
    }
}

/// Per-layer parameter counts, gradient status and FLOPs of a YOLOv8 model.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file, flags given on the command line take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model weights, in safetensors format.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Model size (n, s, m, l, x), inferred from the weights when not set.
    #[arg(long)]
    which: Option<Which>,

    /// Shape of the synthetic profiling input, as channels,height,width.
    #[arg(long, value_parser = parse_shape)]
    input_shape: Option<(usize, usize, usize)>,

    /// Count the parameters of nested modules in their parents too.
    #[arg(long)]
    recursive: bool,

    /// Backpropagate through one synthetic forward pass before checking gradients.
    #[arg(long)]
    backward: bool,

    /// Print the cost of every profiled layer.
    #[arg(long)]
    per_layer: bool,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

impl Args {
    fn config(&self) -> Result<LayerStatsConfig> {
        let mut config: LayerStatsConfig = match &self.config {
            Some(path) => config::from_json_file(path)?,
            None => LayerStatsConfig::default(),
        };
        if let Some(model) = &self.model {
            config.model = Some(model.clone())
        }
        if let Some(which) = self.which {
            config.which = Some(which)
        }
        if let Some(shape) = self.input_shape {
            config.input_shape = shape
        }
        if self.recursive {
            config.scope = ParamScope::Recursive
        }
        config.backward |= self.backward;
        config.per_layer |= self.per_layer;
        config.cpu |= self.cpu;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = yolo_diag_tools::init_tracing(args.tracing);
    let config = args.config()?;
    let device = yolo_diag_tools::device(config.cpu)?;
    let model = yolo_diag_tools::model_path(config.model.as_deref(), config.which)?;
    let weights = TrainableWeights::load(&model, &device)?;
    let stdout = std::io::stdout();
    layer_report(&weights, &config, &device, &mut stdout.lock())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(base: &str, json: &str) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!(
            "layer-stats-{}-{}-{:?}.json",
            base,
            std::process::id(),
            std::thread::current().id(),
        ));
        std::fs::write(&path, json)?;
        Ok(path)
    }

    #[test]
    fn shapes() {
        assert_eq!(parse_shape("3,640,640"), Ok((3, 640, 640)));
        assert_eq!(parse_shape("1, 320, 256"), Ok((1, 320, 256)));
        assert!(parse_shape("3,640").is_err());
        assert!(parse_shape("a,b,c").is_err());
        assert!(parse_shape("3,640,640,1").is_err());
    }

    #[test]
    fn flags_override_file() -> Result<()> {
        let path = write_config(
            "override",
            r#"{"model": "file.safetensors", "which": "m", "input_shape": [3, 320, 320], "per_layer": true}"#,
        )?;
        let args = Args::try_parse_from([
            "layer-stats",
            "--config",
            path.to_str().unwrap(),
            "--which",
            "n",
            "--input-shape",
            "3,64,96",
            "--recursive",
        ])?;
        let config = args.config()?;
        assert_eq!(config.model, Some(PathBuf::from("file.safetensors")));
        assert_eq!(config.which, Some(Which::N));
        assert_eq!(config.input_shape, (3, 64, 96));
        assert_eq!(config.scope, ParamScope::Recursive);
        assert!(config.per_layer);
        assert!(!config.backward);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn defaults_without_file() -> Result<()> {
        let config = Args::try_parse_from(["layer-stats"])?.config()?;
        assert_eq!(config, LayerStatsConfig::default());
        assert!(Args::try_parse_from(["layer-stats", "--input-shape", "3,640"]).is_err());
        Ok(())
    }

    #[test]
    fn malformed_config() -> Result<()> {
        let path = write_config("malformed", "{\"input_shape\": [3, 640")?;
        let err = Args::try_parse_from(["layer-stats", "--config", path.to_str().unwrap()])?
            .config()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<yolo_diag::Error>(),
            Some(yolo_diag::Error::Config { .. })
        ));
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
