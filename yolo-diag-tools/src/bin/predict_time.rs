use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use yolo_diag::batch::run_batch;
use yolo_diag::config::{self, BatchConfig, Which};
use yolo_diag::predict::YoloDetector;

/// Runs a YOLOv8 model on every image of a directory and reports inference times.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file, flags given on the command line take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the .png, .jpg, .jpeg and .bmp images to process.
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Directory receiving the annotated images, created when missing.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Model weights, in safetensors format.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Model size (n, s, m, l, x), inferred from the weights when not set.
    #[arg(long)]
    which: Option<Which>,

    /// Length of the longest side of the network input.
    #[arg(long)]
    image_size: Option<usize>,

    /// Threshold for the model confidence level.
    #[arg(long)]
    confidence_threshold: Option<f32>,

    /// Threshold for non-maximum suppression.
    #[arg(long)]
    nms_threshold: Option<f32>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

impl Args {
    fn config(&self) -> Result<BatchConfig> {
        let mut config: BatchConfig = match &self.config {
            Some(path) => config::from_json_file(path)?,
            None => BatchConfig::default(),
        };
        if let Some(dir) = &self.input_dir {
            config.input_dir = dir.clone()
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone()
        }
        if let Some(model) = &self.model {
            config.model = Some(model.clone())
        }
        if let Some(which) = self.which {
            config.which = Some(which)
        }
        if let Some(image_size) = self.image_size {
            config.image_size = image_size
        }
        if let Some(t) = self.confidence_threshold {
            config.confidence_threshold = t
        }
        if let Some(t) = self.nms_threshold {
            config.nms_threshold = t
        }
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
    let detector = YoloDetector::load(&model, &config, &device)?;
    let stdout = std::io::stdout();
    run_batch(
        &detector,
        &config.input_dir,
        &config.output_dir,
        &mut stdout.lock(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(base: &str, json: &str) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!(
            "predict-time-{}-{}-{:?}.json",
            base,
            std::process::id(),
            std::thread::current().id(),
        ));
        std::fs::write(&path, json)?;
        Ok(path)
    }

    #[test]
    fn flags_override_file() -> Result<()> {
        let path = write_config(
            "override",
            r#"{"input_dir": "from-file", "output_dir": "out-file", "image_size": 320, "nms_threshold": 0.6}"#,
        )?;
        let args = Args::try_parse_from([
            "predict-time",
            "--config",
            path.to_str().unwrap(),
            "--output-dir",
            "out-flag",
            "--confidence-threshold",
            "0.5",
            "--cpu",
        ])?;
        let config = args.config()?;
        assert_eq!(config.input_dir, PathBuf::from("from-file"));
        assert_eq!(config.output_dir, PathBuf::from("out-flag"));
        assert_eq!(config.image_size, 320);
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.nms_threshold, 0.6);
        assert!(config.cpu);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn defaults_without_file() -> Result<()> {
        let config = Args::try_parse_from(["predict-time"])?.config()?;
        assert_eq!(config, BatchConfig::default());
        Ok(())
    }

    #[test]
    fn malformed_config() -> Result<()> {
        let path = write_config("malformed", "input_dir = images")?;
        let err = Args::try_parse_from(["predict-time", "--config", path.to_str().unwrap()])?
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
