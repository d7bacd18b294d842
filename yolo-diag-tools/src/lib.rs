use std::path::{Path, PathBuf};

use candle::{Device, Result};
use yolo_diag::Which;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        Ok(Device::Cpu)
    }
}

/// Installs the tracing subscriber.
///
/// With `chrome` set, spans are recorded to a `trace-*.json` file that can be opened in
/// `chrome://tracing`; the returned guard flushes it on drop. Otherwise events are logged to
/// stderr, filtered through `RUST_LOG`.
pub fn init_tracing(chrome: bool) -> Option<tracing_chrome::FlushGuard> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    if chrome {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
        None
    }
}

/// The weights to use: `model` when given, otherwise the matching checkpoint from the hub.
pub fn model_path(model: Option<&Path>, which: Option<Which>) -> anyhow::Result<PathBuf> {
    let path = match model {
        Some(model) => model.to_path_buf(),
        None => {
            let which = which.unwrap_or(Which::S);
            let api = hf_hub::api::sync::Api::new()?;
            let api = api.model("lmz/candle-yolo-v8".to_string());
            let path = api.get(&format!("yolov8{}.safetensors", which.size()))?;
            tracing::info!(?path, "retrieved weights from the hub");
            path
        }
    };
    Ok(path)
}
