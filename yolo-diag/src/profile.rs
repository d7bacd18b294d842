//! FLOPs and parameter accounting for a single forward pass.
//!
//! Counts follow the usual profiler convention: only convolutions contribute, each output
//! element costing one multiply-accumulate per kernel tap plus one for the bias. Pooling,
//! upsampling, concatenation and activations are free.
use std::cell::RefCell;
use std::io::Write;

use candle::{Device, Tensor};
use candle_nn::Conv2d;

use crate::error::{Error, Result};
use crate::model::YoloV8;

/// Cost of one counted layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerCost {
    pub name: String,
    pub flops: u64,
    pub params: u64,
}

/// Collects layer costs while a model runs.
#[derive(Debug, Default)]
pub struct OpCounter {
    layers: RefCell<Vec<LayerCost>>,
}

impl OpCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a convolution given the tensor it produced.
    pub fn record_conv(&self, name: &str, conv: &Conv2d, ys: &Tensor) -> candle::Result<()> {
        let (_c_out, c_in_per_group, kh, kw) = conv.weight().dims4()?;
        let bias = conv.bias().map_or(0, |b| b.elem_count());
        let per_output = c_in_per_group * kh * kw + usize::from(bias > 0);
        self.layers.borrow_mut().push(LayerCost {
            name: name.to_string(),
            flops: (ys.elem_count() * per_output) as u64,
            params: (conv.weight().elem_count() + bias) as u64,
        });
        Ok(())
    }

    pub fn into_layers(self) -> Vec<LayerCost> {
        self.layers.into_inner()
    }
}

#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub input_shape: (usize, usize, usize),
    pub flops: u64,
    pub params: u64,
    pub layers: Vec<LayerCost>,
}

impl ProfileSummary {
    pub fn from_layers(input_shape: (usize, usize, usize), layers: Vec<LayerCost>) -> Self {
        let flops = layers.iter().map(|l| l.flops).sum();
        let params = layers.iter().map(|l| l.params).sum();
        Self {
            input_shape,
            flops,
            params,
            layers,
        }
    }

    pub fn gflops(&self) -> f64 {
        self.flops as f64 / 1e9
    }

    pub fn write<W: Write>(&self, w: &mut W, per_layer: bool) -> std::io::Result<()> {
        let (c, h, width) = self.input_shape;
        if per_layer {
            for (idx, layer) in self.layers.iter().enumerate() {
                writeln!(
                    w,
                    "Op {idx:3} | {:<40} | FLOPs: {:>10} | Params: {:>10}",
                    layer.name,
                    clever_format(layer.flops as f64, 2),
                    clever_format(layer.params as f64, 2),
                )?;
            }
        }
        writeln!(w, "Input Shape: ({c}, {h}, {width})")?;
        writeln!(
            w,
            "Total FLOPs: {} ({:.2} GFLOPs)",
            clever_format(self.flops as f64, 2),
            self.gflops()
        )?;
        writeln!(w, "Params (profiled): {}", clever_format(self.params as f64, 2))
    }
}

/// Formats a count with a metric suffix, e.g. `8.70G` or `512.00B`.
pub fn clever_format(value: f64, precision: usize) -> String {
    let (scaled, suffix) = if value > 1e12 {
        (value / 1e12, "T")
    } else if value > 1e9 {
        (value / 1e9, "G")
    } else if value > 1e6 {
        (value / 1e6, "M")
    } else if value > 1e3 {
        (value / 1e3, "K")
    } else {
        (value, "B")
    };
    format!("{scaled:.precision$}{suffix}")
}

/// Runs one counted forward pass on a standard-normal input of shape `(1, c, h, w)`.
/// Checks that a `(c, h, w)` input can go through `model`: `c` matches the stem conv and both
/// sides are positive multiples of 32.
pub fn check_input_shape(model: &YoloV8, (c, h, w): (usize, usize, usize)) -> Result<()> {
    let expected = model.in_channels().map_err(Error::Profiling)?;
    if c != expected {
        return Err(Error::Profiling(candle::Error::Msg(format!(
            "input has {c} channels, the model expects {expected}"
        ))));
    }
    if h == 0 || w == 0 || h % 32 != 0 || w % 32 != 0 {
        return Err(Error::Profiling(candle::Error::Msg(format!(
            "input size {h}x{w} is not a positive multiple of 32"
        ))));
    }
    Ok(())
}

pub fn profile(
    model: &YoloV8,
    input_shape: (usize, usize, usize),
    device: &Device,
) -> Result<ProfileSummary> {
    check_input_shape(model, input_shape)?;
    let (c, h, w) = input_shape;
    let counter = OpCounter::new();
    let xs = Tensor::randn(0f32, 1., (1, c, h, w), device).map_err(Error::Profiling)?;
    model
        .forward_with(&xs, Some(&counter))
        .map_err(Error::Profiling)?;
    let summary = ProfileSummary::from_layers(input_shape, counter.into_layers());
    tracing::debug!(
        layers = summary.layers.len(),
        flops = summary.flops,
        params = summary.params,
        "profiled forward pass"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clever_format_suffixes() {
        assert_eq!(clever_format(8.7e9, 2), "8.70G");
        assert_eq!(clever_format(3_157_200., 2), "3.16M");
        assert_eq!(clever_format(1500., 2), "1.50K");
        assert_eq!(clever_format(999., 2), "999.00B");
        assert_eq!(clever_format(2.5e12, 3), "2.500T");
        // Thresholds are strict.
        assert_eq!(clever_format(1e6, 2), "1000.00K");
    }

    #[test]
    fn summary_totals() {
        let layers = vec![
            LayerCost {
                name: "a".to_string(),
                flops: 1_500_000_000,
                params: 10,
            },
            LayerCost {
                name: "b".to_string(),
                flops: 2_000_000_000,
                params: 5,
            },
        ];
        let summary = ProfileSummary::from_layers((3, 640, 640), layers);
        assert_eq!(summary.flops, 3_500_000_000);
        assert_eq!(summary.params, 15);
        assert_eq!(format!("{:.2}", summary.gflops()), "3.50");

        let mut out = Vec::new();
        summary.write(&mut out, false).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(
            out,
            "Input Shape: (3, 640, 640)\nTotal FLOPs: 3.50G (3.50 GFLOPs)\nParams (profiled): 15.00B\n"
        );
    }
}
