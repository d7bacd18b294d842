use std::collections::HashMap;

use anyhow::Result;
use candle::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use yolo_diag::model::{num_classes, Multiples, YoloV8};
use yolo_diag::profile::profile;
use yolo_diag::Error;

fn random_model(m: Multiples, nc: usize) -> Result<(VarMap, YoloV8)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = YoloV8::load(vb, m, nc)?;
    Ok((varmap, model))
}

fn shapes(varmap: &VarMap) -> HashMap<String, Vec<usize>> {
    varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.dims().to_vec()))
        .collect()
}

#[test]
fn forward_shape() -> Result<()> {
    let (_varmap, model) = random_model(Multiples::n(), 3)?;
    let xs = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu)?;
    let ys = model.forward(&xs)?;
    // 8x8 + 4x4 + 2x2 anchors, 4 box coordinates and 3 class scores each.
    assert_eq!(ys.dims(), &[1, 7, 84]);
    assert_eq!(model.num_classes(), 3);
    assert_eq!(model.in_channels()?, 3);
    Ok(())
}

#[test]
fn infer_variant_from_shapes() -> Result<()> {
    for (m, nc) in [(Multiples::n(), 80), (Multiples::m(), 5)] {
        let (varmap, _model) = random_model(m, nc)?;
        let shapes = shapes(&varmap);
        assert_eq!(Multiples::infer(&shapes)?, m);
        assert_eq!(num_classes(&shapes)?, nc);
    }
    assert!(Multiples::infer(&HashMap::new()).is_err());
    Ok(())
}

#[test]
fn profile_scales_with_input_area() -> Result<()> {
    let (_varmap, model) = random_model(Multiples::n(), 2)?;
    let small = profile(&model, (3, 64, 64), &Device::Cpu)?;
    let large = profile(&model, (3, 128, 128), &Device::Cpu)?;
    assert!(small.flops > 0);
    assert_eq!(large.flops, 4 * small.flops);
    assert_eq!(large.params, small.params);
    assert_eq!(small.layers.len(), large.layers.len());
    assert_eq!(small.flops, small.layers.iter().map(|l| l.flops).sum::<u64>());
    assert!(small.layers.iter().any(|l| l.name == "net.b1.0"));
    assert!(small.layers.iter().any(|l| l.name == "head.dfl.conv"));
    Ok(())
}

#[test]
fn profile_stem_cost() -> Result<()> {
    let (_varmap, model) = random_model(Multiples::n(), 2)?;
    let summary = profile(&model, (3, 64, 64), &Device::Cpu)?;
    let stem = summary
        .layers
        .iter()
        .find(|l| l.name == "net.b1.0")
        .unwrap();
    // 16 output channels at 32x32, 3x3x3 taps plus the absorbed batch-norm bias.
    assert_eq!(stem.flops, 16 * 32 * 32 * (27 + 1));
    assert_eq!(stem.params, 16 * 27 + 16);
    Ok(())
}

#[test]
fn profile_rejects_bad_inputs() -> Result<()> {
    let (_varmap, model) = random_model(Multiples::n(), 2)?;
    for shape in [(3, 65, 64), (1, 64, 64), (3, 0, 64)] {
        match profile(&model, shape, &Device::Cpu) {
            Err(Error::Profiling(_)) => {}
            other => panic!("unexpected result for {shape:?}: {other:?}"),
        }
    }
    Ok(())
}
