//! YOLOv8 detection network.
//!
//! Architecture follows the ultralytics layout with the tensor naming used by the candle port:
//! a `net` backbone, an `fpn` neck and a decoupled `head`. Batch-norm layers are absorbed into
//! the preceding convolutions when the weights are loaded.
use std::collections::HashMap;

use candle::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{batch_norm, conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};

use crate::profile::OpCounter;

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Multiples {
    pub depth: f64,
    pub width: f64,
    pub ratio: f64,
}

impl Multiples {
    pub fn n() -> Self {
        Self {
            depth: 0.33,
            width: 0.25,
            ratio: 2.0,
        }
    }
    pub fn s() -> Self {
        Self {
            depth: 0.33,
            width: 0.50,
            ratio: 2.0,
        }
    }
    pub fn m() -> Self {
        Self {
            depth: 0.67,
            width: 0.75,
            ratio: 1.5,
        }
    }
    pub fn l() -> Self {
        Self {
            depth: 1.00,
            width: 1.00,
            ratio: 1.0,
        }
    }
    pub fn x() -> Self {
        Self {
            depth: 1.00,
            width: 1.25,
            ratio: 1.0,
        }
    }

    /// Recovers the model variant from the shapes of a set of weights.
    pub fn infer(shapes: &HashMap<String, Vec<usize>>) -> Result<Self> {
        let out_channels = |name: &str| match shapes.get(name) {
            Some(shape) if !shape.is_empty() => Ok(shape[0]),
            _ => candle::bail!("missing tensor {name}"),
        };
        let width = out_channels("net.b1.0.conv.weight")? as f64 / 64.;
        let ratio = out_channels("net.b4.0.conv.weight")? as f64 / (512. * width);
        let prefix = "net.b2.0.bottleneck.";
        let n_bottlenecks = shapes
            .keys()
            .filter_map(|k| k.strip_prefix(prefix))
            .filter_map(|k| k.split('.').next()?.parse::<usize>().ok())
            .max()
            .map_or(0, |idx| idx + 1);
        let depth = match n_bottlenecks {
            1 => 0.33,
            2 => 0.67,
            3 => 1.00,
            n => candle::bail!("unsupported number of bottlenecks in net.b2.0: {n}"),
        };
        Ok(Self {
            depth,
            width,
            ratio,
        })
    }

    fn filters(&self) -> (usize, usize, usize) {
        let f1 = (256. * self.width) as usize;
        let f2 = (512. * self.width) as usize;
        let f3 = (512. * self.width * self.ratio) as usize;
        (f1, f2, f3)
    }
}

/// Number of classes predicted by the detection head stored in `shapes`.
pub fn num_classes(shapes: &HashMap<String, Vec<usize>>) -> Result<usize> {
    match shapes.get("head.cv3.0.2.weight") {
        Some(shape) if !shape.is_empty() => Ok(shape[0]),
        _ => candle::bail!("missing tensor head.cv3.0.2.weight"),
    }
}

fn record_conv(counter: Option<&OpCounter>, name: &str, conv: &Conv2d, ys: &Tensor) -> Result<()> {
    match counter {
        Some(counter) => counter.record_conv(name, conv, ys),
        None => Ok(()),
    }
}

#[derive(Debug)]
struct Upsample {
    scale_factor: usize,
}

impl Upsample {
    fn new(scale_factor: usize) -> Result<Self> {
        Ok(Upsample { scale_factor })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b_size, _channels, h, w) = xs.dims4()?;
        xs.upsample_nearest2d(self.scale_factor * h, self.scale_factor * w)
    }
}

#[derive(Debug)]
struct ConvBlock {
    conv: Conv2d,
    name: String,
    span: tracing::Span,
}

impl ConvBlock {
    fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        k: usize,
        stride: usize,
        padding: Option<usize>,
    ) -> Result<Self> {
        let padding = padding.unwrap_or(k / 2);
        let cfg = Conv2dConfig {
            padding,
            stride,
            groups: 1,
            dilation: 1,
            ..Default::default()
        };
        let bn = batch_norm(c2, 1e-3, vb.pp("bn"))?;
        let conv = conv2d_no_bias(c1, c2, k, cfg, vb.pp("conv"))?.absorb_bn(&bn)?;
        Ok(Self {
            conv,
            name: vb.prefix(),
            span: tracing::span!(tracing::Level::TRACE, "conv-block"),
        })
    }

    fn forward_with(&self, xs: &Tensor, counter: Option<&OpCounter>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.conv.forward(xs)?;
        record_conv(counter, &self.name, &self.conv, &xs)?;
        candle_nn::ops::silu(&xs)
    }
}

#[derive(Debug)]
struct Bottleneck {
    cv1: ConvBlock,
    cv2: ConvBlock,
    residual: bool,
    span: tracing::Span,
}

impl Bottleneck {
    fn load(vb: VarBuilder, c1: usize, c2: usize, shortcut: bool) -> Result<Self> {
        let channel_factor = 1.;
        let c_ = (c2 as f64 * channel_factor) as usize;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c_, 3, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c_, c2, 3, 1, None)?;
        let residual = c1 == c2 && shortcut;
        Ok(Self {
            cv1,
            cv2,
            residual,
            span: tracing::span!(tracing::Level::TRACE, "bottleneck"),
        })
    }

    fn forward_with(&self, xs: &Tensor, counter: Option<&OpCounter>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let ys = self.cv1.forward_with(xs, counter)?;
        let ys = self.cv2.forward_with(&ys, counter)?;
        if self.residual {
            xs + ys
        } else {
            Ok(ys)
        }
    }
}

#[derive(Debug)]
struct C2f {
    cv1: ConvBlock,
    cv2: ConvBlock,
    bottleneck: Vec<Bottleneck>,
    span: tracing::Span,
}

impl C2f {
    fn load(vb: VarBuilder, c1: usize, c2: usize, n: usize, shortcut: bool) -> Result<Self> {
        let c = (c2 as f64 * 0.5) as usize;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, 2 * c, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), (2 + n) * c, c2, 1, 1, None)?;
        let mut bottleneck = Vec::with_capacity(n);
        for idx in 0..n {
            let b = Bottleneck::load(vb.pp(format!("bottleneck.{idx}")), c, c, shortcut)?;
            bottleneck.push(b)
        }
        Ok(Self {
            cv1,
            cv2,
            bottleneck,
            span: tracing::span!(tracing::Level::TRACE, "c2f"),
        })
    }

    fn forward_with(&self, xs: &Tensor, counter: Option<&OpCounter>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let ys = self.cv1.forward_with(xs, counter)?;
        let mut ys = ys.chunk(2, 1)?;
        for m in self.bottleneck.iter() {
            let last = ys[ys.len() - 1].clone();
            ys.push(m.forward_with(&last, counter)?)
        }
        let zs = Tensor::cat(ys.as_slice(), 1)?;
        self.cv2.forward_with(&zs, counter)
    }
}

#[derive(Debug)]
struct Sppf {
    cv1: ConvBlock,
    cv2: ConvBlock,
    k: usize,
    span: tracing::Span,
}

impl Sppf {
    fn load(vb: VarBuilder, c1: usize, c2: usize, k: usize) -> Result<Self> {
        let c_ = c1 / 2;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c_, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c_ * 4, c2, 1, 1, None)?;
        Ok(Self {
            cv1,
            cv2,
            k,
            span: tracing::span!(tracing::Level::TRACE, "sppf"),
        })
    }

    // Stride-1 max pooling as a separable running maximum, which unlike `max_pool2d` can be
    // backpropagated when the kernel size differs from the stride.
    fn pool(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        let p = self.k / 2;
        let xs = xs.pad_with_zeros(2, p, p)?.pad_with_zeros(3, p, p)?;
        let mut rows = xs.narrow(3, 0, w)?;
        for dx in 1..self.k {
            rows = rows.maximum(&xs.narrow(3, dx, w)?)?;
        }
        let mut ys = rows.narrow(2, 0, h)?;
        for dy in 1..self.k {
            ys = ys.maximum(&rows.narrow(2, dy, h)?)?;
        }
        Ok(ys)
    }

    fn forward_with(&self, xs: &Tensor, counter: Option<&OpCounter>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.cv1.forward_with(xs, counter)?;
        let xs2 = self.pool(&xs)?;
        let xs3 = self.pool(&xs2)?;
        let xs4 = self.pool(&xs3)?;
        self.cv2
            .forward_with(&Tensor::cat(&[&xs, &xs2, &xs3, &xs4], 1)?, counter)
    }
}

#[derive(Debug)]
struct Dfl {
    conv: Conv2d,
    num_classes: usize,
    name: String,
    span: tracing::Span,
}

impl Dfl {
    fn load(vb: VarBuilder, num_classes: usize) -> Result<Self> {
        let conv = conv2d_no_bias(num_classes, 1, 1, Default::default(), vb.pp("conv"))?;
        Ok(Self {
            conv,
            num_classes,
            name: vb.pp("conv").prefix(),
            span: tracing::span!(tracing::Level::TRACE, "dfl"),
        })
    }

    fn forward_with(&self, xs: &Tensor, counter: Option<&OpCounter>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, _channels, anchors) = xs.dims3()?;
        let xs = xs
            .reshape((b_sz, 4, self.num_classes, anchors))?
            .transpose(2, 1)?;
        let xs = candle_nn::ops::softmax(&xs, 1)?;
        let ys = self.conv.forward(&xs)?;
        record_conv(counter, &self.name, &self.conv, &ys)?;
        ys.reshape((b_sz, 4, anchors))
    }
}

#[derive(Debug)]
struct DarkNet {
    b1_0: ConvBlock,
    b1_1: ConvBlock,
    b2_0: C2f,
    b2_1: ConvBlock,
    b2_2: C2f,
    b3_0: ConvBlock,
    b3_1: C2f,
    b4_0: ConvBlock,
    b4_1: C2f,
    b5: Sppf,
    span: tracing::Span,
}

impl DarkNet {
    fn load(vb: VarBuilder, m: Multiples) -> Result<Self> {
        let (w, r, d) = (m.width, m.ratio, m.depth);
        let c = |base: f64| (base * w) as usize;
        let n = |base: f64| (base * d).round() as usize;
        let b1_0 = ConvBlock::load(vb.pp("b1.0"), 3, c(64.), 3, 2, Some(1))?;
        let b1_1 = ConvBlock::load(vb.pp("b1.1"), c(64.), c(128.), 3, 2, Some(1))?;
        let b2_0 = C2f::load(vb.pp("b2.0"), c(128.), c(128.), n(3.), true)?;
        let b2_1 = ConvBlock::load(vb.pp("b2.1"), c(128.), c(256.), 3, 2, Some(1))?;
        let b2_2 = C2f::load(vb.pp("b2.2"), c(256.), c(256.), n(6.), true)?;
        let b3_0 = ConvBlock::load(vb.pp("b3.0"), c(256.), c(512.), 3, 2, Some(1))?;
        let b3_1 = C2f::load(vb.pp("b3.1"), c(512.), c(512.), n(6.), true)?;
        let b4_0 = ConvBlock::load(vb.pp("b4.0"), c(512.), c(512. * r), 3, 2, Some(1))?;
        let b4_1 = C2f::load(vb.pp("b4.1"), c(512. * r), c(512. * r), n(3.), true)?;
        let b5 = Sppf::load(vb.pp("b5.0"), c(512. * r), c(512. * r), 5)?;
        Ok(Self {
            b1_0,
            b1_1,
            b2_0,
            b2_1,
            b2_2,
            b3_0,
            b3_1,
            b4_0,
            b4_1,
            b5,
            span: tracing::span!(tracing::Level::TRACE, "darknet"),
        })
    }

    fn forward_with(
        &self,
        xs: &Tensor,
        counter: Option<&OpCounter>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let _enter = self.span.enter();
        let x1 = self.b1_0.forward_with(xs, counter)?;
        let x1 = self.b1_1.forward_with(&x1, counter)?;
        let x2 = self.b2_0.forward_with(&x1, counter)?;
        let x2 = self.b2_1.forward_with(&x2, counter)?;
        let x2 = self.b2_2.forward_with(&x2, counter)?;
        let x3 = self.b3_0.forward_with(&x2, counter)?;
        let x3 = self.b3_1.forward_with(&x3, counter)?;
        let x4 = self.b4_0.forward_with(&x3, counter)?;
        let x4 = self.b4_1.forward_with(&x4, counter)?;
        let x5 = self.b5.forward_with(&x4, counter)?;
        Ok((x2, x3, x5))
    }
}

#[derive(Debug)]
struct YoloV8Neck {
    up: Upsample,
    n1: C2f,
    n2: C2f,
    n3: ConvBlock,
    n4: C2f,
    n5: ConvBlock,
    n6: C2f,
    span: tracing::Span,
}

impl YoloV8Neck {
    fn load(vb: VarBuilder, m: Multiples) -> Result<Self> {
        let up = Upsample::new(2)?;
        let (w, r, d) = (m.width, m.ratio, m.depth);
        let c = |base: f64| (base * w) as usize;
        let n = (3. * d).round() as usize;
        let n1 = C2f::load(vb.pp("n1"), c(512. * (1. + r)), c(512.), n, false)?;
        let n2 = C2f::load(vb.pp("n2"), c(768.), c(256.), n, false)?;
        let n3 = ConvBlock::load(vb.pp("n3"), c(256.), c(256.), 3, 2, Some(1))?;
        let n4 = C2f::load(vb.pp("n4"), c(768.), c(512.), n, false)?;
        let n5 = ConvBlock::load(vb.pp("n5"), c(512.), c(512.), 3, 2, Some(1))?;
        let n6 = C2f::load(vb.pp("n6"), c(512. * (1. + r)), c(512. * r), n, false)?;
        Ok(Self {
            up,
            n1,
            n2,
            n3,
            n4,
            n5,
            n6,
            span: tracing::span!(tracing::Level::TRACE, "neck"),
        })
    }

    fn forward_with(
        &self,
        p3: &Tensor,
        p4: &Tensor,
        p5: &Tensor,
        counter: Option<&OpCounter>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let _enter = self.span.enter();
        let x = Tensor::cat(&[&self.up.forward(p5)?, p4], 1)?;
        let x = self.n1.forward_with(&x, counter)?;
        let head_1 = Tensor::cat(&[&self.up.forward(&x)?, p3], 1)?;
        let head_1 = self.n2.forward_with(&head_1, counter)?;
        let head_2 = Tensor::cat(&[&self.n3.forward_with(&head_1, counter)?, &x], 1)?;
        let head_2 = self.n4.forward_with(&head_2, counter)?;
        let head_3 = Tensor::cat(&[&self.n5.forward_with(&head_2, counter)?, p5], 1)?;
        let head_3 = self.n6.forward_with(&head_3, counter)?;
        Ok((head_1, head_2, head_3))
    }
}

/// Two conv blocks followed by a plain 1x1 projection, one per detection scale.
#[derive(Debug)]
struct HeadBranch {
    block0: ConvBlock,
    block1: ConvBlock,
    conv: Conv2d,
    name: String,
}

impl HeadBranch {
    fn load(vb: VarBuilder, filter: usize, hidden: usize, out: usize) -> Result<Self> {
        let block0 = ConvBlock::load(vb.pp("0"), filter, hidden, 3, 1, None)?;
        let block1 = ConvBlock::load(vb.pp("1"), hidden, hidden, 3, 1, None)?;
        let conv = conv2d(hidden, out, 1, Default::default(), vb.pp("2"))?;
        Ok(Self {
            block0,
            block1,
            conv,
            name: vb.pp("2").prefix(),
        })
    }

    fn forward_with(&self, xs: &Tensor, counter: Option<&OpCounter>) -> Result<Tensor> {
        let xs = self.block0.forward_with(xs, counter)?;
        let xs = self.block1.forward_with(&xs, counter)?;
        let ys = self.conv.forward(&xs)?;
        record_conv(counter, &self.name, &self.conv, &ys)?;
        Ok(ys)
    }
}

#[derive(Debug)]
struct DetectionHead {
    dfl: Dfl,
    cv2: [HeadBranch; 3],
    cv3: [HeadBranch; 3],
    ch: usize,
    no: usize,
    span: tracing::Span,
}

fn make_anchors(
    xs0: &Tensor,
    xs1: &Tensor,
    xs2: &Tensor,
    (s0, s1, s2): (usize, usize, usize),
    grid_cell_offset: f64,
) -> Result<(Tensor, Tensor)> {
    let dev = xs0.device();
    let mut anchor_points = vec![];
    let mut stride_tensor = vec![];
    for (xs, stride) in [(xs0, s0), (xs1, s1), (xs2, s2)] {
        // xs is only used to extract the h and w dimensions.
        let (_, _, h, w) = xs.dims4()?;
        let sx = (Tensor::arange(0, w as u32, dev)?.to_dtype(DType::F32)? + grid_cell_offset)?;
        let sy = (Tensor::arange(0, h as u32, dev)?.to_dtype(DType::F32)? + grid_cell_offset)?;
        let sx = sx
            .reshape((1, sx.elem_count()))?
            .repeat((h, 1))?
            .flatten_all()?;
        let sy = sy
            .reshape((sy.elem_count(), 1))?
            .repeat((1, w))?
            .flatten_all()?;
        anchor_points.push(Tensor::stack(&[&sx, &sy], D::Minus1)?);
        stride_tensor.push((Tensor::ones(h * w, DType::F32, dev)? * stride as f64)?);
    }
    let anchor_points = Tensor::cat(anchor_points.as_slice(), 0)?;
    let stride_tensor = Tensor::cat(stride_tensor.as_slice(), 0)?.unsqueeze(1)?;
    Ok((anchor_points, stride_tensor))
}

fn dist2bbox(distance: &Tensor, anchor_points: &Tensor) -> Result<Tensor> {
    let chunks = distance.chunk(2, 1)?;
    let lt = &chunks[0];
    let rb = &chunks[1];
    let x1y1 = anchor_points.sub(lt)?;
    let x2y2 = anchor_points.add(rb)?;
    let c_xy = ((&x1y1 + &x2y2)? * 0.5)?;
    let wh = (&x2y2 - &x1y1)?;
    Tensor::cat(&[c_xy, wh], 1)
}

impl DetectionHead {
    fn load(vb: VarBuilder, nc: usize, filters: (usize, usize, usize)) -> Result<Self> {
        let ch = 16;
        let dfl = Dfl::load(vb.pp("dfl"), ch)?;
        let c1 = usize::max(filters.0, nc);
        let c2 = usize::max(filters.0 / 4, ch * 4);
        let cv3 = [
            HeadBranch::load(vb.pp("cv3.0"), filters.0, c1, nc)?,
            HeadBranch::load(vb.pp("cv3.1"), filters.1, c1, nc)?,
            HeadBranch::load(vb.pp("cv3.2"), filters.2, c1, nc)?,
        ];
        let cv2 = [
            HeadBranch::load(vb.pp("cv2.0"), filters.0, c2, 4 * ch)?,
            HeadBranch::load(vb.pp("cv2.1"), filters.1, c2, 4 * ch)?,
            HeadBranch::load(vb.pp("cv2.2"), filters.2, c2, 4 * ch)?,
        ];
        let no = nc + ch * 4;
        Ok(Self {
            dfl,
            cv2,
            cv3,
            ch,
            no,
            span: tracing::span!(tracing::Level::TRACE, "detection-head"),
        })
    }

    fn forward_with(
        &self,
        xs0: &Tensor,
        xs1: &Tensor,
        xs2: &Tensor,
        counter: Option<&OpCounter>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let forward_cv = |xs: &Tensor, i: usize| {
            let xs_2 = self.cv2[i].forward_with(xs, counter)?;
            let xs_3 = self.cv3[i].forward_with(xs, counter)?;
            Tensor::cat(&[&xs_2, &xs_3], 1)
        };
        let xs0 = forward_cv(xs0, 0)?;
        let xs1 = forward_cv(xs1, 1)?;
        let xs2 = forward_cv(xs2, 2)?;

        let (anchors, strides) = make_anchors(&xs0, &xs1, &xs2, (8, 16, 32), 0.5)?;
        let anchors = anchors.transpose(0, 1)?.unsqueeze(0)?;
        let strides = strides.transpose(0, 1)?;

        let reshape = |xs: &Tensor| {
            let d = xs.dim(0)?;
            let el = xs.elem_count();
            xs.reshape((d, self.no, el / (d * self.no)))
        };
        let ys0 = reshape(&xs0)?;
        let ys1 = reshape(&xs1)?;
        let ys2 = reshape(&xs2)?;

        let x_cat = Tensor::cat(&[ys0, ys1, ys2], 2)?;
        let box_ = x_cat.i((.., ..self.ch * 4))?;
        let cls = x_cat.i((.., self.ch * 4..))?;

        let dbox = dist2bbox(&self.dfl.forward_with(&box_, counter)?, &anchors)?;
        let dbox = dbox.broadcast_mul(&strides)?;
        Tensor::cat(&[dbox, candle_nn::ops::sigmoid(&cls)?], 1)
    }
}

#[derive(Debug)]
pub struct YoloV8 {
    net: DarkNet,
    fpn: YoloV8Neck,
    head: DetectionHead,
    num_classes: usize,
    span: tracing::Span,
}

impl YoloV8 {
    pub fn load(vb: VarBuilder, m: Multiples, num_classes: usize) -> Result<Self> {
        let net = DarkNet::load(vb.pp("net"), m)?;
        let fpn = YoloV8Neck::load(vb.pp("fpn"), m)?;
        let head = DetectionHead::load(vb.pp("head"), num_classes, m.filters())?;
        Ok(Self {
            net,
            fpn,
            head,
            num_classes,
            span: tracing::span!(tracing::Level::TRACE, "yolo-v8"),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Channels expected by the stem convolution.
    pub fn in_channels(&self) -> Result<usize> {
        self.net.b1_0.conv.weight().dim(1)
    }

    /// Runs the network, reporting the cost of every convolution to `counter` when provided.
    ///
    /// The output has shape `(batch, 4 + num_classes, anchors)`: box centers and sizes in input
    /// pixels followed by per-class scores.
    pub fn forward_with(&self, xs: &Tensor, counter: Option<&OpCounter>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (xs1, xs2, xs3) = self.net.forward_with(xs, counter)?;
        let (xs1, xs2, xs3) = self.fpn.forward_with(&xs1, &xs2, &xs3, counter)?;
        self.head.forward_with(&xs1, &xs2, &xs3, counter)
    }
}

impl Module for YoloV8 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_with(xs, None)
    }
}
