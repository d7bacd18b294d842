use std::path::Path;

use candle::{DType, Device, Module, Tensor};
use candle_transformers::object_detection::{non_maximum_suppression, Bbox};
use image::{DynamicImage, ImageBuffer};

use crate::config::BatchConfig;
use crate::error::Result;
use crate::model::YoloV8;
use crate::weights;

/// Something that turns an image into per-class bounding boxes.
pub trait Detector {
    fn detect(&self, image: DynamicImage) -> Result<Detection>;
}

/// Detection result, boxes are expressed in the source image pixels and grouped by class.
#[derive(Debug, Clone)]
pub struct Detection {
    pub image: DynamicImage,
    pub bboxes: Vec<Vec<Bbox<()>>>,
}

impl Detection {
    pub fn num_boxes(&self) -> usize {
        self.bboxes.iter().map(|b| b.len()).sum()
    }

    /// The source image with every box drawn on top of it.
    pub fn annotate(&self) -> DynamicImage {
        let mut img = self.image.to_rgb8();
        let (w, h) = (img.width(), img.height());
        if w == 0 || h == 0 {
            return DynamicImage::ImageRgb8(img);
        }
        for b in self.bboxes.iter().flatten() {
            let xmin = (b.xmin.max(0.) as u32).clamp(0, w - 1);
            let ymin = (b.ymin.max(0.) as u32).clamp(0, h - 1);
            let xmax = (b.xmax.max(0.) as u32).clamp(0, w - 1);
            let ymax = (b.ymax.max(0.) as u32).clamp(0, h - 1);
            draw_rect(&mut img, xmin, xmax, ymin, ymax);
        }
        DynamicImage::ImageRgb8(img)
    }
}

// Assumes x1 <= x2 and y1 <= y2
pub fn draw_rect(
    img: &mut ImageBuffer<image::Rgb<u8>, Vec<u8>>,
    x1: u32,
    x2: u32,
    y1: u32,
    y2: u32,
) {
    for x in x1..=x2 {
        let pixel = img.get_pixel_mut(x, y1);
        *pixel = image::Rgb([255, 0, 0]);
        let pixel = img.get_pixel_mut(x, y2);
        *pixel = image::Rgb([255, 0, 0]);
    }
    for y in y1..=y2 {
        let pixel = img.get_pixel_mut(x1, y);
        *pixel = image::Rgb([255, 0, 0]);
        let pixel = img.get_pixel_mut(x2, y);
        *pixel = image::Rgb([255, 0, 0]);
    }
}

/// Network input size for an image: the longest side becomes `image_size`, both sides are
/// rounded down to a multiple of 32.
pub fn input_size(width: usize, height: usize, image_size: usize) -> (usize, usize) {
    let round = |v: usize| (v / 32 * 32).max(32);
    if width < height {
        let w = width * image_size / height;
        (round(w), round(image_size))
    } else {
        let h = height * image_size / width.max(1);
        (round(image_size), round(h))
    }
}

/// Extracts the boxes above `confidence_threshold` from a `(4 + num_classes, anchors)`
/// prediction and applies per-class non-maximum suppression.
pub fn extract_bboxes(
    pred: &Tensor,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> candle::Result<Vec<Vec<Bbox<()>>>> {
    let (pred_size, _npreds) = pred.dims2()?;
    if pred_size <= 4 {
        candle::bail!("prediction has no class scores, got {pred_size} rows")
    }
    let nclasses = pred_size - 4;
    let mut bboxes: Vec<Vec<Bbox<()>>> = (0..nclasses).map(|_| vec![]).collect();
    let rows = pred.t()?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    for pred in rows.iter() {
        let (class_index, confidence) = pred[4..]
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, c)| {
                if c > best.1 {
                    (i, c)
                } else {
                    best
                }
            });
        if confidence > confidence_threshold {
            bboxes[class_index].push(Bbox {
                xmin: pred[0] - pred[2] / 2.,
                ymin: pred[1] - pred[3] / 2.,
                xmax: pred[0] + pred[2] / 2.,
                ymax: pred[1] + pred[3] / 2.,
                confidence,
                data: (),
            })
        }
    }
    non_maximum_suppression(&mut bboxes, nms_threshold);
    Ok(bboxes)
}

pub struct YoloDetector {
    model: YoloV8,
    device: Device,
    image_size: usize,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl YoloDetector {
    pub fn new(model: YoloV8, device: Device, config: &BatchConfig) -> Self {
        Self {
            model,
            device,
            image_size: config.image_size,
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P, config: &BatchConfig, device: &Device) -> Result<Self> {
        let multiples = config.which.map(|w| w.multiples());
        let model = weights::load_model(path, multiples, device)?;
        Ok(Self::new(model, device.clone(), config))
    }

    fn preprocess(&self, image: &DynamicImage, width: usize, height: usize) -> Result<Tensor> {
        let img = image.resize_exact(
            width as u32,
            height as u32,
            image::imageops::FilterType::CatmullRom,
        );
        let data = img.to_rgb8().into_raw();
        let image_t = Tensor::from_vec(data, (height, width, 3), &self.device)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .to_dtype(DType::F32)?;
        Ok((image_t * (1. / 255.))?)
    }
}

impl Detector for YoloDetector {
    fn detect(&self, image: DynamicImage) -> Result<Detection> {
        let (initial_w, initial_h) = (image.width() as usize, image.height() as usize);
        let (width, height) = input_size(initial_w, initial_h, self.image_size);
        let image_t = self.preprocess(&image, width, height)?;
        let pred = self.model.forward(&image_t)?.squeeze(0)?;
        let mut bboxes = extract_bboxes(&pred, self.confidence_threshold, self.nms_threshold)?;
        let w_ratio = initial_w as f32 / width as f32;
        let h_ratio = initial_h as f32 / height as f32;
        for b in bboxes.iter_mut().flatten() {
            b.xmin *= w_ratio;
            b.xmax *= w_ratio;
            b.ymin *= h_ratio;
            b.ymax *= h_ratio;
        }
        tracing::debug!(boxes = bboxes.iter().map(|b| b.len()).sum::<usize>(), "detected");
        Ok(Detection { image, bboxes })
    }
}
