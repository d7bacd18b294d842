use std::cell::Cell;
use std::path::{Path, PathBuf};

use anyhow::Result;
use candle::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::object_detection::Bbox;
use image::{DynamicImage, Rgb, RgbImage};
use yolo_diag::batch::{list_images, run_batch};
use yolo_diag::model::{Multiples, YoloV8};
use yolo_diag::predict::{Detection, Detector, YoloDetector};
use yolo_diag::{BatchConfig, Error};

fn temp_dir(base: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "yolo-diag-{}-{}-{:?}",
        base,
        std::process::id(),
        std::thread::current().id(),
    ));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn write_image(path: &Path, w: u32, h: u32) -> Result<()> {
    RgbImage::from_pixel(w, h, Rgb([10, 20, 30])).save(path)?;
    Ok(())
}

fn file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = std::fs::read_dir(dir)?
        .map(|e| Ok(e?.file_name().to_string_lossy().into_owned()))
        .collect::<Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}

/// Reports a single box around the top-left quarter of every image.
#[derive(Default)]
struct QuarterDetector {
    calls: Cell<usize>,
}

impl Detector for QuarterDetector {
    fn detect(&self, image: DynamicImage) -> yolo_diag::Result<Detection> {
        self.calls.set(self.calls.get() + 1);
        let bbox = Bbox {
            xmin: 0.,
            ymin: 0.,
            xmax: image.width() as f32 / 2.,
            ymax: image.height() as f32 / 2.,
            confidence: 0.9,
            data: (),
        };
        Ok(Detection {
            image,
            bboxes: vec![vec![bbox]],
        })
    }
}

#[test]
fn empty_folder() -> Result<()> {
    let input = temp_dir("empty-in")?;
    let output = temp_dir("empty-out")?.join("nested");
    let detector = QuarterDetector::default();
    let mut out = Vec::new();
    let summary = run_batch(&detector, &input, &output, &mut out)?;
    let out = String::from_utf8(out)?;
    assert_eq!(
        out,
        "\nCompleted 0 pictures, average inference time: 0.0000 s\n"
    );
    assert_eq!(summary.timings.count, 0);
    assert_eq!(detector.calls.get(), 0);
    assert!(output.is_dir());
    assert!(file_names(&output)?.is_empty());
    Ok(())
}

#[test]
fn skips_other_extensions() -> Result<()> {
    let input = temp_dir("filter-in")?;
    let output = temp_dir("filter-out")?;
    write_image(&input.join("cat.PNG"), 16, 12)?;
    std::fs::write(input.join("notes.txt"), "not an image")?;

    let detector = QuarterDetector::default();
    let mut out = Vec::new();
    let summary = run_batch(&detector, &input, &output, &mut out)?;
    let out = String::from_utf8(out)?;

    assert_eq!(detector.calls.get(), 1);
    assert_eq!(file_names(&output)?, ["cat.PNG"]);
    assert_eq!(summary.images.len(), 1);
    assert_eq!(summary.timings.average(), summary.images[0].elapsed);
    assert_eq!(summary.images[0].destination, output.join("cat.PNG"));
    assert!(out.starts_with("ready: cat.PNG, time: "));
    assert!(out.contains("Completed 1 pictures"));

    let annotated = image::open(output.join("cat.PNG"))?.to_rgb8();
    assert_eq!(annotated.dimensions(), (16, 12));
    assert_eq!(annotated.get_pixel(0, 0), &Rgb([255, 0, 0]));
    assert_eq!(annotated.get_pixel(12, 10), &Rgb([10, 20, 30]));
    Ok(())
}

#[test]
fn rerun_overwrites() -> Result<()> {
    let input = temp_dir("rerun-in")?;
    let output = temp_dir("rerun-out")?;
    write_image(&input.join("a.bmp"), 8, 8)?;
    write_image(&input.join("b.jpg"), 8, 8)?;
    let detector = QuarterDetector::default();
    run_batch(&detector, &input, &output, &mut Vec::new())?;
    let summary = run_batch(&detector, &input, &output, &mut Vec::new())?;
    assert_eq!(summary.timings.count, 2);
    assert_eq!(detector.calls.get(), 4);
    assert_eq!(file_names(&output)?, ["a.bmp", "b.jpg"]);
    Ok(())
}

#[test]
fn corrupt_image_aborts() -> Result<()> {
    let input = temp_dir("corrupt-in")?;
    let output = temp_dir("corrupt-out")?;
    write_image(&input.join("a.png"), 8, 8)?;
    std::fs::write(input.join("b.jpg"), b"definitely not a jpeg")?;
    write_image(&input.join("c.png"), 8, 8)?;

    let detector = QuarterDetector::default();
    let result = run_batch(&detector, &input, &output, &mut Vec::new());
    match result {
        Err(Error::Decode { path, .. }) => assert_eq!(path, input.join("b.jpg")),
        other => panic!("unexpected result {other:?}"),
    }
    // Images processed before the failure stay on disk.
    assert_eq!(file_names(&output)?, ["a.png"]);
    assert_eq!(detector.calls.get(), 1);
    Ok(())
}

#[test]
fn missing_input_dir() -> Result<()> {
    let root = temp_dir("missing")?;
    let missing = root.join("nope");
    assert!(matches!(list_images(&missing), Err(Error::Filesystem { .. })));
    let result = run_batch(
        &QuarterDetector::default(),
        &missing,
        &root.join("out"),
        &mut Vec::new(),
    );
    assert!(matches!(result, Err(Error::Filesystem { .. })));
    Ok(())
}

#[test]
fn yolo_detector_end_to_end() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = YoloV8::load(vb, Multiples::n(), 2)?;
    let config = BatchConfig {
        image_size: 64,
        ..Default::default()
    };
    let detector = YoloDetector::new(model, Device::Cpu, &config);

    let input = temp_dir("yolo-in")?;
    let output = temp_dir("yolo-out")?;
    write_image(&input.join("street.png"), 80, 60)?;
    let summary = run_batch(&detector, &input, &output, &mut Vec::new())?;
    assert_eq!(summary.timings.count, 1);
    let annotated = image::open(output.join("street.png"))?;
    assert_eq!((annotated.width(), annotated.height()), (80, 60));
    Ok(())
}

#[cfg(unix)]
#[test]
fn non_utf8_names_are_kept() -> Result<()> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let input = temp_dir("non-utf8-in")?;
    let output = temp_dir("non-utf8-out")?;
    let name = OsStr::from_bytes(b"caf\xe9.png");
    write_image(&input.join(name), 8, 8)?;
    let detector = QuarterDetector::default();
    let summary = run_batch(&detector, &input, &output, &mut Vec::new())?;
    assert_eq!(summary.images.len(), 1);
    assert_eq!(summary.images[0].destination, output.join(name));
    assert!(output.join(name).is_file());
    std::fs::remove_dir_all(&input)?;
    std::fs::remove_dir_all(&output)?;
    Ok(())
}
