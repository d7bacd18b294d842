//! Sequential batch inference over a directory of images.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageReader};

use crate::error::{Error, Result};
use crate::predict::Detector;

pub const IMAGE_EXTENSIONS: [&str; 4] = [".png", ".jpg", ".jpeg", ".bmp"];

pub fn is_image_name(name: &str) -> bool {
    let name = name.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Files of `dir` with an image extension, sorted by name.
pub fn list_images<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut images = vec![];
    for entry in std::fs::read_dir(dir).map_err(|e| Error::filesystem(dir, e))? {
        let entry = entry.map_err(|e| Error::filesystem(dir, e))?;
        if is_image_name(&entry.file_name().to_string_lossy()) {
            images.push(entry.path())
        }
    }
    images.sort();
    Ok(images)
}

pub fn decode_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();
    let decode_err = |source| Error::Decode {
        path: path.to_path_buf(),
        source,
    };
    ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| decode_err(image::ImageError::IoError(e)))?
        .decode()
        .map_err(decode_err)
}

/// Running sum of durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    pub total: Duration,
    pub count: usize,
}

impl Timings {
    pub fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.count += 1;
    }

    /// Zero when nothing was recorded.
    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageTiming {
    pub name: String,
    pub elapsed: Duration,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub images: Vec<ImageTiming>,
    pub timings: Timings,
}

/// Runs `detector` on every image of `input_dir`, one at a time.
///
/// Each measured duration covers decoding and detection. The annotated image is written to
/// `output_dir` under the source file name. The first failure aborts the run, leaving the
/// images already written in place.
pub fn run_batch<D: Detector, W: Write>(
    detector: &D,
    input_dir: &Path,
    output_dir: &Path,
    out: &mut W,
) -> Result<BatchSummary> {
    std::fs::create_dir_all(output_dir).map_err(|e| Error::filesystem(output_dir, e))?;
    let images = list_images(input_dir)?;
    tracing::info!(count = images.len(), ?input_dir, "found images");

    let mut summary = BatchSummary::default();
    for path in images.iter() {
        let file_name = path.file_name().unwrap_or_default();
        let name = file_name.to_string_lossy().into_owned();
        let start = Instant::now();
        let image = decode_image(path)?;
        let detection = detector.detect(image)?;
        let elapsed = start.elapsed();
        summary.timings.record(elapsed);

        let destination = output_dir.join(file_name);
        detection
            .annotate()
            .save(&destination)
            .map_err(|e| match e {
                image::ImageError::IoError(e) => Error::filesystem(&destination, e),
                e => Error::filesystem(&destination, std::io::Error::other(e)),
            })?;
        tracing::debug!(boxes = detection.num_boxes(), ?destination, "saved");
        writeln!(
            out,
            "ready: {name}, time: {:.4} s, to: {}",
            elapsed.as_secs_f64(),
            destination.display()
        )?;
        summary.images.push(ImageTiming {
            name,
            elapsed,
            destination,
        });
    }
    writeln!(
        out,
        "\nCompleted {} pictures, average inference time: {:.4} s",
        summary.timings.count,
        summary.timings.average().as_secs_f64()
    )?;
    Ok(summary)
}
