//! Record to tensor transforms.

use crate::{common::*, record::Record};
use image::imageops::{self, FilterType};

/// Target scale: the shorter side is resized to `short` unless the longer
/// side would exceed `long`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleSpec {
    pub short: usize,
    pub long: usize,
}

impl ScaleSpec {
    pub fn check(&self) -> Fallible<()> {
        ensure!(
            self.short > 0 && self.long >= self.short,
            "invalid scale (short={}, long={})",
            self.short,
            self.long
        );
        Ok(())
    }

    /// Compute the resized `(height, width)` and the scaling factor of an
    /// image of size `(height, width)`.
    pub fn resize(&self, height: usize, width: usize) -> (usize, usize, f32) {
        let min_side = height.min(width) as f32;
        let max_side = height.max(width) as f32;
        let scale = (self.short as f32 / min_side).min(self.long as f32 / max_side);
        let new_h = (height as f32 * scale).round() as usize;
        let new_w = (width as f32 * scale).round() as usize;
        (new_h, new_w, scale)
    }
}

/// Output of a transform on one record.
#[derive(Debug, Clone)]
pub struct Transformed {
    /// Image tensor in `[c, h, w]` layout.
    pub data: Array3<f32>,
    /// `(height, width, scale)` of the network input.
    pub im_info: [f32; 3],
}

pub trait Transform
where
    Self: Debug + Send + Sync,
{
    /// The number of channels and the largest spatial size produced.
    fn data_shape(&self) -> [usize; 3];

    fn apply(&self, record: &Record) -> Fallible<Transformed>;
}

/// Computes `im_info` only, leaving the image undecoded.
///
/// Suits backends that do not consume pixels, such as proposal replay.
#[derive(Debug, Clone)]
pub struct MetaOnly {
    scale: ScaleSpec,
}

impl MetaOnly {
    pub fn new(scale: ScaleSpec) -> Fallible<Self> {
        scale.check()?;
        Ok(Self { scale })
    }
}

impl Transform for MetaOnly {
    fn data_shape(&self) -> [usize; 3] {
        [3, 0, 0]
    }

    fn apply(&self, record: &Record) -> Fallible<Transformed> {
        let scale = record.scale.unwrap_or(self.scale);
        ensure!(
            record.height > 0 && record.width > 0,
            "image size must be positive"
        );
        let (new_h, new_w, factor) = scale.resize(record.height, record.width);

        Ok(Transformed {
            data: Array3::zeros((3, 0, 0)),
            im_info: [new_h as f32, new_w as f32, factor],
        })
    }
}

/// Decodes the image, resizes it and normalizes each channel.
#[derive(Debug, Clone)]
pub struct Resize {
    scale: ScaleSpec,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Resize {
    pub fn new(scale: ScaleSpec, mean: [R64; 3], std: [R64; 3]) -> Fallible<Self> {
        scale.check()?;
        ensure!(
            std.iter().all(|&value| value > 0.0),
            "std values must be positive"
        );

        Ok(Self {
            scale,
            mean: mean.map(|value| value.raw() as f32),
            std: std.map(|value| value.raw() as f32),
        })
    }
}

impl Transform for Resize {
    fn data_shape(&self) -> [usize; 3] {
        [3, self.scale.long, self.scale.long]
    }

    fn apply(&self, record: &Record) -> Fallible<Transformed> {
        let scale = record.scale.unwrap_or(self.scale);
        let image = image::open(&record.image)
            .with_context(|| format!("failed to open image '{}'", record.image.display()))?
            .to_rgb8();
        let (height, width) = (image.height() as usize, image.width() as usize);
        ensure!(
            height == record.height && width == record.width,
            "image '{}' has size {}x{}, but the record says {}x{}",
            record.image.display(),
            height,
            width,
            record.height,
            record.width
        );

        let (new_h, new_w, factor) = scale.resize(height, width);
        let resized = imageops::resize(&image, new_w as u32, new_h as u32, FilterType::Triangle);
        let resized = if record.flipped {
            imageops::flip_horizontal(&resized)
        } else {
            resized
        };

        let mut data = Array3::zeros((3, new_h, new_w));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                let value = pixel.0[channel] as f32;
                data[[channel, y as usize, x as usize]] =
                    (value - self.mean[channel]) / self.std[channel];
            }
        }

        Ok(Transformed {
            data,
            im_info: [new_h as f32, new_w as f32, factor],
        })
    }
}
