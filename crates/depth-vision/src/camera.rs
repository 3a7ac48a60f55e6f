use anyhow::{Context, Result};
use image::{ImageBuffer, Luma, RgbImage};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{config_err, VisionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFormat {
    #[default]
    Bgr8,
    Rgb8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthFormat {
    /// 16-bit raw units, 0 = no return
    #[default]
    Z16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub color_format: ColorFormat,
    #[serde(default)]
    pub depth_format: DepthFormat,
    /// Meters per raw depth unit.
    #[serde(default = "default_depth_scale")]
    pub depth_scale: f32,
}

fn default_depth_scale() -> f32 {
    0.001
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.width == 0 || self.height == 0 {
            return Err(config_err(format!("stream resolution {}x{} is empty", self.width, self.height)));
        }
        if self.fps == 0 {
            return Err(config_err("stream fps must be > 0"));
        }
        if !(self.depth_scale.is_finite() && self.depth_scale > 0.0) {
            return Err(config_err(format!("depth_scale must be a positive number, got {}", self.depth_scale)));
        }
        Ok(())
    }
}

/// Color image as delivered by the sensor; bytes follow `format`.
#[derive(Debug, Clone)]
pub struct ColorFrame {
    pub image: RgbImage,
    pub format: ColorFormat,
}

/// Per-pixel distance lookup.
pub trait DepthQuery {
    /// (width, height)
    fn dimensions(&self) -> (u32, u32);
    /// Meters at (x, y), `None` when the sensor has no valid return there.
    fn distance(&self, x: u32, y: u32) -> Option<f32>;
}

#[derive(Debug, Clone)]
pub struct DepthFrame {
    width: u32,
    height: u32,
    data: Vec<u16>,
    scale: f32,
}

impl DepthFrame {
    pub fn new(width: u32, height: u32, data: Vec<u16>, scale: f32) -> Result<Self> {
        anyhow::ensure!(
            data.len() == width as usize * height as usize,
            "depth buffer holds {} values, expected {}x{}",
            data.len(), width, height
        );
        Ok(Self { width, height, data, scale })
    }

    pub fn from_fn(width: u32, height: u32, scale: f32, f: impl Fn(u32, u32) -> u16) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data, scale }
    }

    pub fn raw(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height { return None; }
        self.data.get(y as usize * self.width as usize + x as usize).copied()
    }
}

impl DepthQuery for DepthFrame {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn distance(&self, x: u32, y: u32) -> Option<f32> {
        match self.raw(x, y)? {
            0 => None,
            v => Some(v as f32 * self.scale),
        }
    }
}

/// One synchronized capture. `depth` is `None` when the depth stream had nothing.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub color: ColorFrame,
    pub depth: Option<DepthFrame>,
}

/// RGB-D sensor boundary.
pub trait CameraSource {
    fn start(&mut self, cfg: &StreamConfig) -> Result<()>;
    /// Blocks until the next pair arrives. `Ok(None)` means the stream has ended.
    fn wait_for_frames(&mut self) -> Result<Option<FramePair>>;
    fn stop(&mut self);
}

/// A started stream. Stops the camera when dropped.
pub struct CameraStream<'a, C: CameraSource + ?Sized> {
    cam: &'a mut C,
}

impl<'a, C: CameraSource + ?Sized> CameraStream<'a, C> {
    pub fn start(cam: &'a mut C, cfg: &StreamConfig) -> Result<Self, VisionError> {
        cfg.validate()?;
        cam.start(cfg).map_err(|e| VisionError::ResourceAcquisition(format!("{e:#}")))?;
        info!("camera: streaming {}x{} @ {} fps", cfg.width, cfg.height, cfg.fps);
        Ok(Self { cam })
    }

    pub fn next_pair(&mut self) -> Result<Option<FramePair>> {
        self.cam.wait_for_frames()
    }
}

impl<C: CameraSource + ?Sized> Drop for CameraStream<'_, C> {
    fn drop(&mut self) {
        self.cam.stop();
        info!("camera: stream stopped");
    }
}

/// Replays `color_<id>.{png,jpg}` / `depth_<id>.png` pairs from a directory, in name order.
///
/// Depth files are 16-bit grayscale in raw sensor units. A color file without a
/// depth partner is delivered with no depth.
pub struct ReplayCamera {
    dir: PathBuf,
    frames: Vec<(PathBuf, Option<PathBuf>)>,
    cursor: usize,
    cfg: Option<StreamConfig>,
}

impl ReplayCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), frames: Vec::new(), cursor: 0, cfg: None }
    }

    fn scan(dir: &Path) -> Result<Vec<(PathBuf, Option<PathBuf>)>> {
        let mut colors = Vec::new();
        for ent in std::fs::read_dir(dir).with_context(|| format!("read replay dir {}", dir.display()))? {
            let path = ent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let is_image = matches!(
                path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
                Some("png" | "jpg" | "jpeg")
            );
            if is_image && name.starts_with("color_") {
                colors.push(path);
            }
        }
        colors.sort();

        Ok(colors
            .into_iter()
            .map(|c| {
                let stem = c.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                let id = stem.trim_start_matches("color_");
                let d = dir.join(format!("depth_{id}.png"));
                let depth = d.is_file().then_some(d);
                (c, depth)
            })
            .collect())
    }

    fn load_color(path: &Path, cfg: &StreamConfig) -> Result<ColorFrame> {
        let mut image = image::open(path).with_context(|| format!("decode {}", path.display()))?.to_rgb8();
        anyhow::ensure!(
            image.dimensions() == (cfg.width, cfg.height),
            "{} is {}x{}, stream is configured for {}x{}",
            path.display(), image.width(), image.height(), cfg.width, cfg.height
        );
        if cfg.color_format == ColorFormat::Bgr8 {
            for px in image.pixels_mut() {
                px.0.swap(0, 2);
            }
        }
        Ok(ColorFrame { image, format: cfg.color_format })
    }

    fn load_depth(path: &Path, cfg: &StreamConfig) -> Result<DepthFrame> {
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            image::open(path).with_context(|| format!("decode {}", path.display()))?.to_luma16();
        let (w, h) = img.dimensions();
        DepthFrame::new(w, h, img.into_raw(), cfg.depth_scale)
    }
}

impl CameraSource for ReplayCamera {
    fn start(&mut self, cfg: &StreamConfig) -> Result<()> {
        anyhow::ensure!(self.dir.is_dir(), "replay dir {} does not exist", self.dir.display());
        self.frames = Self::scan(&self.dir)?;
        anyhow::ensure!(!self.frames.is_empty(), "no color_* frames in {}", self.dir.display());
        self.cursor = 0;
        self.cfg = Some(cfg.clone());
        info!("camera: replaying {} frames from {}", self.frames.len(), self.dir.display());
        Ok(())
    }

    fn wait_for_frames(&mut self) -> Result<Option<FramePair>> {
        let cfg = self.cfg.as_ref().context("replay camera not started")?;
        let Some((color_path, depth_path)) = self.frames.get(self.cursor) else { return Ok(None) };
        self.cursor += 1;

        let color = Self::load_color(color_path, cfg)?;
        let depth = match depth_path {
            Some(p) => Some(Self::load_depth(p, cfg)?),
            None => {
                debug!("camera: no depth for {}", color_path.display());
                None
            }
        };
        Ok(Some(FramePair { color, depth }))
    }

    fn stop(&mut self) {
        self.cfg = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn stream(w: u32, h: u32) -> StreamConfig {
        StreamConfig {
            width: w,
            height: h,
            fps: 30,
            color_format: ColorFormat::Rgb8,
            depth_format: DepthFormat::Z16,
            depth_scale: 0.001,
        }
    }

    #[test]
    fn depth_query_marks_no_return() {
        let d = DepthFrame::from_fn(4, 3, 0.001, |x, _| if x == 0 { 0 } else { 1500 });
        assert_eq!(d.dimensions(), (4, 3));
        assert_eq!(d.distance(0, 1), None);
        assert!((d.distance(2, 1).unwrap() - 1.5).abs() < 1e-6);
        assert_eq!(d.distance(4, 0), None);
        assert!(DepthFrame::new(4, 3, vec![0; 5], 0.001).is_err());
    }

    #[test]
    fn stream_validation() {
        assert!(stream(1280, 720).validate().is_ok());
        assert!(stream(0, 720).validate().is_err());
        assert!(StreamConfig { fps: 0, ..stream(1280, 720) }.validate().is_err());
        assert!(StreamConfig { depth_scale: f32::NAN, ..stream(1280, 720) }.validate().is_err());
    }

    #[test]
    fn replay_pairs_and_gaps() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["0001", "0002"] {
            RgbImage::from_pixel(8, 6, Rgb([200, 10, 10]))
                .save(dir.path().join(format!("color_{id}.png")))
                .unwrap();
        }
        ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(8, 6, Luma([750]))
            .save(dir.path().join("depth_0001.png"))
            .unwrap();

        let mut cam = ReplayCamera::new(dir.path());
        let cfg = StreamConfig { color_format: ColorFormat::Bgr8, ..stream(8, 6) };
        cam.start(&cfg).unwrap();

        let first = cam.wait_for_frames().unwrap().unwrap();
        assert_eq!(first.color.format, ColorFormat::Bgr8);
        assert_eq!(first.color.image.get_pixel(0, 0).0, [10, 10, 200]);
        let depth = first.depth.unwrap();
        assert!((depth.distance(3, 3).unwrap() - 0.75).abs() < 1e-6);

        let second = cam.wait_for_frames().unwrap().unwrap();
        assert!(second.depth.is_none());
        assert!(cam.wait_for_frames().unwrap().is_none());
    }

    #[test]
    fn replay_moves_past_unreadable_frame() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(4, 4).save(dir.path().join("color_0001.png")).unwrap();
        RgbImage::new(8, 6).save(dir.path().join("color_0002.png")).unwrap();

        let mut cam = ReplayCamera::new(dir.path());
        cam.start(&stream(8, 6)).unwrap();
        assert!(cam.wait_for_frames().is_err());
        let next = cam.wait_for_frames().unwrap().unwrap();
        assert_eq!(next.color.image.dimensions(), (8, 6));
        assert!(cam.wait_for_frames().unwrap().is_none());
    }

    #[test]
    fn replay_start_fails_without_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = ReplayCamera::new(dir.path());
        assert!(cam.start(&stream(8, 6)).is_err());
        let mut missing = ReplayCamera::new(dir.path().join("nope"));
        assert!(missing.start(&stream(8, 6)).is_err());
    }

    #[test]
    fn stream_guard_maps_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = ReplayCamera::new(dir.path());
        let err = CameraStream::start(&mut cam, &stream(8, 6)).err().unwrap();
        assert!(matches!(err, VisionError::ResourceAcquisition(_)));
    }
}
