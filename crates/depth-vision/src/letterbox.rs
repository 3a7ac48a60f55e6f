use image::{imageops::{self, FilterType}, Rgb, RgbImage};
use serde::Deserialize;

use crate::camera::{ColorFormat, ColorFrame};
use crate::error::{config_err, Result};
use crate::{BBox, ModelSpace, SensorSpace};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LetterboxConfig {
    /// Minimum rectangle: pad only up to the next stride multiple.
    pub auto: bool,
    /// Allow ratios above 1.0.
    pub scale_up: bool,
    /// Stretch to the target without padding (ignored when `auto` is set).
    pub scale_fill: bool,
    pub fill: [u8; 3],
}

impl Default for LetterboxConfig {
    fn default() -> Self {
        Self { auto: true, scale_up: true, scale_fill: false, fill: [114, 114, 114] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Border {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

/// Geometry of one letterbox operation, enough to map boxes both ways.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleParams {
    /// (width, height) ratios, equal unless stretching.
    pub ratio: (f32, f32),
    /// Resized size before padding, (width, height).
    pub new_unpad: (u32, u32),
    /// Half padding per axis, (dx, dy).
    pub pad: (f32, f32),
    pub border: Border,
}

impl ScaleParams {
    pub fn compute(src: (u32, u32), target: (u32, u32), stride: u32, cfg: &LetterboxConfig) -> Self {
        let (w0, h0) = (src.0 as f32, src.1 as f32);
        let (tw, th) = (target.0 as f32, target.1 as f32);

        let mut r = (th / h0).min(tw / w0);
        if !cfg.scale_up {
            r = r.min(1.0);
        }

        let mut ratio = (r, r);
        let mut new_unpad = (((w0 * r).round_ties_even() as u32).max(1), ((h0 * r).round_ties_even() as u32).max(1));
        let mut dw = (tw - new_unpad.0 as f32).max(0.0);
        let mut dh = (th - new_unpad.1 as f32).max(0.0);
        if cfg.auto {
            let s = stride.max(1) as f32;
            dw = dw.rem_euclid(s);
            dh = dh.rem_euclid(s);
        } else if cfg.scale_fill {
            dw = 0.0;
            dh = 0.0;
            new_unpad = target;
            ratio = (tw / w0, th / h0);
        }

        dw /= 2.0;
        dh /= 2.0;
        let border = Border {
            top: (dh - 0.1).round_ties_even().max(0.0) as u32,
            bottom: (dh + 0.1).round_ties_even().max(0.0) as u32,
            left: (dw - 0.1).round_ties_even().max(0.0) as u32,
            right: (dw + 0.1).round_ties_even().max(0.0) as u32,
        };

        Self { ratio, new_unpad, pad: (dw, dh), border }
    }

    /// Padded output size, (width, height).
    pub fn output_size(&self) -> (u32, u32) {
        (
            self.new_unpad.0 + self.border.left + self.border.right,
            self.new_unpad.1 + self.border.top + self.border.bottom,
        )
    }

    pub fn forward(&self, b: &BBox<SensorSpace>) -> BBox<ModelSpace> {
        b.map(|x, y| (x * self.ratio.0 + self.pad.0, y * self.ratio.1 + self.pad.1))
    }

    /// Undo padding and scaling, clamp into the sensor frame, round to whole pixels.
    pub fn unscale(&self, b: &BBox<ModelSpace>, sensor_w: u32, sensor_h: u32) -> BBox<SensorSpace> {
        let (sw, sh) = (sensor_w as f32, sensor_h as f32);
        b.map(|x, y| {
            (
                ((x - self.pad.0) / self.ratio.0).clamp(0.0, sw).round_ties_even(),
                ((y - self.pad.1) / self.ratio.1).clamp(0.0, sh).round_ties_even(),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// planar, channel-first (torch/onnx style)
    Chw,
    /// interleaved (tflite style)
    Hwc,
}

/// Detector input: the letterboxed frame plus its mapping back to sensor space.
#[derive(Debug, Clone)]
pub struct ScaledImage {
    pub image: RgbImage,
    pub format: ColorFormat,
    pub params: ScaleParams,
    /// Sensor frame size, (width, height).
    pub source_size: (u32, u32),
}

impl ScaledImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// RGB, normalized to 0..1. BGR frames are swapped on the way.
    pub fn to_tensor(&self, layout: TensorLayout) -> Vec<f32> {
        let (w, h) = (self.width() as usize, self.height() as usize);
        let plane = w * h;
        let mut out = vec![0.0f32; plane * 3];
        let swap = self.format == ColorFormat::Bgr8;

        for (x, y, px) in self.image.enumerate_pixels() {
            let [a, b, c] = px.0;
            let rgb = if swap { [c, b, a] } else { [a, b, c] };
            let idx = y as usize * w + x as usize;
            for (ch, v) in rgb.iter().enumerate() {
                let v = *v as f32 / 255.0;
                match layout {
                    TensorLayout::Chw => out[ch * plane + idx] = v,
                    TensorLayout::Hwc => out[idx * 3 + ch] = v,
                }
            }
        }
        out
    }
}

/// Resize (linear) and pad `img` to fit `target` (width, height) while keeping aspect.
pub fn letterbox(img: &RgbImage, target: (u32, u32), stride: u32, cfg: &LetterboxConfig) -> (RgbImage, ScaleParams) {
    let params = ScaleParams::compute(img.dimensions(), target, stride, cfg);

    let resized = if img.dimensions() != params.new_unpad {
        imageops::resize(img, params.new_unpad.0, params.new_unpad.1, FilterType::Triangle)
    } else {
        img.clone()
    };

    let (ow, oh) = params.output_size();
    if (ow, oh) == params.new_unpad {
        return (resized, params);
    }
    let mut canvas = RgbImage::from_pixel(ow, oh, Rgb(cfg.fill));
    imageops::replace(&mut canvas, &resized, params.border.left as i64, params.border.top as i64);
    (canvas, params)
}

/// Fixed square detector input of `size` pixels.
#[derive(Debug, Clone)]
pub struct FrameScaler {
    size: u32,
    stride: u32,
    cfg: LetterboxConfig,
}

impl FrameScaler {
    pub fn new(size: u32, stride: u32, cfg: LetterboxConfig) -> Result<Self> {
        if stride == 0 {
            return Err(config_err("detector stride must be > 0"));
        }
        if size == 0 || size % stride != 0 {
            return Err(config_err(format!("img_size {size} must be a positive multiple of stride {stride}")));
        }
        Ok(Self { size, stride, cfg })
    }

    pub fn scale(&self, frame: &ColorFrame) -> ScaledImage {
        let (image, params) = letterbox(&frame.image, (self.size, self.size), self.stride, &self.cfg);
        ScaledImage { image, format: frame.format, params, source_size: frame.image.dimensions() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto_cfg() -> LetterboxConfig {
        LetterboxConfig::default()
    }

    #[test]
    fn hd_frame_into_640_auto() {
        let p = ScaleParams::compute((1280, 720), (640, 640), 32, &auto_cfg());
        assert_eq!(p.ratio, (0.5, 0.5));
        assert_eq!(p.new_unpad, (640, 360));
        assert_eq!(p.pad, (0.0, 12.0));
        assert_eq!(p.border, Border { top: 12, bottom: 12, left: 0, right: 0 });
        assert_eq!(p.output_size(), (640, 384));
    }

    #[test]
    fn hd_frame_into_640_full_square() {
        let cfg = LetterboxConfig { auto: false, ..auto_cfg() };
        let p = ScaleParams::compute((1280, 720), (640, 640), 32, &cfg);
        assert_eq!(p.pad, (0.0, 140.0));
        assert_eq!(p.output_size(), (640, 640));
    }

    #[test]
    fn odd_padding_goes_to_trailing_edge() {
        // 1280x718 -> 640x359, 281 px of vertical padding
        let cfg = LetterboxConfig { auto: false, ..auto_cfg() };
        let p = ScaleParams::compute((1280, 718), (640, 640), 32, &cfg);
        assert_eq!(p.new_unpad, (640, 359));
        assert_eq!(p.pad.1, 140.5);
        assert_eq!(p.border.top, 140);
        assert_eq!(p.border.bottom, 141);
        assert_eq!(p.output_size(), (640, 640));
    }

    #[test]
    fn half_pixel_sizes_round_to_even() {
        // 721 * 0.5 = 360.5 -> 360, leaving 24 px split evenly
        let p = ScaleParams::compute((1280, 721), (640, 640), 32, &auto_cfg());
        assert_eq!(p.new_unpad, (640, 360));
        assert_eq!(p.pad, (0.0, 12.0));
        assert_eq!(p.border, Border { top: 12, bottom: 12, left: 0, right: 0 });
        assert_eq!(p.output_size(), (640, 384));

        let b: BBox<ModelSpace> = BBox::new(0.75, 12.25, 1.25, 13.75);
        let s = p.unscale(&b, 1280, 721);
        assert_eq!((s.x1, s.y1, s.x2, s.y2), (2.0, 0.0, 2.0, 4.0));
    }

    #[test]
    fn no_scale_up() {
        let cfg = LetterboxConfig { scale_up: false, auto: false, ..auto_cfg() };
        let p = ScaleParams::compute((320, 240), (640, 640), 32, &cfg);
        assert_eq!(p.ratio, (1.0, 1.0));
        assert_eq!(p.new_unpad, (320, 240));
        assert_eq!(p.border, Border { top: 200, bottom: 200, left: 160, right: 160 });

        let up = ScaleParams::compute((320, 240), (640, 640), 32, &auto_cfg());
        assert_eq!(up.ratio, (2.0, 2.0));
    }

    #[test]
    fn stretch_mode() {
        let cfg = LetterboxConfig { auto: false, scale_fill: true, ..auto_cfg() };
        let p = ScaleParams::compute((1280, 720), (640, 640), 32, &cfg);
        assert_eq!(p.new_unpad, (640, 640));
        assert_eq!(p.pad, (0.0, 0.0));
        assert_eq!(p.ratio.0, 0.5);
        assert!((p.ratio.1 - 640.0 / 720.0).abs() < 1e-6);
    }

    #[test]
    fn round_trip_within_a_pixel() {
        for (src, cfg) in [
            ((1280, 720), auto_cfg()),
            ((1280, 718), LetterboxConfig { auto: false, ..auto_cfg() }),
            ((640, 480), auto_cfg()),
            ((333, 501), auto_cfg()),
        ] {
            let p = ScaleParams::compute(src, (640, 640), 32, &cfg);
            let b: BBox<SensorSpace> = BBox::new(17.0, 33.0, 211.0, 260.0);
            let back = p.unscale(&p.forward(&b), src.0, src.1);
            for (a, z) in [(b.x1, back.x1), (b.y1, back.y1), (b.x2, back.x2), (b.y2, back.y2)] {
                assert!((a - z).abs() <= 1.0, "{src:?}: {a} vs {z}");
            }
        }
    }

    #[test]
    fn unscale_clamps_into_frame() {
        let p = ScaleParams::compute((1280, 720), (640, 640), 32, &auto_cfg());
        let b: BBox<ModelSpace> = BBox::new(-20.0, 0.0, 700.0, 400.0);
        let s = p.unscale(&b, 1280, 720);
        assert_eq!((s.x1, s.y1, s.x2, s.y2), (0.0, 0.0, 1280.0, 720.0));
    }

    #[test]
    fn letterbox_pads_with_fill() {
        let img = RgbImage::from_pixel(1280, 720, Rgb([10, 20, 30]));
        let (out, p) = letterbox(&img, (640, 640), 32, &auto_cfg());
        assert_eq!(out.dimensions(), p.output_size());
        assert_eq!(out.get_pixel(5, 2).0, [114, 114, 114]);
        assert_eq!(out.get_pixel(5, 383).0, [114, 114, 114]);
        assert_eq!(out.get_pixel(320, 192).0, [10, 20, 30]);
    }

    #[test]
    fn scaler_rejects_bad_geometry() {
        assert!(FrameScaler::new(640, 0, auto_cfg()).is_err());
        assert!(FrameScaler::new(650, 32, auto_cfg()).is_err());
        assert!(FrameScaler::new(640, 32, auto_cfg()).is_ok());
    }

    #[test]
    fn tensor_layouts_and_bgr_swap() {
        let mut image = RgbImage::from_pixel(2, 1, Rgb([255, 0, 0]));
        image.put_pixel(1, 0, Rgb([0, 0, 255]));
        let params = ScaleParams::compute((2, 1), (2, 1), 1, &LetterboxConfig { auto: false, ..auto_cfg() });
        let mut s = ScaledImage { image, format: ColorFormat::Rgb8, params, source_size: (2, 1) };

        assert_eq!(s.to_tensor(TensorLayout::Chw), vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(s.to_tensor(TensorLayout::Hwc), vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);

        s.format = ColorFormat::Bgr8;
        assert_eq!(s.to_tensor(TensorLayout::Hwc), vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }
}
