use crate::camera::DepthQuery;
use crate::error::{config_err, Result};
use crate::{Detection, SensorSpace};

pub const CM_PER_M: f32 = 100.0;
pub const IN_PER_M: f32 = 39.3701;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl std::ops::Sub for Point2 {
    type Output = Point2;

    fn sub(self, rhs: Point2) -> Point2 {
        Point2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// A sensor-space detection placed in physical units.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedDetection {
    pub detection: Detection<SensorSpace>,
    pub centroid_px: (u32, u32),
    /// Centroid scaled by the pixel to millimeter factor.
    pub centroid_mm: Point2,
    /// Centroid relative to the frame center, millimeters.
    pub offset_from_center_mm: Point2,
    /// `None` when the sensor had no valid return at the centroid.
    pub depth_m: Option<f32>,
}

impl FusedDetection {
    pub fn depth_cm(&self) -> Option<f32> {
        self.depth_m.map(|m| m * CM_PER_M)
    }

    pub fn depth_in(&self) -> Option<f32> {
        self.depth_m.map(|m| m * IN_PER_M)
    }
}

/// Centroid + depth lookup with a fixed linear pixel to millimeter factor.
///
/// There is no lens model here: the factor is a flat calibration constant.
#[derive(Debug, Clone, Copy)]
pub struct SpatialFusion {
    mm_per_px: f32,
}

impl SpatialFusion {
    pub fn new(mm_per_px: f32) -> Result<Self> {
        if !(mm_per_px.is_finite() && mm_per_px > 0.0) {
            return Err(config_err(format!("conversion_factor must be a positive number, got {mm_per_px}")));
        }
        Ok(Self { mm_per_px })
    }

    pub fn fuse<D: DepthQuery + ?Sized>(&self, det: &Detection<SensorSpace>, depth: &D) -> FusedDetection {
        let b = &det.bbox;
        let cx = ((b.x1 + b.x2) / 2.0).floor().max(0.0) as u32;
        let cy = ((b.y1 + b.y2) / 2.0).floor().max(0.0) as u32;
        let k = self.mm_per_px;

        let centroid_mm = Point2::new(cx as f32 * k, cy as f32 * k);
        let (w, h) = depth.dimensions();
        let center_mm = Point2::new(w as f32 / 2.0 * k, h as f32 / 2.0 * k);

        let depth_m = depth.distance(cx, cy).filter(|m| m.is_finite() && *m > 0.0);

        FusedDetection {
            detection: *det,
            centroid_px: (cx, cy),
            centroid_mm,
            offset_from_center_mm: centroid_mm - center_mm,
            depth_m,
        }
    }
}
