use serde::{Deserialize, Serialize};

/// Axis-aligned box in sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectReport {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoxRecord,
    pub centroid_px: [u32; 2],
    pub centroid_mm: Vec2,
    pub offset_from_center_mm: Vec2,
    // None when the depth sensor had no return at the centroid
    pub depth_m: Option<f32>,
    pub depth_cm: Option<f32>,
    pub depth_in: Option<f32>,
}

/// One record per processed frame, handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub sensor_w: u32,
    pub sensor_h: u32,
    /// e.g. "2 persons, 1 car"
    pub summary: String,
    /// In processing order; the last entry is the one that fed the tracker.
    pub objects: Vec<ObjectReport>,
    /// Movement of the last processed object since the previous detection.
    pub displacement_mm: Option<Vec2>,
    pub fps: Option<f32>,
}
