mod nms;
pub mod camera;
pub mod decode;
pub mod error;
pub mod fps;
pub mod fusion;
pub mod letterbox;
pub mod model;
pub mod pipeline;
pub mod tracker;
#[cfg(feature = "vision-tflite")]
pub mod tflite;

use std::marker::PhantomData;

pub use error::VisionError;
pub use nms::{iou, non_max_suppression};

/// Pixel coordinates of the letterboxed detector input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpace;

/// Pixel coordinates of the original camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSpace;

/// Axis-aligned box, corners in the coordinate space `S`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox<S> {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    space: PhantomData<S>,
}

impl<S> BBox<S> {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2, space: PhantomData }
    }

    /// From the center/size layout most detector heads emit.
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Strictly positive extent on both axes.
    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    pub(crate) fn map<T>(&self, f: impl Fn(f32, f32) -> (f32, f32)) -> BBox<T> {
        let (x1, y1) = f(self.x1, self.y1);
        let (x2, y2) = f(self.x2, self.y2);
        BBox::new(x1, y1, x2, y2)
    }
}

/// A class-labeled box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection<S> {
    pub bbox: BBox<S>,
    pub confidence: f32,
    pub class_id: usize,
}

/// Retained detections of one frame, in suppression order.
pub type DetectionSet<S> = Vec<Detection<S>>;
