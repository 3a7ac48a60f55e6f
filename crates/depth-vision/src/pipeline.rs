use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use depth_proto::report::{BoxRecord, FrameReport, ObjectReport, Vec2};

use crate::camera::{CameraSource, CameraStream, DepthQuery, FramePair, StreamConfig};
use crate::decode::{decode, DecodeConfig};
use crate::error::{config_err, VisionError};
use crate::fps::FpsMeter;
use crate::fusion::{FusedDetection, Point2, SpatialFusion};
use crate::letterbox::{FrameScaler, LetterboxConfig};
use crate::model::Model;
use crate::tracker::{LastSeenTracker, MotionTracker};
use crate::{Detection, DetectionSet, ModelSpace, SensorSpace};

/// A camera that keeps failing this many reads in a row is treated as lost.
pub const MAX_CONSECUTIVE_READ_FAILURES: u32 = 30;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stream: StreamConfig,
    /// Square detector input edge.
    pub img_size: u32,
    pub stride: u32,
    pub letterbox: LetterboxConfig,
    pub decode: DecodeConfig,
    /// Millimeters per pixel.
    pub conversion_factor: f32,
    pub class_names: Vec<String>,
}

impl PipelineConfig {
    /// Checks every setting without touching the camera or the model.
    pub fn validate(&self) -> Result<(), VisionError> {
        self.stream.validate()?;
        if self.class_names.is_empty() {
            return Err(config_err("class_names must not be empty"));
        }
        self.decode.validate(self.class_names.len())?;
        FrameScaler::new(self.img_size, self.stride, self.letterbox.clone())?;
        SpatialFusion::new(self.conversion_factor)?;
        Ok(())
    }
}

/// Renderer boundary. Returning `Break` ends the loop.
pub trait FrameSink {
    fn emit(&mut self, report: &FrameReport) -> Result<ControlFlow<()>>;
}

/// Everything computed for one frame pair.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub sensor_size: (u32, u32),
    /// Suppression output in detector input coordinates.
    pub detections: DetectionSet<ModelSpace>,
    /// In processing order (lowest confidence first).
    pub fused: Vec<FusedDetection>,
    /// Motion of the last fused detection, millimeters.
    pub displacement: Option<Point2>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub frames: u64,
    pub gaps: u64,
    pub detections: u64,
}

pub struct FrameLoop<M, T = LastSeenTracker> {
    model: M,
    tracker: T,
    scaler: FrameScaler,
    decode: DecodeConfig,
    fusion: SpatialFusion,
    stream: StreamConfig,
    class_names: Vec<String>,
    fps: FpsMeter,
    seq: u64,
}

impl<M: Model> FrameLoop<M> {
    pub fn new(cfg: PipelineConfig, model: M) -> Result<Self, VisionError> {
        Self::with_tracker(cfg, model, LastSeenTracker::new())
    }
}

impl<M: Model, T: MotionTracker> FrameLoop<M, T> {
    pub fn with_tracker(cfg: PipelineConfig, model: M, tracker: T) -> Result<Self, VisionError> {
        cfg.validate()?;
        let scaler = FrameScaler::new(cfg.img_size, cfg.stride, cfg.letterbox)?;
        let fusion = SpatialFusion::new(cfg.conversion_factor)?;

        Ok(Self {
            model,
            tracker,
            scaler,
            decode: cfg.decode,
            fusion,
            stream: cfg.stream,
            class_names: cfg.class_names,
            fps: FpsMeter::default(),
            seq: 0,
        })
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Runs until `stop` is raised, the sink breaks, or the stream ends.
    ///
    /// A failed frame read counts as a gap; only a run of
    /// [`MAX_CONSECUTIVE_READ_FAILURES`] ends the loop. The camera is stopped on
    /// every exit path, errors included.
    pub fn run<C, K>(&mut self, camera: &mut C, sink: &mut K, stop: &AtomicBool) -> Result<LoopSummary>
    where
        C: CameraSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let mut stream = CameraStream::start(camera, &self.stream)?;
        let mut summary = LoopSummary::default();
        let mut read_failures = 0u32;

        loop {
            if stop.load(Ordering::Relaxed) {
                info!("loop: stop requested");
                break;
            }
            let pair = match stream.next_pair() {
                Ok(Some(pair)) => {
                    read_failures = 0;
                    pair
                }
                Ok(None) => {
                    info!("loop: camera stream ended");
                    break;
                }
                Err(e) => {
                    read_failures += 1;
                    if read_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                        return Err(e.context(format!("{read_failures} consecutive frame read failures")));
                    }
                    warn!("loop: frame read failed, skipping: {:#}", e);
                    summary.gaps += 1;
                    continue;
                }
            };
            let Some(result) = self.process_pair(pair)? else {
                summary.gaps += 1;
                continue;
            };

            summary.frames += 1;
            summary.detections += result.fused.len() as u64;
            if let Some(rate) = self.fps.tick() {
                info!("loop: {:.1} fps", rate);
            }

            let report = self.report(&result);
            if sink.emit(&report).context("emit frame report")?.is_break() {
                info!("loop: sink requested stop");
                break;
            }
        }

        info!("loop: done frames={} gaps={} detections={}", summary.frames, summary.gaps, summary.detections);
        Ok(summary)
    }

    /// Processes one pair end to end. `Ok(None)` means the pair was skipped.
    pub fn process_pair(&mut self, pair: FramePair) -> Result<Option<FrameResult>> {
        let FramePair { color, depth } = pair;
        let Some(depth) = depth else {
            debug!("loop: frame without depth, skipping");
            return Ok(None);
        };
        let sensor = color.image.dimensions();
        if sensor.0 == 0 || sensor.1 == 0 {
            warn!("loop: empty color frame, skipping");
            return Ok(None);
        }
        if depth.dimensions() != sensor {
            warn!("loop: depth {:?} not aligned with color {:?}, skipping", depth.dimensions(), sensor);
            return Ok(None);
        }

        let scaled = self.scaler.scale(&color);
        let raw = self.model.infer(&scaled).context("model inference")?;
        if raw.num_classes() != self.class_names.len() {
            return Err(VisionError::ModelOutput(format!(
                "model reports {} classes, {} names configured",
                raw.num_classes(),
                self.class_names.len()
            ))
            .into());
        }
        let detections = decode(&raw, &self.decode)?;

        let in_sensor: Vec<Detection<SensorSpace>> = detections
            .iter()
            .filter_map(|d| {
                let bbox = scaled.params.unscale(&d.bbox, sensor.0, sensor.1);
                if !bbox.is_valid() {
                    debug!("loop: box {:?} collapsed after clamping, dropped", d.bbox);
                    return None;
                }
                Some(Detection { bbox, confidence: d.confidence, class_id: d.class_id })
            })
            .collect();

        // lowest confidence first: the best detection is fused last and feeds the tracker
        let fused: Vec<FusedDetection> = in_sensor.iter().rev().map(|d| self.fusion.fuse(d, &depth)).collect();
        let displacement = fused.last().and_then(|f| self.tracker.update(f));

        Ok(Some(FrameResult { sensor_size: sensor, detections, fused, displacement }))
    }

    fn report(&mut self, result: &FrameResult) -> FrameReport {
        self.seq += 1;
        FrameReport {
            seq: self.seq,
            ts_unix_ms: (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            sensor_w: result.sensor_size.0,
            sensor_h: result.sensor_size.1,
            summary: class_summary(result.fused.iter().map(|f| f.detection.class_id), &self.class_names),
            objects: result.fused.iter().map(|f| object_report(f, &self.class_names)).collect(),
            displacement_mm: result.displacement.map(vec2),
            fps: self.fps.current(),
        }
    }
}

fn vec2(p: Point2) -> Vec2 {
    Vec2 { x: p.x, y: p.y }
}

fn class_name(names: &[String], id: usize) -> &str {
    names.get(id).map(String::as_str).unwrap_or("unknown")
}

/// Per-class counts in class order, e.g. `"2 rocks, 1 person"`.
pub fn class_summary(ids: impl IntoIterator<Item = usize>, names: &[String]) -> String {
    let mut counts = BTreeMap::new();
    for id in ids {
        *counts.entry(id).or_insert(0usize) += 1;
    }
    counts
        .into_iter()
        .map(|(id, n)| format!("{} {}{}", n, class_name(names, id), if n > 1 { "s" } else { "" }))
        .collect::<Vec<_>>()
        .join(", ")
}

fn object_report(f: &FusedDetection, names: &[String]) -> ObjectReport {
    let d = &f.detection;
    ObjectReport {
        class_id: d.class_id,
        label: format!("{} {:.2}", class_name(names, d.class_id), d.confidence),
        confidence: d.confidence,
        bbox: BoxRecord { x1: d.bbox.x1, y1: d.bbox.y1, x2: d.bbox.x2, y2: d.bbox.y2 },
        centroid_px: [f.centroid_px.0, f.centroid_px.1],
        centroid_mm: vec2(f.centroid_mm),
        offset_from_center_mm: vec2(f.offset_from_center_mm),
        depth_m: f.depth_m,
        depth_cm: f.depth_cm(),
        depth_in: f.depth_in(),
    }
}
