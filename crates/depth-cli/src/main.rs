use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use depth_vision::camera::{ColorFormat, DepthFormat, ReplayCamera, StreamConfig};
use depth_vision::decode::DecodeConfig;
use depth_vision::letterbox::LetterboxConfig;
use depth_vision::model::Model;
use depth_vision::pipeline::{FrameLoop, PipelineConfig};

#[cfg(feature = "vision-tflite")]
use depth_vision::tflite::{TfliteConfig, TfliteModel};

mod sink;
use sink::JsonLinesSink;

#[derive(Debug, Parser)]
#[command(name = "depthscout", version, about = "DEPTHscout - RGB-D object detection with metric depth")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and the input paths it names.
    Doctor,
    Run {
        /// Stop after this many emitted frames.
        #[arg(long)]
        max_frames: Option<u64>,
    },
    Vision { #[command(subcommand)] cmd: VisionCmd },
}

#[derive(Debug, Subcommand)]
enum VisionCmd { Inspect }

#[derive(Debug, serde::Deserialize)]
struct Config {
    camera: CameraCfg,
    detector: DetectorCfg,
    #[serde(default)]
    letterbox: LetterboxConfig,
    #[serde(default)]
    fusion: FusionCfg,
    #[serde(default)]
    output: OutputCfg,
}

#[derive(Debug, serde::Deserialize)]
struct CameraCfg {
    #[serde(default = "default_source")]
    source: String,
    replay_dir: Option<String>,
    width: u32,
    height: u32,
    fps: u32,
    #[serde(default)]
    color_format: ColorFormat,
    #[serde(default)]
    depth_format: DepthFormat,
    #[serde(default = "default_depth_scale")]
    depth_scale: f32,
}

#[derive(Debug, serde::Deserialize)]
struct DetectorCfg {
    #[serde(default = "default_backend")]
    backend: String,
    model_path: Option<String>,
    #[serde(default = "default_img_size")]
    img_size: u32,
    #[serde(default = "default_stride")]
    stride: u32,
    #[serde(default = "default_conf")]
    conf_threshold: f32,
    #[serde(default = "default_iou")]
    iou_threshold: f32,
    classes: Option<Vec<usize>>,
    #[serde(default)]
    agnostic_nms: bool,
    #[serde(default = "default_max_det")]
    max_detections: usize,
    class_names: Vec<String>,
    #[serde(default)]
    normalized_boxes: bool,
    #[serde(default = "default_threads")]
    threads: i32,
}

#[derive(Debug, serde::Deserialize)]
struct FusionCfg {
    #[serde(default = "default_conversion_factor")]
    conversion_factor: f32,
}

impl Default for FusionCfg {
    fn default() -> Self {
        Self { conversion_factor: default_conversion_factor() }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct OutputCfg {
    path: Option<String>,
}

fn default_source() -> String { "replay".into() }
fn default_depth_scale() -> f32 { 0.001 }
fn default_backend() -> String { "tflite".into() }
fn default_img_size() -> u32 { 640 }
fn default_stride() -> u32 { 32 }
fn default_conf() -> f32 { 0.25 }
fn default_iou() -> f32 { 0.45 }
fn default_max_det() -> usize { 300 }
fn default_threads() -> i32 { 4 }
fn default_conversion_factor() -> f32 { 0.1 }

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Run { max_frames } => run(cfg, max_frames).await?,
        Command::Vision { cmd } => vision_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

fn pipeline_config(cfg: &Config) -> PipelineConfig {
    let c = &cfg.camera;
    let d = &cfg.detector;
    PipelineConfig {
        stream: StreamConfig {
            width: c.width,
            height: c.height,
            fps: c.fps,
            color_format: c.color_format,
            depth_format: c.depth_format,
            depth_scale: c.depth_scale,
        },
        img_size: d.img_size,
        stride: d.stride,
        letterbox: cfg.letterbox.clone(),
        decode: DecodeConfig {
            conf_threshold: d.conf_threshold,
            iou_threshold: d.iou_threshold,
            classes: d.classes.clone(),
            agnostic: d.agnostic_nms,
            max_detections: d.max_detections,
        },
        conversion_factor: cfg.fusion.conversion_factor,
        class_names: d.class_names.clone(),
    }
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    pipeline_config(cfg).validate()?;

    match cfg.camera.source.as_str() {
        "replay" => {
            let dir = cfg.camera.replay_dir.as_ref().context("camera.replay_dir missing")?;
            anyhow::ensure!(Path::new(dir).is_dir(), "camera.replay_dir {} is not a directory", dir);
        }
        other => anyhow::bail!("unknown camera.source: {}", other),
    }

    match cfg.detector.backend.as_str() {
        "tflite" => {
            if !cfg!(feature = "vision-tflite") {
                warn!("doctor: detector.backend=tflite but binary not built with --features vision-tflite");
            }
            let p = cfg.detector.model_path.as_ref().context("detector.model_path missing")?;
            anyhow::ensure!(Path::new(p).is_file(), "detector.model_path {} not found", p);
            info!(
                "doctor: tflite model={} threads={} normalized_boxes={}",
                p, cfg.detector.threads, cfg.detector.normalized_boxes
            );
        }
        other => anyhow::bail!("unknown detector.backend: {}", other),
    }

    if let Some(out) = &cfg.output.path {
        info!("doctor: reports go to {}", out);
    }

    info!("doctor: OK");
    Ok(())
}

#[cfg(feature = "vision-tflite")]
async fn vision_cmd(cfg: &Config, cmd: VisionCmd) -> Result<()> {
    match cmd {
        VisionCmd::Inspect => {
            let mut m = TfliteModel::new(tflite_config(&cfg.detector)?)?;
            print!("{}", m.inspect()?);
            Ok(())
        }
    }
}

#[cfg(not(feature = "vision-tflite"))]
async fn vision_cmd(_cfg: &Config, _cmd: VisionCmd) -> Result<()> {
    anyhow::bail!("vision backend not available; build with --features vision-tflite");
}

async fn run(cfg: Config, max_frames: Option<u64>) -> Result<()> {
    info!("run: starting");

    let model = init_model(&cfg.detector)?;
    let mut frame_loop = FrameLoop::new(pipeline_config(&cfg), model)?;
    let mut camera = init_camera(&cfg.camera)?;
    let mut sink = match &cfg.output.path {
        Some(p) => JsonLinesSink::create(p)?,
        None => JsonLinesSink::stdout(),
    }
    .with_limit(max_frames);

    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("run: interrupted, stopping");
            stop2.store(true, Ordering::Relaxed);
        }
    });

    // Capture and inference block; keep them off the runtime threads.
    let (summary, written) = tokio::task::spawn_blocking(move || {
        let summary = frame_loop.run(&mut camera, &mut sink, &stop)?;
        Ok::<_, anyhow::Error>((summary, sink.written()))
    })
    .await
    .context("frame loop task")??;

    info!(
        "run: finished frames={} gaps={} detections={} reports={}",
        summary.frames, summary.gaps, summary.detections, written
    );
    Ok(())
}

fn init_camera(c: &CameraCfg) -> Result<ReplayCamera> {
    match c.source.as_str() {
        "replay" => Ok(ReplayCamera::new(c.replay_dir.as_ref().context("camera.replay_dir missing")?)),
        other => anyhow::bail!("unknown camera.source: {}", other),
    }
}

fn init_model(d: &DetectorCfg) -> Result<Box<dyn Model + Send>> {
    match d.backend.as_str() {
        #[cfg(feature = "vision-tflite")]
        "tflite" => Ok(Box::new(TfliteModel::new(tflite_config(d)?)?)),
        #[cfg(not(feature = "vision-tflite"))]
        "tflite" => anyhow::bail!("detector.backend=tflite but binary not built with --features vision-tflite"),
        other => anyhow::bail!("unknown detector.backend: {}", other),
    }
}

#[cfg(feature = "vision-tflite")]
fn tflite_config(d: &DetectorCfg) -> Result<TfliteConfig> {
    Ok(TfliteConfig {
        model_path: d.model_path.clone().context("detector.model_path missing")?,
        threads: d.threads,
        normalized_boxes: d.normalized_boxes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../../../configs/depthscout.toml");

    #[test]
    fn sample_config_is_valid() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        let pc = pipeline_config(&cfg);
        pc.validate().unwrap();
        assert_eq!(pc.stream.color_format, ColorFormat::Bgr8);
        assert_eq!(pc.class_names.len(), 80);
    }

    #[test]
    fn minimal_config_takes_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [camera]
            replay_dir = "frames"
            width = 640
            height = 480
            fps = 30

            [detector]
            class_names = ["rock"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.camera.source, "replay");
        assert_eq!(cfg.camera.depth_scale, 0.001);
        assert_eq!(cfg.detector.backend, "tflite");
        assert_eq!((cfg.detector.img_size, cfg.detector.stride), (640, 32));
        assert_eq!(cfg.detector.max_detections, 300);
        assert!(cfg.letterbox.auto && cfg.letterbox.scale_up && !cfg.letterbox.scale_fill);
        assert_eq!(cfg.letterbox.fill, [114, 114, 114]);
        assert_eq!(cfg.fusion.conversion_factor, 0.1);
        assert!(cfg.output.path.is_none());

        let pc = pipeline_config(&cfg);
        assert_eq!(pc.decode, DecodeConfig::default());
        pc.validate().unwrap();
    }

    #[test]
    fn bad_values_fail_validation() {
        let base = r#"
            [camera]
            width = 640
            height = 480
            fps = 30

            [detector]
            class_names = ["rock", "car"]
        "#;
        let mut cfg: Config = toml::from_str(base).unwrap();
        cfg.detector.iou_threshold = -0.1;
        assert!(pipeline_config(&cfg).validate().is_err());

        let mut cfg: Config = toml::from_str(base).unwrap();
        cfg.detector.classes = Some(vec![0, 2]);
        assert!(pipeline_config(&cfg).validate().is_err());

        let mut cfg: Config = toml::from_str(base).unwrap();
        cfg.camera.fps = 0;
        assert!(pipeline_config(&cfg).validate().is_err());
    }

    #[test]
    fn unknown_camera_source_is_rejected() {
        let cfg: Config = toml::from_str(
            r#"
            [camera]
            source = "usb"
            width = 640
            height = 480
            fps = 30

            [detector]
            class_names = ["rock"]
            "#,
        )
        .unwrap();
        assert!(init_camera(&cfg.camera).is_err());
    }
}
