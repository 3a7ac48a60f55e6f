use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    /// Invalid thresholds, stream or scaler settings. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The camera stream could not be started.
    #[error("camera failed to start: {0}")]
    ResourceAcquisition(String),

    /// Raw detector output does not match the candidate layout.
    #[error("unexpected model output: {0}")]
    ModelOutput(String),
}

pub type Result<T> = std::result::Result<T, VisionError>;

pub(crate) fn config_err(msg: impl Into<String>) -> VisionError {
    VisionError::Configuration(msg.into())
}

/// Fails with `Configuration` unless `v` lies in [0, 1]. NaN is rejected.
pub(crate) fn ensure_unit(name: &str, v: f32) -> Result<()> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(config_err(format!("{name} must be within [0, 1], got {v}")))
    }
}
