use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::Path;
use tracing::info;

use depth_proto::report::FrameReport;
use depth_vision::pipeline::FrameSink;

/// Renders frame reports as JSON lines, one object per frame.
pub struct JsonLinesSink {
    out: Box<dyn Write + Send>,
    written: u64,
    limit: Option<u64>,
}

impl JsonLinesSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out, written: 0, limit: None }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
        info!("output: writing frame reports to {}", path.display());
        Ok(Self::new(Box::new(BufWriter::new(f))))
    }

    /// Ask the loop to stop after `limit` reports.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for JsonLinesSink {
    fn emit(&mut self, report: &FrameReport) -> Result<ControlFlow<()>> {
        serde_json::to_writer(&mut self.out, report).context("encode frame report")?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.written += 1;

        match self.limit {
            Some(n) if self.written >= n => Ok(ControlFlow::Break(())),
            _ => Ok(ControlFlow::Continue(())),
        }
    }
}
