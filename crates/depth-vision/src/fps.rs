use std::time::{Duration, Instant};

/// Frames per second over fixed windows.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window: Duration,
    window_start: Instant,
    frames: u32,
    last: Option<f32>,
}

impl FpsMeter {
    pub fn new(window: Duration) -> Self {
        Self { window, window_start: Instant::now(), frames: 0, last: None }
    }

    pub fn tick(&mut self) -> Option<f32> {
        self.tick_at(Instant::now())
    }

    /// Counts one frame; returns the new rate when a window closes.
    pub fn tick_at(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }
        let rate = self.frames as f32 / elapsed.as_secs_f32();
        self.last = Some(rate);
        self.frames = 0;
        self.window_start = now;
        Some(rate)
    }

    /// Rate of the last completed window.
    pub fn current(&self) -> Option<f32> {
        self.last
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
