use crate::fusion::{FusedDetection, Point2};

/// Retained state between frames.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TrackingState {
    #[default]
    Empty,
    /// Physical centroid of the previous update.
    Holding(Point2),
}

/// Frame-to-frame motion estimate fed once per frame.
pub trait MotionTracker {
    /// Returns the displacement since the previous update, if there was one.
    fn update(&mut self, current: &FusedDetection) -> Option<Point2>;
}

/// Single-slot tracker: whichever detection is fed last becomes the reference.
///
/// No identity matching and no timeout; a gap of any length keeps the stale
/// centroid until the next update.
#[derive(Debug, Clone, Default)]
pub struct LastSeenTracker {
    state: TrackingState,
}

impl LastSeenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }
}

impl MotionTracker for LastSeenTracker {
    fn update(&mut self, current: &FusedDetection) -> Option<Point2> {
        let now = current.centroid_mm;
        let prev = std::mem::replace(&mut self.state, TrackingState::Holding(now));
        match prev {
            TrackingState::Empty => None,
            TrackingState::Holding(p) => Some(now - p),
        }
    }
}
