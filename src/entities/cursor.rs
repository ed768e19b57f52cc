//! Single playback cursor for stages with one caller at a time.

use std::sync::atomic::{AtomicI32, Ordering};

/// Clamp to `[0, frames - 1]` (0 for empty sources)
pub fn clamp_position(position: i32, frames: i32) -> i32 {
    position.clamp(0, frames.saturating_sub(1).max(0))
}

/// Position and frame count of a stage
#[derive(Debug, Default)]
pub struct Cursor {
    position: AtomicI32,
    frames: AtomicI32,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seek(&self, position: i32, relative: bool) -> i32 {
        let frames = self.frames();
        let target = if relative {
            self.position().saturating_add(position)
        } else {
            position
        };
        let clamped = clamp_position(target, frames);
        self.position.store(clamped, Ordering::Release);
        clamped
    }

    pub fn position(&self) -> i32 {
        self.position.load(Ordering::Acquire)
    }

    pub fn frames(&self) -> i32 {
        self.frames.load(Ordering::Acquire)
    }

    /// New frame count; the position is left alone until the next seek
    pub fn set_frames(&self, frames: i32) {
        self.frames.store(frames.max(0), Ordering::Release);
    }
}
