//! Synthetic leaf source.
//!
//! Produces deterministic frames so graphs can be exercised without a codec:
//! image bytes derived from the position and a continuous audio ramp in which
//! every sample carries its global sample index (negated on odd channels).

use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::audio::{Cadence, samples_for_frame_with, samples_to_frame_with};
use crate::entities::{Audio, Cursor, Frame, Image, PixelFormat, Rational, Source, SourceKind};
use crate::error::GraphResult;

/// Pattern parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternSpec {
    pub frames: i32,
    pub fps: Rational,
    pub width: usize,
    pub height: usize,
    /// 0 disables audio
    pub frequency: i32,
    pub channels: usize,
    pub cadence: Cadence,
    /// Simulated decode cost per fetch
    pub delay: Duration,
    /// Attach the image as a deferred payload
    pub deferred: bool,
    pub thread_safe: bool,
}

impl Default for PatternSpec {
    fn default() -> Self {
        Self {
            frames: 100,
            fps: Rational::new(25, 1),
            width: 8,
            height: 4,
            frequency: 48000,
            channels: 2,
            cadence: Cadence::default(),
            delay: Duration::ZERO,
            deferred: false,
            thread_safe: true,
        }
    }
}

/// Image of the pattern at `position`
pub fn pattern_image(position: i32, width: usize, height: usize) -> Image {
    let data = (0..width * height)
        .map(|i| (position as usize).wrapping_mul(31).wrapping_add(i) as u8)
        .collect();
    Image {
        width,
        height,
        format: PixelFormat::Gray8,
        data,
    }
}

/// Ramp audio covering `samples` samples from global offset `first`
pub fn ramp_audio(first: i64, samples: usize, frequency: i32, channels: usize) -> Audio {
    let mut data = Vec::with_capacity(samples * channels);
    for s in 0..samples as i64 {
        let value = (first + s) as f32;
        for c in 0..channels {
            data.push(if c % 2 == 0 { value } else { -value });
        }
    }
    Audio::from_samples(frequency, channels, data)
}

/// Leaf stage producing pattern frames
#[derive(Debug)]
pub struct Pattern {
    uuid: Uuid,
    spec: PatternSpec,
    cursor: Cursor,
    fetches: Arc<AtomicUsize>,
    decodes: Arc<AtomicUsize>,
}

impl Pattern {
    pub fn new(spec: PatternSpec) -> Self {
        let cursor = Cursor::new();
        cursor.set_frames(spec.frames);
        Self {
            uuid: Uuid::new_v4(),
            spec,
            cursor,
            fetches: Arc::new(AtomicUsize::new(0)),
            decodes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    /// Number of `fetch` calls so far
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of images actually generated (deferred ones count when realised)
    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl Source for Pattern {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Pattern
    }

    fn seek(&self, position: i32, relative: bool) {
        self.cursor.seek(position, relative);
    }

    fn position(&self) -> i32 {
        self.cursor.position()
    }

    fn frames(&self) -> i32 {
        self.cursor.frames()
    }

    fn fetch(&self) -> GraphResult<Option<Frame>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.spec.frames <= 0 {
            return Ok(None);
        }
        if !self.spec.delay.is_zero() {
            std::thread::sleep(self.spec.delay);
        }

        let position = self.cursor.position();
        let spec = self.spec;
        trace!("Pattern fetch {}", position);
        let mut frame = Frame::new(position, spec.fps);

        if spec.width > 0 && spec.height > 0 {
            let decodes = Arc::clone(&self.decodes);
            let make = move || {
                decodes.fetch_add(1, Ordering::SeqCst);
                Some(pattern_image(position, spec.width, spec.height))
            };
            if spec.deferred {
                frame.set_deferred_image(make);
            } else {
                frame.set_image(make());
            }
        }

        if spec.frequency > 0 && spec.channels > 0 {
            let (num, den) = (spec.fps.num, spec.fps.den);
            let first = samples_to_frame_with(position, spec.frequency, num, den, spec.cadence);
            let samples = samples_for_frame_with(position, spec.frequency, num, den, spec.cadence);
            frame.set_audio(Some(ramp_audio(first, samples.max(0) as usize, spec.frequency, spec.channels)));
        }

        Ok(Some(frame))
    }

    fn is_thread_safe(&self) -> bool {
        self.spec.thread_safe
    }
}
