//! Frame rate conform.
//!
//! Output position `p` at the target rate takes its image from the first
//! overlapping input frame and its audio from every input frame overlapping
//! the output sample range `[samples_to_frame(p), +samples_for_frame(p))`.
//! Audio stays sample continuous across output frames; gaps are silence.

use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::audio::{Cadence, map_first, samples_for_frame_with, samples_to_frame_with};
use crate::entities::keys::{O_FPS_DEN, O_FPS_NUM};
use crate::entities::{Audio, Cursor, Frame, Rational, Source, SourceKind, SourceRef};
use crate::error::{GraphError, GraphResult};

const STAGE: &str = "frame_rate";

/// Sample range `[first, first + count)` of `position` at `fps`
fn sample_range(position: i32, frequency: i32, fps: Rational, cadence: Cadence) -> (i64, i64) {
    let first = samples_to_frame_with(position, frequency, fps.num, fps.den, cadence);
    let count = samples_for_frame_with(position, frequency, fps.num, fps.den, cadence) as i64;
    (first, count)
}

pub struct FrameRate {
    uuid: Uuid,
    serialise_as: Option<&'static str>,
    cursor: Cursor,
    input: Mutex<Option<SourceRef>>,
    target: Mutex<Rational>,
    /// Input rate, learned from the first frame after a structural change
    learned: Mutex<Option<Rational>>,
    cadence: Cadence,
    thread_safe: AtomicBool,
}

impl FrameRate {
    pub fn new(target: Rational) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            serialise_as: None,
            cursor: Cursor::new(),
            input: Mutex::new(None),
            target: Mutex::new(target.reduced()),
            learned: Mutex::new(None),
            cadence: Cadence::default(),
            thread_safe: AtomicBool::new(true),
        }
    }

    pub fn with_serialise_as(mut self, tag: &'static str) -> Self {
        self.serialise_as = Some(tag);
        self
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn target(&self) -> Rational {
        *self.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn upstream(&self) -> GraphResult<SourceRef> {
        self.input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(GraphError::NotConnected { stage: STAGE, slot: 0 })
    }

    fn forget_rate(&self) {
        *self.learned.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Input rate; `None` until the input produced a frame
    fn input_rate(&self, input: &SourceRef) -> GraphResult<Option<Rational>> {
        let mut learned = self.learned.lock().unwrap_or_else(|e| e.into_inner());
        if learned.is_none() {
            let position = input.position();
            *learned = input.fetch_at(position)?.map(|f| f.fps().reduced());
            if let Some(fps) = *learned {
                debug!("FrameRate {}: input {} -> output {}", self.uuid, fps, self.target());
            }
        }
        Ok(*learned)
    }

    /// Output length for `frames` input frames
    fn scaled_frames(frames: i32, from: Rational, to: Rational) -> i32 {
        if !from.is_valid() || !to.is_valid() || frames <= 0 {
            return frames.max(0);
        }
        let n = frames as i128 * to.num as i128 * from.den as i128;
        let d = from.num as i128 * to.den as i128;
        let scaled = n / d + i128::from(n % d != 0);
        scaled.min(i32::MAX as i128) as i32
    }

    fn conform_audio(&self, input: &SourceRef, position: i32, from: Rational, reference: &Frame) -> GraphResult<Option<Audio>> {
        let Some(model) = reference.audio() else {
            return Ok(None);
        };
        let to = self.target();
        let frequency = model.frequency;
        let channels = model.channels;
        let (start, count) = sample_range(position, frequency, to, self.cadence);
        let end = start + count;
        let mut out = Audio::new(frequency, channels, count.max(0) as usize);

        let frames = input.frames();
        let mut index = (map_first(position, to, from) - 1).max(0);
        while index < frames {
            let (in_start, in_count) = sample_range(index, frequency, from, self.cadence);
            if in_start >= end {
                break;
            }
            let overlap_start = start.max(in_start);
            let overlap_end = end.min(in_start + in_count);
            if overlap_start < overlap_end {
                let audio = if index == reference.position() {
                    reference.audio()
                } else {
                    input.fetch_at(index)?.and_then(|f| f.audio())
                };
                match audio {
                    Some(audio) if audio.channels == channels => {
                        let piece = audio.slice((overlap_start - in_start) as usize, (overlap_end - overlap_start) as usize);
                        let at = (overlap_start - start) as usize * channels;
                        out.data[at..at + piece.data.len()].copy_from_slice(&piece.data);
                    }
                    _ => trace!("FrameRate {}: silence for input {}", self.uuid, index),
                }
            }
            index += 1;
        }
        Ok(Some(out))
    }
}

impl Source for FrameRate {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::FrameRate
    }

    fn slot_count(&self) -> usize {
        1
    }

    fn connect(&self, source: SourceRef, slot: usize) -> GraphResult<()> {
        if slot != 0 {
            return Err(GraphError::InvalidSlot {
                stage: STAGE,
                slot,
                count: 1,
            });
        }
        self.thread_safe.store(source.is_thread_safe(), Ordering::Relaxed);
        *self.input.lock().unwrap_or_else(|e| e.into_inner()) = Some(source);
        self.forget_rate();
        Ok(())
    }

    fn input(&self, slot: usize) -> Option<SourceRef> {
        if slot == 0 {
            self.input.lock().unwrap_or_else(|e| e.into_inner()).clone()
        } else {
            None
        }
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

    fn sync(&self) -> GraphResult<()> {
        let input = self.upstream()?;
        input.sync()?;
        self.forget_rate();
        let frames = match self.input_rate(&input)? {
            Some(from) => Self::scaled_frames(input.frames(), from, self.target()),
            None => input.frames(),
        };
        self.cursor.set_frames(frames);
        trace!("FrameRate {} synced to {} frames", self.uuid, frames);
        Ok(())
    }

    fn fetch(&self) -> GraphResult<Option<Frame>> {
        let input = self.upstream()?;
        let position = self.cursor.position();
        let to = self.target();

        let from = match self.input_rate(&input)? {
            Some(from) if !from.same_rate(&to) => from,
            _ => return input.fetch_at(position),
        };

        let first = map_first(position, to, from);
        let Some(reference) = input.fetch_at(first)? else {
            return Ok(None);
        };

        let mut frame = Frame::new(position, to);
        frame.share_image(&reference);
        frame.set_audio(self.conform_audio(&input, position, from, &reference)?);
        Ok(Some(frame))
    }

    fn is_thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::Relaxed)
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        let value32 = i32::try_from(value).ok().filter(|v| *v > 0).ok_or(GraphError::InvalidOption {
            stage: STAGE,
            key: key.to_string(),
            value,
        });
        let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
        match key {
            O_FPS_NUM => target.num = value32?,
            O_FPS_DEN => target.den = value32?,
            _ => {
                return Err(GraphError::UnknownOption {
                    stage: STAGE,
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    fn option(&self, key: &str) -> Option<i64> {
        let target = self.target();
        match key {
            O_FPS_NUM => Some(target.num as i64),
            O_FPS_DEN => Some(target.den as i64),
            _ => None,
        }
    }

    fn option_keys(&self) -> &'static [&'static str] {
        &[O_FPS_NUM, O_FPS_DEN]
    }

    fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let mut copy = FrameRate::new(self.target()).with_cadence(self.cadence);
        copy.serialise_as = self.serialise_as;
        if let Some(Some(input)) = inputs.into_iter().next() {
            copy.connect(input, 0)?;
        }
        Ok(Arc::new(copy))
    }

    fn serialise_as(&self) -> Option<&'static str> {
        self.serialise_as
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::pattern::{Pattern, PatternSpec};

    fn conform(spec: PatternSpec, target: Rational) -> (Arc<Pattern>, FrameRate) {
        let pattern = Arc::new(Pattern::new(spec));
        let stage = FrameRate::new(target);
        stage.connect(pattern.clone(), 0).unwrap();
        stage.sync().unwrap();
        (pattern, stage)
    }

    #[test]
    fn test_same_rate_passes_through() {
        let (_, stage) = conform(PatternSpec::default(), Rational::new(50, 2));
        assert_eq!(stage.frames(), 100);
        let frame = stage.fetch_at(4).unwrap().unwrap();
        assert_eq!(frame.fps(), Rational::new(25, 1));
        assert_eq!(frame.audio().unwrap().samples, 1920);
    }

    #[test]
    fn test_length_scales_with_rate() {
        let (_, stage) = conform(PatternSpec::default(), Rational::new(50, 1));
        assert_eq!(stage.frames(), 200);
        let (_, stage) = conform(
            PatternSpec {
                frames: 10,
                ..PatternSpec::default()
            },
            Rational::new(30000, 1001),
        );
        // 10 frames at 25 fps = 0.4 s = 11.988 frames at 29.97
        assert_eq!(stage.frames(), 12);
    }

    #[test]
    fn test_image_from_first_overlapping_frame() {
        let (_, stage) = conform(PatternSpec::default(), Rational::new(50, 1));
        let a = stage.fetch_at(6).unwrap().unwrap();
        let b = stage.fetch_at(7).unwrap().unwrap();
        assert_eq!(a.position(), 6);
        assert_eq!(a.fps(), Rational::new(50, 1));
        assert_eq!(*a.image().unwrap(), *b.image().unwrap());
        assert_eq!(a.image().unwrap().data[0], (3 * 31) as u8);
    }

    /// Test: Audio continuity across a 25 -> 29.97 conform
    /// Validates: every output sample carries its global sample index
    #[test]
    fn test_audio_is_continuous() {
        let target = Rational::new(30000, 1001);
        let (_, stage) = conform(PatternSpec::default(), target);

        let mut expected = 0.0f32;
        for p in 0..20 {
            let audio = stage.fetch_at(p).unwrap().unwrap().audio().unwrap();
            assert_eq!(audio.samples as i32, samples_for_frame_with(p, 48000, 30000, 1001, Cadence::default()));
            for s in 0..audio.samples {
                assert_eq!(audio.sample(0, s), Some(expected), "frame {} sample {}", p, s);
                assert_eq!(audio.sample(1, s), Some(-expected));
                expected += 1.0;
            }
        }
    }

    #[test]
    fn test_options_and_errors() {
        let stage = FrameRate::new(Rational::new(25, 1));
        assert!(matches!(stage.fetch(), Err(GraphError::NotConnected { .. })));
        stage.set_option(O_FPS_NUM, 30).unwrap();
        assert_eq!(stage.target(), Rational::new(30, 1));
        assert!(stage.set_option(O_FPS_DEN, 0).is_err());
        assert!(stage.set_option("rate", 1).is_err());
    }
}
