//! Two-input muxer: image from slot 0, audio from slot 1.

use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::entities::keys::{O_USE_LONGEST, flag};
use crate::entities::{Cursor, Frame, Source, SourceKind, SourceRef};
use crate::error::{GraphError, GraphResult};

const STAGE: &str = "muxer";

pub struct Muxer {
    uuid: Uuid,
    cursor: Cursor,
    inputs: Mutex<[Option<SourceRef>; 2]>,
    use_longest: AtomicBool,
}

impl Muxer {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            cursor: Cursor::new(),
            inputs: Mutex::new([None, None]),
            use_longest: AtomicBool::new(false),
        }
    }

    fn slots(&self) -> [Option<SourceRef>; 2] {
        self.inputs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn length(&self) -> i32 {
        let [video, audio] = self.slots();
        let lengths = [video, audio].into_iter().flatten().map(|s| s.frames());
        if self.use_longest.load(Ordering::Relaxed) {
            lengths.max().unwrap_or(0)
        } else {
            lengths.min().unwrap_or(0)
        }
    }

    /// Frame of `input` at `position`, or `None` past its end
    fn pull(input: &Option<SourceRef>, position: i32) -> GraphResult<Option<Frame>> {
        match input {
            Some(input) if position < input.frames() => input.fetch_at(position),
            _ => Ok(None),
        }
    }
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for Muxer {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Muxer
    }

    fn slot_count(&self) -> usize {
        2
    }

    fn connect(&self, source: SourceRef, slot: usize) -> GraphResult<()> {
        let mut inputs = self.inputs.lock().unwrap_or_else(|e| e.into_inner());
        match inputs.get_mut(slot) {
            Some(entry) => *entry = Some(source),
            None => {
                return Err(GraphError::InvalidSlot {
                    stage: STAGE,
                    slot,
                    count: 2,
                });
            }
        }
        drop(inputs);
        self.cursor.set_frames(self.length());
        Ok(())
    }

    fn input(&self, slot: usize) -> Option<SourceRef> {
        self.slots().get(slot).cloned().flatten()
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
        for input in self.slots().into_iter().flatten() {
            input.sync()?;
        }
        self.cursor.set_frames(self.length());
        trace!("Muxer {} synced to {} frames", self.uuid, self.cursor.frames());
        Ok(())
    }

    fn fetch(&self) -> GraphResult<Option<Frame>> {
        let [video, audio] = self.slots();
        if video.is_none() {
            return Err(GraphError::NotConnected { stage: STAGE, slot: 0 });
        }
        if audio.is_none() {
            return Err(GraphError::NotConnected { stage: STAGE, slot: 1 });
        }
        let position = self.cursor.position();
        let picture = Self::pull(&video, position)?;
        let sound = Self::pull(&audio, position)?;

        let mut frame = match (&picture, &sound) {
            (Some(p), _) => p.clone(),
            (None, Some(s)) => Frame::new(position, s.fps()),
            (None, None) => return Ok(None),
        };
        frame.set_position(position);
        match &sound {
            Some(s) => frame.share_audio(s),
            None => frame.set_audio(None),
        }
        if picture.is_none() {
            frame.set_image(None);
        }
        Ok(Some(frame))
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        match key {
            O_USE_LONGEST => {
                self.use_longest.store(flag(value), Ordering::Relaxed);
                self.cursor.set_frames(self.length());
                Ok(())
            }
            _ => Err(GraphError::UnknownOption {
                stage: STAGE,
                key: key.to_string(),
            }),
        }
    }

    fn option(&self, key: &str) -> Option<i64> {
        (key == O_USE_LONGEST).then(|| self.use_longest.load(Ordering::Relaxed) as i64)
    }

    fn option_keys(&self) -> &'static [&'static str] {
        &[O_USE_LONGEST]
    }

    fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let copy = Muxer::new();
        copy.use_longest.store(self.use_longest.load(Ordering::Relaxed), Ordering::Relaxed);
        for (slot, input) in inputs.into_iter().enumerate() {
            if let Some(input) = input {
                copy.connect(input, slot)?;
            }
        }
        Ok(Arc::new(copy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Rational;
    use crate::stages::pattern::{Pattern, PatternSpec};

    fn muxer(video_frames: i32, audio_frames: i32) -> Muxer {
        let video = Pattern::new(PatternSpec {
            frames: video_frames,
            frequency: 0,
            ..PatternSpec::default()
        });
        let audio = Pattern::new(PatternSpec {
            frames: audio_frames,
            width: 0,
            ..PatternSpec::default()
        });
        let muxer = Muxer::new();
        muxer.connect(Arc::new(video), 0).unwrap();
        muxer.connect(Arc::new(audio), 1).unwrap();
        muxer
    }

    #[test]
    fn test_combines_image_and_audio() {
        let muxer = muxer(10, 20);
        assert_eq!(muxer.frames(), 10);
        let frame = muxer.fetch_at(3).unwrap().unwrap();
        assert_eq!(frame.position(), 3);
        assert!(frame.has_image());
        assert_eq!(frame.audio().unwrap().samples, 1920);
        assert_eq!(frame.fps(), Rational::new(25, 1));
    }

    #[test]
    fn test_use_longest() {
        let muxer = muxer(10, 20);
        muxer.set_option(O_USE_LONGEST, 1).unwrap();
        assert_eq!(muxer.frames(), 20);
        let frame = muxer.fetch_at(15).unwrap().unwrap();
        assert!(!frame.has_image());
        assert!(frame.audio().is_some());
    }

    #[test]
    fn test_missing_input() {
        let muxer = Muxer::new();
        assert!(matches!(muxer.fetch(), Err(GraphError::NotConnected { slot: 0, .. })));
        assert!(muxer.connect(Arc::new(Pattern::new(PatternSpec::default())), 2).is_err());
    }
}
