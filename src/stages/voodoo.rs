//! Voodoo stage - re-synchronised video and audio sub-graphs.
//!
//! Slot 0 is the shared upstream, slot 1 a video-only branch and slot 2 an
//! audio-only branch. Both branches are rewired onto a Lock over slot 0: their
//! Nudgers become image-only or audio-only Conforms. When the branches run at
//! different rates the audio branch is conformed to the video rate, and a
//! Muxer recombines them. Every fetch and sync goes through that Muxer.

use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::conform::Conform;
use super::frame_rate::FrameRate;
use super::lock::Lock;
use super::muxer::Muxer;
use super::rewire::{Descend, rewire};
use crate::config::{LockConfig, VoodooConfig};
use crate::entities::keys::O_QUEUE_SIZE;
use crate::entities::{Cursor, Frame, Source, SourceKind, SourceRef};
use crate::error::{GraphError, GraphResult};

const STAGE: &str = "voodoo";

struct Built {
    lock: SourceRef,
    video: SourceRef,
    audio: SourceRef,
    muxer: SourceRef,
}

pub struct Voodoo {
    uuid: Uuid,
    cursor: Cursor,
    inputs: Mutex<[Option<SourceRef>; 3]>,
    queue_size: AtomicUsize,
    built: Mutex<Option<Arc<Built>>>,
    changed: AtomicBool,
}

impl Voodoo {
    pub fn new() -> Self {
        Self::with_config(&VoodooConfig::default())
    }

    pub fn with_config(config: &VoodooConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            cursor: Cursor::new(),
            inputs: Mutex::new([None, None, None]),
            queue_size: AtomicUsize::new(config.queue_size.max(1)),
            built: Mutex::new(None),
            changed: AtomicBool::new(true),
        }
    }

    fn current(&self) -> Option<Arc<Built>> {
        self.built.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn lock(&self) -> Option<SourceRef> {
        self.current().map(|b| Arc::clone(&b.lock))
    }

    /// Rewired video branch
    pub fn video(&self) -> Option<SourceRef> {
        self.current().map(|b| Arc::clone(&b.video))
    }

    /// Rewired audio branch, conformed to the video rate when needed
    pub fn audio(&self) -> Option<SourceRef> {
        self.current().map(|b| Arc::clone(&b.audio))
    }

    pub fn muxer(&self) -> Option<SourceRef> {
        self.current().map(|b| Arc::clone(&b.muxer))
    }

    fn refresh(&self) -> GraphResult<Arc<Built>> {
        let mut built = self.built.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = built.as_ref() {
            if !self.changed.load(Ordering::Acquire) {
                return Ok(Arc::clone(current));
            }
        }
        self.changed.store(false, Ordering::Release);
        match self.build() {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                self.cursor.set_frames(fresh.muxer.frames());
                *built = Some(Arc::clone(&fresh));
                Ok(fresh)
            }
            Err(e) => {
                self.changed.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    fn branch(&self, input: &SourceRef, lock: &SourceRef, image: bool) -> GraphResult<SourceRef> {
        let branch = rewire(input, Descend::All, &mut |node| {
            if node.kind() != SourceKind::Nudger {
                return Ok(None);
            }
            let conform = Conform::keeping(image, !image).with_serialise_as("nudger:");
            conform.connect(Arc::clone(lock), 0)?;
            Ok(Some(Arc::new(conform) as SourceRef))
        })?;
        branch.sync()?;
        Ok(branch)
    }

    fn build(&self) -> GraphResult<Built> {
        let [upstream, video, audio] = self.inputs.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let upstream = upstream.ok_or(GraphError::NotConnected { stage: STAGE, slot: 0 })?;
        let video = video.ok_or(GraphError::NotConnected { stage: STAGE, slot: 1 })?;
        let audio = audio.ok_or(GraphError::NotConnected { stage: STAGE, slot: 2 })?;

        let lock = if upstream.kind() == SourceKind::Lock {
            upstream
        } else {
            let config = LockConfig {
                queue_size: self.queue_size.load(Ordering::Relaxed),
                ..LockConfig::default()
            };
            Lock::wrap(upstream, &config, Some(""))?
        };

        let video = self.branch(&video, &lock, true)?;
        let mut audio = self.branch(&audio, &lock, false)?;

        let position = self.cursor.position();
        let picture = video.fetch_at(position)?.ok_or(GraphError::NoFrame { stage: STAGE, position })?;
        let sound = audio.fetch_at(position)?.ok_or(GraphError::NoFrame { stage: STAGE, position })?;

        if !picture.fps().same_rate(&sound.fps()) {
            debug!("Voodoo {}: audio at {} conformed to video at {}", self.uuid, sound.fps(), picture.fps());
            let conform = FrameRate::new(picture.fps()).with_serialise_as("");
            conform.connect(audio, 0)?;
            conform.sync()?;
            audio = Arc::new(conform);
        }

        let muxer = Muxer::new();
        muxer.connect(Arc::clone(&video), 0)?;
        muxer.connect(Arc::clone(&audio), 1)?;
        muxer.sync()?;
        debug!("Voodoo {} built ({} frames)", self.uuid, muxer.frames());

        Ok(Built {
            lock,
            video,
            audio,
            muxer: Arc::new(muxer),
        })
    }
}

impl Default for Voodoo {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for Voodoo {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Voodoo
    }

    fn slot_count(&self) -> usize {
        3
    }

    fn connect(&self, source: SourceRef, slot: usize) -> GraphResult<()> {
        let mut inputs = self.inputs.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inputs.get_mut(slot).ok_or(GraphError::InvalidSlot {
            stage: STAGE,
            slot,
            count: 3,
        })?;
        if slot == 0 {
            self.cursor.set_frames(source.frames());
        }
        *entry = Some(source);
        self.changed.store(true, Ordering::Release);
        Ok(())
    }

    fn input(&self, slot: usize) -> Option<SourceRef> {
        self.inputs.lock().unwrap_or_else(|e| e.into_inner()).get(slot).cloned().flatten()
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
        let built = self.refresh()?;
        built.muxer.sync()?;
        self.cursor.set_frames(built.muxer.frames());
        Ok(())
    }

    fn fetch(&self) -> GraphResult<Option<Frame>> {
        let built = self.refresh()?;
        built.muxer.fetch_at(self.cursor.position())
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        match key {
            O_QUEUE_SIZE => {
                let size = usize::try_from(value).ok().filter(|s| *s >= 1).ok_or(GraphError::InvalidOption {
                    stage: STAGE,
                    key: key.to_string(),
                    value,
                })?;
                self.queue_size.store(size, Ordering::Relaxed);
                if let Some(lock) = self.lock() {
                    lock.set_option(O_QUEUE_SIZE, value)?;
                }
                Ok(())
            }
            _ => Err(GraphError::UnknownOption {
                stage: STAGE,
                key: key.to_string(),
            }),
        }
    }

    fn option(&self, key: &str) -> Option<i64> {
        (key == O_QUEUE_SIZE).then(|| self.queue_size.load(Ordering::Relaxed) as i64)
    }

    fn option_keys(&self) -> &'static [&'static str] {
        &[O_QUEUE_SIZE]
    }

    fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let copy = Voodoo::with_config(&VoodooConfig {
            queue_size: self.queue_size.load(Ordering::Relaxed),
        });
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
    use crate::stages::nudger::Nudger;
    use crate::stages::pattern::{Pattern, PatternSpec, pattern_image};

    fn voodoo(upstream: PatternSpec, audio: SourceRef) -> Voodoo {
        let voodoo = Voodoo::new();
        voodoo.connect(Arc::new(Pattern::new(upstream)), 0).unwrap();
        voodoo.connect(Arc::new(Nudger::new()), 1).unwrap();
        voodoo.connect(audio, 2).unwrap();
        voodoo
    }

    #[test]
    fn test_branches_are_split_and_muxed() {
        let voodoo = voodoo(PatternSpec::default(), Arc::new(Nudger::new()));
        voodoo.sync().unwrap();
        assert_eq!(voodoo.frames(), 100);

        let video = voodoo.video().unwrap();
        assert_eq!(video.kind(), SourceKind::Conform);
        assert_eq!(video.serialise_as(), Some("nudger:"));
        assert_eq!(voodoo.lock().unwrap().serialise_as(), Some(""));

        let frame = voodoo.fetch_at(4).unwrap().unwrap();
        assert_eq!(*frame.image().unwrap(), pattern_image(4, 8, 4));
        assert_eq!(frame.audio().unwrap().sample(0, 0), Some((4 * 1920) as f32));
    }

    /// Test: Voodoo rate conform + mux
    /// Validates: a 50 fps audio branch is conformed back to the 25 fps video
    #[test]
    fn test_audio_conformed_to_video_rate() {
        let fast = FrameRate::new(Rational::new(50, 1));
        fast.connect(Arc::new(Nudger::new()), 0).unwrap();
        let voodoo = voodoo(PatternSpec::default(), Arc::new(fast));
        voodoo.sync().unwrap();

        let audio = voodoo.audio().unwrap();
        assert_eq!(audio.kind(), SourceKind::FrameRate);
        assert_eq!(audio.serialise_as(), Some(""));
        assert_eq!(voodoo.frames(), 100);

        let frame = voodoo.fetch_at(7).unwrap().unwrap();
        assert_eq!(frame.fps(), Rational::new(25, 1));
        let sound = frame.audio().unwrap();
        assert_eq!(sound.samples, 1920);
        assert_eq!(sound.sample(0, 0), Some((7 * 1920) as f32));
        assert_eq!(sound.sample(0, 1919), Some((8 * 1920 - 1) as f32));
        assert!(frame.has_image());
    }

    #[test]
    fn test_missing_frame_fails_build() {
        let empty = PatternSpec {
            frames: 0,
            ..PatternSpec::default()
        };
        let voodoo = voodoo(empty, Arc::new(Nudger::new()));
        assert!(matches!(voodoo.sync(), Err(GraphError::NoFrame { stage: "voodoo", .. })));
    }

    #[test]
    fn test_missing_slot() {
        let voodoo = Voodoo::new();
        voodoo.connect(Arc::new(Pattern::new(PatternSpec::default())), 0).unwrap();
        voodoo.connect(Arc::new(Nudger::new()), 1).unwrap();
        assert!(matches!(voodoo.fetch(), Err(GraphError::NotConnected { slot: 2, .. })));
        assert!(voodoo.connect(Arc::new(Nudger::new()), 3).is_err());
    }
}
