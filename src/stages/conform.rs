//! Payload filter: keeps the image and/or the audio of upstream frames.
//!
//! Positioning is delegated to the input, so a Conform over a Lock keeps the
//! Lock's per-thread cursors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::entities::keys::{O_AUDIO, O_IMAGE, flag};
use crate::entities::{Frame, Source, SourceKind, SourceRef};
use crate::error::{GraphError, GraphResult};

const STAGE: &str = "conform";

pub struct Conform {
    uuid: Uuid,
    serialise_as: Option<&'static str>,
    input: Mutex<Option<SourceRef>>,
    image: AtomicBool,
    audio: AtomicBool,
}

impl Conform {
    /// Keeps both payloads
    pub fn new() -> Self {
        Self::keeping(true, true)
    }

    pub fn keeping(image: bool, audio: bool) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            serialise_as: None,
            input: Mutex::new(None),
            image: AtomicBool::new(image),
            audio: AtomicBool::new(audio),
        }
    }

    pub fn with_serialise_as(mut self, tag: &'static str) -> Self {
        self.serialise_as = Some(tag);
        self
    }

    fn upstream(&self) -> Option<SourceRef> {
        self.input.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for Conform {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for Conform {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Conform
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
        *self.input.lock().unwrap_or_else(|e| e.into_inner()) = Some(source);
        Ok(())
    }

    fn input(&self, slot: usize) -> Option<SourceRef> {
        if slot == 0 { self.upstream() } else { None }
    }

    fn seek(&self, position: i32, relative: bool) {
        if let Some(input) = self.upstream() {
            input.seek(position, relative);
        }
    }

    fn position(&self) -> i32 {
        self.upstream().map_or(0, |input| input.position())
    }

    fn frames(&self) -> i32 {
        self.upstream().map_or(0, |input| input.frames())
    }

    fn sync(&self) -> GraphResult<()> {
        match self.upstream() {
            Some(input) => input.sync(),
            None => Ok(()),
        }
    }

    fn fetch(&self) -> GraphResult<Option<Frame>> {
        let input = self.upstream().ok_or(GraphError::NotConnected { stage: STAGE, slot: 0 })?;
        let keep_image = self.image.load(Ordering::Relaxed);
        let keep_audio = self.audio.load(Ordering::Relaxed);
        Ok(input.fetch()?.map(|mut frame| {
            if !keep_image {
                frame.set_image(None);
            }
            if !keep_audio {
                frame.set_audio(None);
            }
            frame
        }))
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        match key {
            O_IMAGE => self.image.store(flag(value), Ordering::Relaxed),
            O_AUDIO => self.audio.store(flag(value), Ordering::Relaxed),
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
        match key {
            O_IMAGE => Some(self.image.load(Ordering::Relaxed) as i64),
            O_AUDIO => Some(self.audio.load(Ordering::Relaxed) as i64),
            _ => None,
        }
    }

    fn option_keys(&self) -> &'static [&'static str] {
        &[O_IMAGE, O_AUDIO]
    }

    fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let mut copy = Conform::keeping(self.image.load(Ordering::Relaxed), self.audio.load(Ordering::Relaxed));
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
