//! Fork stage - one upstream, N branch graphs
//!
//! **Why**: several consumers (encoders, previews) want their own processing
//! chain on top of one decode. Each branch is described as a graph with Nudger
//! placeholders where the shared upstream belongs.
//!
//! # Build
//!
//! On the first sync or fetch after a structural change:
//! 1. slot 0 is wrapped in a Lock (reused when it already is one), dumped as
//!    `nudger:`
//! 2. every branch is rewired so its Nudgers point at that Lock; nested
//!    Fork/Voodoo stages are only followed through their upstream slot
//! 3. a branch whose rate differs from the Lock's gets a frame rate conform
//!
//! The connected branch graphs are never touched; the rewired copies are
//! reachable through [`Fork::branch`].

use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::frame_rate::FrameRate;
use super::lock::Lock;
use super::rewire::{Descend, rewire};
use crate::config::{ForkConfig, LockConfig};
use crate::entities::keys::{O_IMAGE, O_QUEUE_SIZE, O_SLOTS, O_SOLO, flag};
use crate::entities::{Cursor, Frame, Source, SourceKind, SourceRef};
use crate::error::{GraphError, GraphResult};

const STAGE: &str = "fork";

struct Built {
    lock: SourceRef,
    branches: Vec<SourceRef>,
}

pub struct Fork {
    uuid: Uuid,
    cursor: Cursor,
    inputs: Mutex<Vec<Option<SourceRef>>>,
    queue_size: AtomicUsize,
    solo: AtomicUsize,
    image: AtomicBool,
    built: Mutex<Option<Arc<Built>>>,
    changed: AtomicBool,
}

impl Fork {
    pub fn new() -> Self {
        Self::with_config(&ForkConfig::default())
    }

    pub fn with_config(config: &ForkConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            cursor: Cursor::new(),
            inputs: Mutex::new(vec![None; config.slots + 1]),
            queue_size: AtomicUsize::new(config.queue_size.max(1)),
            solo: AtomicUsize::new(0),
            image: AtomicBool::new(config.image),
            built: Mutex::new(None),
            changed: AtomicBool::new(true),
        }
    }

    fn config(&self) -> ForkConfig {
        ForkConfig {
            slots: self.slots(),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            image: self.image.load(Ordering::Relaxed),
        }
    }

    /// Number of branches
    pub fn slots(&self) -> usize {
        self.inputs.lock().unwrap_or_else(|e| e.into_inner()).len() - 1
    }

    /// Shared Lock over slot 0, once built
    pub fn lock(&self) -> Option<SourceRef> {
        self.current().map(|b| Arc::clone(&b.lock))
    }

    /// Rewired graph of branch `slot` (1-based), once built
    pub fn branch(&self, slot: usize) -> Option<SourceRef> {
        let built = self.current()?;
        slot.checked_sub(1).and_then(|i| built.branches.get(i)).cloned()
    }

    fn current(&self) -> Option<Arc<Built>> {
        self.built.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Built graphs, rebuilding after a structural change
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
                self.cursor.set_frames(fresh.lock.frames());
                *built = Some(Arc::clone(&fresh));
                Ok(fresh)
            }
            Err(e) => {
                self.changed.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    fn build(&self) -> GraphResult<Built> {
        let inputs = self.inputs.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let upstream = inputs
            .first()
            .cloned()
            .flatten()
            .ok_or(GraphError::NotConnected { stage: STAGE, slot: 0 })?;

        let lock = if upstream.kind() == SourceKind::Lock {
            upstream
        } else {
            let config = LockConfig {
                queue_size: self.queue_size.load(Ordering::Relaxed),
                image: self.image.load(Ordering::Relaxed),
                ..LockConfig::default()
            };
            Lock::wrap(upstream, &config, Some("nudger:"))?
        };

        let reference = lock.fetch_at(lock.position())?;
        let mut branches = Vec::with_capacity(inputs.len() - 1);
        for (slot, input) in inputs.iter().enumerate().skip(1) {
            let input = input.clone().ok_or(GraphError::NotConnected { stage: STAGE, slot })?;
            let mut branch = rewire(&input, Descend::FanOutFirstSlot, &mut |node| {
                Ok((node.kind() == SourceKind::Nudger).then(|| Arc::clone(&lock)))
            })?;
            branch.sync()?;

            if let Some(reference) = &reference {
                let fps = reference.fps();
                if let Some(frame) = branch.fetch_at(0)? {
                    if !frame.fps().same_rate(&fps) {
                        debug!("Fork {}: branch {} runs at {}, conforming to {}", self.uuid, slot, frame.fps(), fps);
                        let conform = FrameRate::new(fps).with_serialise_as("");
                        conform.connect(branch, 0)?;
                        conform.sync()?;
                        branch = Arc::new(conform);
                    }
                }
            }
            branches.push(branch);
        }

        debug!("Fork {} built {} branches", self.uuid, branches.len());
        Ok(Built { lock, branches })
    }

    fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }
}

impl Default for Fork {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for Fork {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Fork
    }

    fn slot_count(&self) -> usize {
        self.slots() + 1
    }

    fn connect(&self, source: SourceRef, slot: usize) -> GraphResult<()> {
        let mut inputs = self.inputs.lock().unwrap_or_else(|e| e.into_inner());
        let count = inputs.len();
        let entry = inputs.get_mut(slot).ok_or(GraphError::InvalidSlot {
            stage: STAGE,
            slot,
            count,
        })?;
        if slot == 0 {
            self.cursor.set_frames(source.frames());
        }
        *entry = Some(source);
        drop(inputs);
        self.mark_changed();
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
        built.lock.sync()?;
        self.cursor.set_frames(built.lock.frames());
        for branch in &built.branches {
            branch.sync()?;
        }
        trace!("Fork {} synced to {} frames", self.uuid, self.cursor.frames());
        Ok(())
    }

    fn fetch(&self) -> GraphResult<Option<Frame>> {
        let built = self.refresh()?;
        let position = self.cursor.position();
        let solo = self.solo.load(Ordering::Relaxed);

        if solo == 0 {
            let frame = built.lock.fetch_at(position)?;
            for branch in &built.branches {
                branch.fetch_at(position)?;
            }
            return Ok(frame);
        }

        for branch in &built.branches {
            branch.seek(position, false);
        }
        match built.branches.get(solo - 1) {
            Some(branch) => branch.fetch(),
            None => Ok(None),
        }
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        let invalid = || GraphError::InvalidOption {
            stage: STAGE,
            key: key.to_string(),
            value,
        };
        match key {
            O_SLOTS => {
                let slots = usize::try_from(value).ok().filter(|s| *s >= 1).ok_or_else(invalid)?;
                self.inputs.lock().unwrap_or_else(|e| e.into_inner()).resize(slots + 1, None);
                if self.solo.load(Ordering::Relaxed) > slots {
                    self.solo.store(0, Ordering::Relaxed);
                }
                self.mark_changed();
            }
            O_QUEUE_SIZE => {
                let size = usize::try_from(value).ok().filter(|s| *s >= 1).ok_or_else(invalid)?;
                self.queue_size.store(size, Ordering::Relaxed);
                if let Some(lock) = self.lock() {
                    lock.set_option(O_QUEUE_SIZE, value)?;
                }
            }
            O_SOLO => {
                let solo = usize::try_from(value).ok().filter(|s| *s <= self.slots()).ok_or_else(invalid)?;
                self.solo.store(solo, Ordering::Relaxed);
            }
            O_IMAGE => {
                self.image.store(flag(value), Ordering::Relaxed);
                self.mark_changed();
            }
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
            O_SLOTS => Some(self.slots() as i64),
            O_QUEUE_SIZE => Some(self.queue_size.load(Ordering::Relaxed) as i64),
            O_SOLO => Some(self.solo.load(Ordering::Relaxed) as i64),
            O_IMAGE => Some(self.image.load(Ordering::Relaxed) as i64),
            _ => None,
        }
    }

    fn option_keys(&self) -> &'static [&'static str] {
        &[O_SLOTS, O_QUEUE_SIZE, O_SOLO, O_IMAGE]
    }

    fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let copy = Fork::with_config(&self.config());
        copy.solo.store(self.solo.load(Ordering::Relaxed), Ordering::Relaxed);
        for (slot, input) in inputs.into_iter().enumerate() {
            if let Some(input) = input {
                copy.connect(input, slot)?;
            }
        }
        Ok(Arc::new(copy))
    }
}
