//! Placeholder source fed by pushes.
//!
//! Branch graphs handed to Fork and Voodoo use a Nudger where the shared
//! upstream belongs; the fan-out stage swaps it out before the branch runs.
//! Standalone, it behaves as a bounded queue: `push` stores frames by
//! position and `fetch` waits up to `timeout_ms` for the cursor's position.

use log::{debug, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::config::NudgerConfig;
use crate::core::BlockingLru;
use crate::entities::keys::{O_LENGTH, O_QUEUE_SIZE, O_TIMEOUT_MS};
use crate::entities::{Capability, CapabilityKind, Cursor, Frame, FramePush, Source, SourceKind, SourceRef};
use crate::error::{GraphError, GraphResult};

const STAGE: &str = "nudger:";

#[derive(Debug)]
pub struct Nudger {
    uuid: Uuid,
    cursor: Cursor,
    queue: BlockingLru,
    timeout_ms: AtomicU64,
}

impl Nudger {
    pub fn new() -> Self {
        Self::with_config(&NudgerConfig::default())
    }

    pub fn with_config(config: &NudgerConfig) -> Self {
        let cursor = Cursor::new();
        cursor.set_frames(config.length);
        Self {
            uuid: Uuid::new_v4(),
            cursor,
            queue: BlockingLru::new(config.queue_size),
            timeout_ms: AtomicU64::new(config.timeout_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Default for Nudger {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePush for Nudger {
    fn push(&self, frame: Option<Frame>) {
        match frame {
            Some(frame) => {
                trace!("Nudger {} push {}", self.uuid, frame.position());
                self.queue.insert(frame.position(), frame);
            }
            None => {
                debug!("Nudger {} cleared", self.uuid);
                self.queue.clear();
            }
        }
    }
}

impl Source for Nudger {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Nudger
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
        let position = self.cursor.position();
        let frame = self.queue.wait(position, self.timeout());
        if frame.is_none() {
            debug!("Nudger {}: no frame pushed for {} within {:?}", self.uuid, position, self.timeout());
        }
        Ok(frame)
    }

    fn is_thread_safe(&self) -> bool {
        true
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        let invalid = || GraphError::InvalidOption {
            stage: STAGE,
            key: key.to_string(),
            value,
        };
        match key {
            O_QUEUE_SIZE => {
                let size = usize::try_from(value).ok().filter(|s| *s > 0).ok_or_else(invalid)?;
                self.queue.resize(size);
            }
            O_TIMEOUT_MS => {
                let ms = u64::try_from(value).map_err(|_| invalid())?;
                self.timeout_ms.store(ms, Ordering::Relaxed);
            }
            O_LENGTH => {
                let length = i32::try_from(value).ok().filter(|l| *l >= 0).ok_or_else(invalid)?;
                self.cursor.set_frames(length);
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
            O_QUEUE_SIZE => Some(self.queue.capacity() as i64),
            O_TIMEOUT_MS => Some(self.timeout_ms.load(Ordering::Relaxed) as i64),
            O_LENGTH => Some(self.cursor.frames() as i64),
            _ => None,
        }
    }

    fn option_keys(&self) -> &'static [&'static str] {
        &[O_QUEUE_SIZE, O_TIMEOUT_MS, O_LENGTH]
    }

    fn duplicate(&self, _inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let config = NudgerConfig {
            queue_size: self.queue.capacity(),
            timeout_ms: self.timeout_ms.load(Ordering::Relaxed),
            length: self.cursor.frames(),
        };
        Ok(Arc::new(Nudger::with_config(&config)))
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability<'_>> {
        match kind {
            CapabilityKind::Push => Some(Capability::Push(self)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Rational;
    use std::thread;
    use std::time::Instant;

    fn frame(position: i32) -> Frame {
        Frame::new(position, Rational::default())
    }

    /// Test: Nudger timeout
    /// Validates: fetch without push returns None after ~timeout_ms
    #[test]
    fn test_fetch_times_out() {
        let nudger = Nudger::new();
        nudger.set_option(O_TIMEOUT_MS, 50).unwrap();
        nudger.seek(4, false);

        let start = Instant::now();
        assert!(nudger.fetch().unwrap().is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "returned early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "returned late: {:?}", elapsed);
    }

    #[test]
    fn test_push_then_fetch() {
        let nudger = Nudger::new();
        nudger.push(Some(frame(2)));
        nudger.push(Some(frame(3)));
        assert_eq!(nudger.fetch_at(3).unwrap().map(|f| f.position()), Some(3));
        assert_eq!(nudger.fetch_at(2).unwrap().map(|f| f.position()), Some(2));
    }

    #[test]
    fn test_push_wakes_waiter() {
        let nudger = Arc::new(Nudger::new());
        let pusher = Arc::clone(&nudger);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            pusher.push(Some(frame(7)));
        });
        let got = nudger.fetch_at(7).unwrap();
        handle.join().unwrap();
        assert_eq!(got.map(|f| f.position()), Some(7));
    }

    #[test]
    fn test_push_none_clears() {
        let nudger = Nudger::new();
        nudger.set_option(O_TIMEOUT_MS, 1).unwrap();
        nudger.push(Some(frame(0)));
        nudger.push(Some(frame(1)));
        assert_eq!(nudger.queued(), 2);
        nudger.push(None);
        assert_eq!(nudger.queued(), 0);
        assert!(nudger.fetch_at(0).unwrap().is_none());
    }

    #[test]
    fn test_queue_is_bounded() {
        let nudger = Nudger::new();
        nudger.set_option(O_QUEUE_SIZE, 2).unwrap();
        for p in 0..5 {
            nudger.push(Some(frame(p)));
        }
        assert_eq!(nudger.queued(), 2);
        assert!(nudger.set_option(O_QUEUE_SIZE, 0).is_err());
        assert!(nudger.set_option(O_TIMEOUT_MS, -1).is_err());
    }

    #[test]
    fn test_push_capability_and_length() {
        let nudger: SourceRef = Arc::new(Nudger::new());
        assert_eq!(nudger.frames(), i32::MAX);
        nudger.set_option(O_LENGTH, 12).unwrap();
        assert_eq!(nudger.frames(), 12);
        match nudger.capability(CapabilityKind::Push) {
            Some(Capability::Push(push)) => push.push(Some(frame(11))),
            _ => panic!("nudger must accept pushes"),
        }
        assert!(nudger.fetch_at(40).unwrap().is_some());
        assert!(nudger.capability(CapabilityKind::SyncControl).is_none());
    }
}
