//! Scheduler - speculative decode ahead of playback
//!
//! **Why**: a single decode chain cannot keep up with playback when each frame
//! is expensive. The scheduler runs copies of its upstream graph on a worker
//! pool and decodes a window of positions ahead of the caller.
//!
//! # Modes
//!
//! Decided on the first fetch after a configuration change:
//! - **Threaded**: the upstream graph becomes a *template* in which every
//!   terminal (leaf, Fork, Voodoo, nested Scheduler) sits behind a shared Lock.
//!   Each worker decodes on its own clone of the template; clones share the
//!   Locks and duplicate everything else.
//! - **Direct**: `active = 0`, `threads = 0`, a thread-unsafe or
//!   non-duplicable upstream. Frames are pulled on the caller thread and kept
//!   in a registry scope named `distributor:<uuid>`.
//!
//! # Window
//!
//! ```text
//!  requested ──► [p][p+d][p+2d] ... [p+(2N-1)d]     N = worker count
//!                 │   in flight or available
//!                 └── served, pruned, window topped up from `next`
//! ```
//!
//! A position that breaks the expected sequence re-seeds the window: the pool
//! epoch is bumped (queued jobs are skipped, running ones are dropped on
//! arrival), the direction is recomputed and 2N jobs are dispatched from the
//! requested position.

use log::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::rewire::{clone_graph, find_nearest, wrap_terminals};
use crate::config::SchedulerConfig;
use crate::core::{CacheRegistry, ScopeCache, Workers};
use crate::entities::keys::{O_ACTIVE, O_AUDIO_DIRECTION, O_QUEUE_SIZE, O_THREADS, O_TIMEOUT_MS, O_TRIGGER, flag};
use crate::entities::{Capability, CapabilityKind, Cursor, Frame, Source, SourceKind, SourceRef, Trigger};
use crate::error::{GraphError, GraphResult, RegistryError};

const STAGE: &str = "distributor";

/// Worker count for `threads = -1`
fn auto_threads() -> usize {
    (num_cpus::get() * 3 / 4).max(1)
}

/// Graph clone and the template generation it was last synced to
struct Checkout {
    graph: SourceRef,
    generation: u64,
}

/// Template plus idle worker clones
struct GraphPool {
    template: SourceRef,
    idle: Mutex<Vec<Checkout>>,
    generation: AtomicU64,
}

impl GraphPool {
    fn new(template: SourceRef) -> Self {
        Self {
            template,
            idle: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn spawn(&self) -> GraphResult<Checkout> {
        let graph = clone_graph(&self.template)?;
        graph.sync()?;
        Ok(Checkout {
            graph,
            generation: self.generation.load(Ordering::Acquire),
        })
    }

    /// Idle clone (or a new one), synced to the current generation
    fn checkout(&self) -> GraphResult<Checkout> {
        let parked = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let mut checkout = match parked {
            Some(checkout) => checkout,
            None => self.spawn()?,
        };
        let generation = self.generation.load(Ordering::Acquire);
        if checkout.generation != generation {
            checkout.graph.sync()?;
            checkout.generation = generation;
        }
        Ok(checkout)
    }

    fn checkin(&self, checkout: Checkout) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(checkout);
    }

    /// Decode `position` on a clone; failures are logged and become `None`
    fn decode(&self, position: i32, trigger: Trigger) -> Option<Frame> {
        let checkout = match self.checkout() {
            Ok(checkout) => checkout,
            Err(e) => {
                warn!("Scheduler: no graph for {}: {}", position, e);
                return None;
            }
        };
        let result = checkout.graph.fetch_at(position);
        self.checkin(checkout);
        match result {
            Ok(frame) => {
                if let Some(frame) = &frame {
                    frame.realise(trigger);
                }
                frame
            }
            Err(e) => {
                warn!("Scheduler: decode of {} failed: {}", position, e);
                None
            }
        }
    }

    /// Sync the template with propagating Locks, then freeze them and sync the clones
    fn resync(&self) -> GraphResult<()> {
        let locks = find_nearest(&self.template, SourceKind::Lock);
        let set_propagate = |enabled: bool| {
            for lock in &locks {
                if let Some(Capability::SyncControl(control)) = lock.capability(CapabilityKind::SyncControl) {
                    control.set_sync_propagate(enabled);
                }
            }
        };
        set_propagate(true);
        let synced = self.template.sync();
        set_propagate(false);
        synced?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        for checkout in idle.iter_mut() {
            checkout.graph.sync()?;
            checkout.generation = generation;
        }
        trace!("Scheduler graphs resynced (generation {}, {} idle)", generation, idle.len());
        Ok(())
    }
}

/// Worker pool and the graphs its jobs run on
struct Engine {
    pool: Workers,
    graphs: Arc<GraphPool>,
    threads: usize,
}

#[derive(Clone)]
enum Mode {
    Pending,
    Direct(Arc<ScopeCache>),
    Threaded(Arc<Engine>),
}

#[derive(Default)]
struct Window {
    available: HashMap<i32, Option<Frame>>,
    in_flight: HashSet<i32>,
    next: i32,
    direction: i32,
    expected: Option<i32>,
    previous: Option<i32>,
    epoch: u64,
}

impl Window {
    fn pending(&self, position: i32) -> bool {
        self.available.contains_key(&position) || self.in_flight.contains(&position)
    }

    fn reset(&mut self, epoch: u64) {
        self.available.clear();
        self.in_flight.clear();
        self.expected = None;
        self.previous = None;
        self.epoch = epoch;
    }

    /// Whether `position` follows the running window without a re-seed
    fn continues(&self, position: i32) -> bool {
        match self.expected {
            Some(expected) if expected == position => true,
            Some(expected) => self.pending(position) && (position - expected) * self.direction >= 0,
            None => self.pending(position),
        }
    }

    /// Forget everything at or behind `position` in the play direction
    fn prune_behind(&mut self, position: i32) {
        let direction = self.direction;
        self.available.retain(|p, _| (p - position) * direction > 0);
        self.in_flight.retain(|p| (p - position) * direction > 0);
    }

    /// Direction implied by a request at `position`; a repeat keeps it
    fn direction_for(&self, position: i32) -> i32 {
        match (self.previous, self.expected) {
            (Some(previous), _) if previous == position => self.direction,
            (_, Some(expected)) if position < expected => -1,
            _ => 1,
        }
    }
}

struct Shared {
    window: Mutex<Window>,
    ready: Condvar,
}

impl Shared {
    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Speculative decode stage
pub struct Scheduler {
    uuid: Uuid,
    registry: Arc<CacheRegistry>,
    scope: String,
    cursor: Cursor,
    upstream: Mutex<Option<SourceRef>>,
    config: Mutex<SchedulerConfig>,
    mode: Mutex<Mode>,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self::with_config(registry, &SchedulerConfig::default())
    }

    pub fn with_config(registry: Arc<CacheRegistry>, config: &SchedulerConfig) -> Self {
        let uuid = Uuid::new_v4();
        Self {
            uuid,
            registry,
            scope: format!("distributor:{}", uuid),
            cursor: Cursor::new(),
            upstream: Mutex::new(None),
            config: Mutex::new(*config),
            mode: Mutex::new(Mode::Pending),
            shared: Arc::new(Shared {
                window: Mutex::new(Window {
                    direction: 1,
                    ..Window::default()
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Registry scope used in direct mode
    pub fn scope_name(&self) -> &str {
        &self.scope
    }

    /// Playback direction last detected (+1 or -1)
    pub fn direction(&self) -> i32 {
        self.shared.window().direction
    }

    /// Positions dispatched or decoded but not yet served, sorted
    pub fn window_positions(&self) -> Vec<i32> {
        let window = self.shared.window();
        let mut positions: Vec<i32> = window.in_flight.iter().chain(window.available.keys()).copied().collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    /// True once the worker pool runs
    pub fn is_threaded(&self) -> bool {
        matches!(*self.mode.lock().unwrap_or_else(|e| e.into_inner()), Mode::Threaded(_))
    }

    fn config(&self) -> SchedulerConfig {
        *self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn upstream(&self) -> GraphResult<SourceRef> {
        self.upstream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(GraphError::NotConnected { stage: STAGE, slot: 0 })
    }

    /// Forget the current mode; the next fetch decides again
    fn reset_mode(&self) {
        let previous = std::mem::replace(&mut *self.mode.lock().unwrap_or_else(|e| e.into_inner()), Mode::Pending);
        let mut window = self.shared.window();
        let epoch = window.epoch + 1;
        window.reset(epoch);
        drop(window);
        if let Mode::Threaded(engine) = previous {
            engine.pool.bump_epoch();
            debug!("Scheduler {} stopping {} workers", self.uuid, engine.threads);
        }
    }

    fn mode(&self) -> GraphResult<Mode> {
        let mut mode = self.mode.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*mode, Mode::Pending) {
            *mode = self.decide()?;
        }
        Ok(mode.clone())
    }

    fn decide(&self) -> GraphResult<Mode> {
        let upstream = self.upstream()?;
        let config = self.config();
        let threads = match config.threads {
            t if t < 0 => auto_threads(),
            t => t as usize,
        };

        if !config.active || threads == 0 {
            debug!("Scheduler {}: pass-through (active={}, threads={})", self.uuid, config.active, threads);
            return self.direct();
        }
        if !upstream.is_thread_safe() {
            info!("Scheduler {}: upstream is not thread safe, pass-through", self.uuid);
            return self.direct();
        }

        match self.engine(&upstream, threads) {
            Ok(Some(engine)) => {
                info!("Scheduler {}: {} workers", self.uuid, engine.threads);
                self.cursor.set_frames(engine.graphs.template.frames());
                Ok(Mode::Threaded(Arc::new(engine)))
            }
            Ok(None) => self.direct(),
            Err(GraphError::NotDuplicable { stage }) => {
                info!("Scheduler {}: '{}' cannot be duplicated, pass-through", self.uuid, stage);
                self.direct()
            }
            Err(e) => Err(e),
        }
    }

    fn direct(&self) -> GraphResult<Mode> {
        let scope = match self.registry.create(&self.scope) {
            Ok(scope) => scope,
            Err(RegistryError::ScopeExists(_)) => self.registry.lookup(&self.scope)?,
            Err(e) => return Err(e.into()),
        };
        scope.resize(self.config().queue_size);
        Ok(Mode::Direct(scope))
    }

    fn engine(&self, upstream: &SourceRef, threads: usize) -> GraphResult<Option<Engine>> {
        let template = wrap_terminals(upstream)?;
        let graphs = Arc::new(GraphPool::new(template));
        for _ in 0..threads {
            let checkout = graphs.spawn()?;
            graphs.checkin(checkout);
        }
        graphs.resync()?;

        let epoch = self.shared.window().epoch;
        let pool = Workers::new(threads, Arc::new(AtomicU64::new(epoch)));
        if pool.thread_count() == 0 {
            warn!("Scheduler {}: no worker could be started", self.uuid);
            return Ok(None);
        }
        let threads = pool.thread_count();
        Ok(Some(Engine { pool, graphs, threads }))
    }

    /// Queue a decode of `position` for the current window epoch
    fn dispatch(&self, engine: &Engine, window: &mut Window, position: i32, trigger: Trigger) {
        window.in_flight.insert(position);
        let graphs = Arc::clone(&engine.graphs);
        let shared = Arc::clone(&self.shared);
        let epoch = window.epoch;
        trace!("Scheduler {} dispatch {} (epoch {})", self.uuid, position, epoch);

        engine.pool.execute_with_epoch(epoch, move || {
            let frame = graphs.decode(position, trigger);
            let mut window = shared.window();
            if window.epoch != epoch {
                trace!("Scheduler: dropping stale result {} (epoch {})", position, epoch);
                return;
            }
            window.in_flight.remove(&position);
            window.available.insert(position, frame);
            shared.ready.notify_all();
        });
    }

    fn fetch_threaded(&self, engine: &Engine, position: i32) -> GraphResult<(Option<Frame>, i32)> {
        let config = self.config();
        let trigger = Trigger::from_bits(config.trigger);
        let size = 2 * engine.threads;
        let frames = self.cursor.frames();
        let in_bounds = |p: i32| p >= 0 && p < frames;

        let mut window = self.shared.window();
        if !window.continues(position) {
            let direction = window.direction_for(position);
            let epoch = engine.pool.bump_epoch();
            window.reset(epoch);
            window.direction = direction;
            window.next = position;
            debug!("Scheduler {} re-seed at {} (direction {:+})", self.uuid, position, direction);
            for _ in 0..size {
                let p = window.next;
                if !in_bounds(p) {
                    break;
                }
                self.dispatch(engine, &mut window, p, trigger);
                window.next += direction;
            }
        }
        let direction = window.direction;
        if !window.pending(position) {
            self.dispatch(engine, &mut window, position, trigger);
        }
        if (window.next - position) * direction <= 0 {
            window.next = position + direction;
        }

        let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);
        let served = loop {
            if let Some(frame) = window.available.remove(&position) {
                break Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            window = self
                .shared
                .ready
                .wait_timeout(window, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        };

        window.previous = Some(position);
        window.expected = Some(position + direction);
        window.prune_behind(position);

        let mut budget = engine.pool.idle();
        while budget > 0 && window.in_flight.len() + window.available.len() < size {
            let p = window.next;
            if !in_bounds(p) {
                break;
            }
            window.next += direction;
            if window.pending(p) {
                continue;
            }
            self.dispatch(engine, &mut window, p, trigger);
            budget -= 1;
        }
        drop(window);

        let frame = match served {
            Some(frame) => frame,
            None => {
                warn!(
                    "Scheduler {}: frame {} not ready after {} ms, decoding on the caller",
                    self.uuid, position, config.timeout_ms
                );
                engine.graphs.decode(position, trigger)
            }
        };
        Ok((frame, direction))
    }

    fn fetch_direct(&self, scope: &ScopeCache, position: i32) -> GraphResult<(Option<Frame>, i32)> {
        let config = self.config();
        let direction = {
            let mut window = self.shared.window();
            let direction = if window.expected == Some(position) {
                window.direction
            } else {
                window.direction_for(position)
            };
            if direction != window.direction {
                trace!("Scheduler {}: direction change, clearing '{}'", self.uuid, scope.name());
                scope.clear();
            }
            window.direction = direction;
            window.previous = Some(position);
            window.expected = Some(position + direction);
            direction
        };

        scope.resize(config.queue_size);
        if let Some(frame) = scope.frame(position) {
            return Ok((Some(frame), direction));
        }
        let frame = self.upstream()?.fetch_at(position)?;
        if let Some(frame) = &frame {
            frame.realise(Trigger::from_bits(config.trigger));
            scope.insert_frame(position, frame.clone());
        }
        Ok((frame, direction))
    }

    /// Reverse the audio of frames served while playing backwards
    fn orient_audio(&self, mut frame: Frame, direction: i32) -> Frame {
        if !self.config().audio_direction {
            return frame;
        }
        let backwards = direction < 0;
        if frame.audio_reversed().unwrap_or(false) != backwards {
            if let Some(audio) = frame.audio() {
                frame.set_audio(Some(audio.reversed()));
            }
        }
        frame.set_audio_reversed(backwards);
        frame
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.registry.remove(&self.scope).is_ok() {
            trace!("Scheduler {} released '{}'", self.uuid, self.scope);
        }
    }
}

impl Source for Scheduler {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Scheduler
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
        self.cursor.set_frames(source.frames());
        *self.upstream.lock().unwrap_or_else(|e| e.into_inner()) = Some(source);
        self.reset_mode();
        Ok(())
    }

    fn input(&self, slot: usize) -> Option<SourceRef> {
        if slot == 0 {
            self.upstream.lock().unwrap_or_else(|e| e.into_inner()).clone()
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
        let mode = self.mode.lock().unwrap_or_else(|e| e.into_inner()).clone();
        {
            let mut window = self.shared.window();
            let epoch = match &mode {
                Mode::Threaded(engine) => engine.pool.bump_epoch(),
                _ => window.epoch + 1,
            };
            window.reset(epoch);
        }
        let frames = match &mode {
            Mode::Threaded(engine) => {
                engine.graphs.resync()?;
                engine.graphs.template.frames()
            }
            _ => {
                let upstream = self.upstream()?;
                upstream.sync()?;
                upstream.frames()
            }
        };
        self.cursor.set_frames(frames);
        debug!("Scheduler {} synced to {} frames", self.uuid, frames);
        Ok(())
    }

    fn fetch(&self) -> GraphResult<Option<Frame>> {
        let mode = self.mode()?;
        if self.cursor.frames() <= 0 {
            return Ok(None);
        }
        let position = self.cursor.position();
        let (frame, direction) = match &mode {
            Mode::Threaded(engine) => self.fetch_threaded(engine, position)?,
            Mode::Direct(scope) => self.fetch_direct(scope, position)?,
            Mode::Pending => (None, 1),
        };
        Ok(frame.map(|f| self.orient_audio(f, direction)))
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        let invalid = || GraphError::InvalidOption {
            stage: STAGE,
            key: key.to_string(),
            value,
        };
        let mut reset = false;
        {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            match key {
                O_THREADS => {
                    if value < -1 {
                        return Err(invalid());
                    }
                    config.threads = value;
                    reset = true;
                }
                O_QUEUE_SIZE => {
                    config.queue_size = usize::try_from(value).ok().filter(|s| *s >= 1).ok_or_else(invalid)?;
                }
                O_TIMEOUT_MS => config.timeout_ms = u64::try_from(value).map_err(|_| invalid())?,
                O_TRIGGER => {
                    if !(0..=7).contains(&value) {
                        return Err(invalid());
                    }
                    config.trigger = value;
                }
                O_AUDIO_DIRECTION => config.audio_direction = flag(value),
                O_ACTIVE => {
                    config.active = flag(value);
                    reset = true;
                }
                _ => {
                    return Err(GraphError::UnknownOption {
                        stage: STAGE,
                        key: key.to_string(),
                    });
                }
            }
        }

        if key == O_ACTIVE {
            if let Some(upstream) = self.input(0) {
                for nested in find_nearest(&upstream, SourceKind::Scheduler) {
                    nested.set_option(O_ACTIVE, value)?;
                }
            }
        }
        if reset {
            self.reset_mode();
        }
        Ok(())
    }

    fn option(&self, key: &str) -> Option<i64> {
        let config = self.config();
        match key {
            O_THREADS => Some(config.threads),
            O_QUEUE_SIZE => Some(config.queue_size as i64),
            O_TIMEOUT_MS => Some(config.timeout_ms as i64),
            O_TRIGGER => Some(config.trigger),
            O_AUDIO_DIRECTION => Some(config.audio_direction as i64),
            O_ACTIVE => Some(config.active as i64),
            _ => None,
        }
    }

    fn option_keys(&self) -> &'static [&'static str] {
        &[O_THREADS, O_QUEUE_SIZE, O_TIMEOUT_MS, O_TRIGGER, O_AUDIO_DIRECTION, O_ACTIVE]
    }

    fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let copy = Scheduler::with_config(Arc::clone(&self.registry), &self.config());
        if let Some(Some(input)) = inputs.into_iter().next() {
            copy.connect(input, 0)?;
        }
        Ok(Arc::new(copy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::connect_all;
    use crate::stages::conform::Conform;
    use crate::stages::pattern::{Pattern, PatternSpec};
    use std::thread;

    fn scheduler(spec: PatternSpec, threads: i64) -> (Arc<CacheRegistry>, Arc<Pattern>, Scheduler) {
        let registry = Arc::new(CacheRegistry::new());
        let pattern = Arc::new(Pattern::new(spec));
        let scheduler = Scheduler::new(Arc::clone(&registry));
        scheduler.set_option(O_THREADS, threads).unwrap();
        scheduler.connect(pattern.clone(), 0).unwrap();
        (registry, pattern, scheduler)
    }

    #[test]
    fn test_threaded_serves_in_order() {
        let spec = PatternSpec {
            delay: Duration::from_millis(2),
            deferred: true,
            ..PatternSpec::default()
        };
        let (_, _, scheduler) = scheduler(spec, 2);
        for p in 0..10 {
            let frame = scheduler.fetch_at(p).unwrap().unwrap();
            assert_eq!(frame.position(), p);
            assert!(frame.image_realised(), "worker must realise the image of {}", p);
        }
        assert!(scheduler.is_threaded());
        assert_eq!(scheduler.direction(), 1);
        assert!(scheduler.window_positions().iter().all(|p| *p > 9 && *p < 14));
    }

    /// Test: Scheduler window re-seed
    /// Validates: 0..9 then 0 discards the forward window and runs backwards
    #[test]
    fn test_reversal_reseeds_window() {
        let spec = PatternSpec {
            delay: Duration::from_millis(5),
            ..PatternSpec::default()
        };
        let (_, _, scheduler) = scheduler(spec, 2);
        for p in 0..10 {
            scheduler.fetch_at(p).unwrap();
        }
        let frame = scheduler.fetch_at(0).unwrap().unwrap();
        assert_eq!(frame.position(), 0);
        assert_eq!(scheduler.direction(), -1);

        // Forward jobs still running finish now and must be dropped
        thread::sleep(Duration::from_millis(50));
        assert!(scheduler.window_positions().iter().all(|p| *p <= 0));
    }

    #[test]
    fn test_backward_playback() {
        let (_, _, scheduler) = scheduler(PatternSpec::default(), 2);
        for p in (0..20).rev() {
            assert_eq!(scheduler.fetch_at(p).unwrap().unwrap().position(), p);
        }
        assert_eq!(scheduler.direction(), -1);
    }

    #[test]
    fn test_passthrough_when_not_thread_safe() {
        let spec = PatternSpec {
            thread_safe: false,
            ..PatternSpec::default()
        };
        let (registry, pattern, scheduler) = scheduler(spec, 4);
        assert!(scheduler.fetch_at(3).unwrap().is_some());
        assert!(scheduler.fetch_at(3).unwrap().is_some());
        assert!(!scheduler.is_threaded());
        assert_eq!(pattern.fetches(), 1);
        assert!(registry.contains(scheduler.scope_name()));
        assert!(scheduler.window_positions().is_empty());
    }

    #[test]
    fn test_passthrough_when_inactive() {
        let (registry, _, scheduler) = scheduler(PatternSpec::default(), 2);
        scheduler.set_option(O_ACTIVE, 0).unwrap();
        assert!(scheduler.fetch_at(1).unwrap().is_some());
        assert!(!scheduler.is_threaded());

        let name = scheduler.scope_name().to_string();
        drop(scheduler);
        assert!(!registry.contains(&name));
    }

    struct Opaque {
        uuid: Uuid,
        input: SourceRef,
    }

    impl Source for Opaque {
        fn uuid(&self) -> Uuid {
            self.uuid
        }
        fn kind(&self) -> SourceKind {
            SourceKind::Other("opaque")
        }
        fn slot_count(&self) -> usize {
            1
        }
        fn input(&self, slot: usize) -> Option<SourceRef> {
            (slot == 0).then(|| Arc::clone(&self.input))
        }
        fn seek(&self, position: i32, relative: bool) {
            self.input.seek(position, relative);
        }
        fn position(&self) -> i32 {
            self.input.position()
        }
        fn frames(&self) -> i32 {
            self.input.frames()
        }
        fn fetch(&self) -> GraphResult<Option<Frame>> {
            self.input.fetch()
        }
    }

    /// Filter counting decodes per position across all of its duplicates
    struct Tally {
        uuid: Uuid,
        input: Mutex<Option<SourceRef>>,
        counts: Arc<Mutex<HashMap<i32, usize>>>,
        slow: Option<(i32, Duration)>,
    }

    impl Tally {
        fn new(counts: Arc<Mutex<HashMap<i32, usize>>>, slow: Option<(i32, Duration)>) -> Self {
            Self {
                uuid: Uuid::new_v4(),
                input: Mutex::new(None),
                counts,
                slow,
            }
        }

        fn upstream(&self) -> SourceRef {
            self.input.lock().unwrap().clone().unwrap()
        }
    }

    impl Source for Tally {
        fn uuid(&self) -> Uuid {
            self.uuid
        }
        fn kind(&self) -> SourceKind {
            SourceKind::Other("tally")
        }
        fn slot_count(&self) -> usize {
            1
        }
        fn connect(&self, source: SourceRef, _slot: usize) -> GraphResult<()> {
            *self.input.lock().unwrap() = Some(source);
            Ok(())
        }
        fn input(&self, slot: usize) -> Option<SourceRef> {
            if slot == 0 { self.input.lock().unwrap().clone() } else { None }
        }
        fn seek(&self, position: i32, relative: bool) {
            self.upstream().seek(position, relative);
        }
        fn position(&self) -> i32 {
            self.upstream().position()
        }
        fn frames(&self) -> i32 {
            self.upstream().frames()
        }
        fn fetch(&self) -> GraphResult<Option<Frame>> {
            let upstream = self.upstream();
            let position = upstream.position();
            *self.counts.lock().unwrap().entry(position).or_insert(0) += 1;
            if let Some((_, delay)) = self.slow.filter(|(slow, _)| *slow == position) {
                thread::sleep(delay);
            }
            upstream.fetch()
        }
        fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
            let copy = Tally::new(Arc::clone(&self.counts), self.slow);
            connect_all(&copy, inputs)?;
            Ok(Arc::new(copy))
        }
    }

    fn tallied(threads: i64, slow: Option<(i32, Duration)>) -> (Arc<Mutex<HashMap<i32, usize>>>, Scheduler) {
        let counts = Arc::new(Mutex::new(HashMap::new()));
        let tally = Tally::new(Arc::clone(&counts), slow);
        tally.connect(Arc::new(Pattern::new(PatternSpec::default())), 0).unwrap();
        let scheduler = Scheduler::new(Arc::new(CacheRegistry::new()));
        scheduler.set_option(O_THREADS, threads).unwrap();
        scheduler.connect(Arc::new(tally), 0).unwrap();
        (counts, scheduler)
    }

    /// Test: Stepping back onto a position still being decoded
    /// Validates: the window turns around instead of trusting the stale forward job
    #[test]
    fn test_step_back_onto_in_flight_position_reverses() {
        let (_, scheduler) = tallied(2, Some((6, Duration::from_millis(200))));
        assert_eq!(scheduler.fetch_at(5).unwrap().unwrap().position(), 5);
        assert_eq!(scheduler.fetch_at(7).unwrap().unwrap().position(), 7);

        let frame = scheduler.fetch_at(6).unwrap().unwrap();
        assert_eq!(frame.position(), 6);
        assert_eq!(scheduler.direction(), -1);
        assert_eq!(frame.audio_reversed(), Some(true));
        let window = scheduler.window_positions();
        assert!(!window.is_empty());
        assert!(window.iter().all(|p| *p < 6), "window {:?} must run backwards", window);
    }

    /// Test: Each position is decoded once while playing through the window
    /// Validates: no job is dispatched for a position already pending or served
    #[test]
    fn test_threaded_never_decodes_twice() {
        let (counts, scheduler) = tallied(2, None);
        for p in 0..10 {
            assert_eq!(scheduler.fetch_at(p).unwrap().unwrap().position(), p);
        }
        // Jump ahead inside the pending window, then carry on
        for p in [12, 13, 14, 15] {
            assert_eq!(scheduler.fetch_at(p).unwrap().unwrap().position(), p);
        }
        assert_eq!(scheduler.direction(), 1);
        thread::sleep(Duration::from_millis(50));

        let counts = counts.lock().unwrap();
        let twice: Vec<_> = counts.iter().filter(|(_, n)| **n > 1).collect();
        assert!(twice.is_empty(), "decoded more than once: {:?}", twice);
        assert!((0..16).filter(|p| *p != 10 && *p != 11).all(|p| counts.contains_key(&p)));
    }

    #[test]
    fn test_passthrough_when_not_duplicable() {
        let registry = Arc::new(CacheRegistry::new());
        let scheduler = Scheduler::new(Arc::clone(&registry));
        scheduler.set_option(O_THREADS, 2).unwrap();
        let opaque = Opaque {
            uuid: Uuid::new_v4(),
            input: Arc::new(Pattern::new(PatternSpec::default())),
        };
        scheduler.connect(Arc::new(opaque), 0).unwrap();
        assert_eq!(scheduler.fetch_at(2).unwrap().unwrap().position(), 2);
        assert!(!scheduler.is_threaded());
    }

    #[test]
    fn test_reverse_audio() {
        let (_, _, scheduler) = scheduler(PatternSpec::default(), 0);
        let forward = scheduler.fetch_at(5).unwrap().unwrap();
        assert_eq!(forward.audio_reversed(), Some(false));
        assert_eq!(forward.audio().unwrap().sample(0, 0), Some(9600.0));

        let backward = scheduler.fetch_at(4).unwrap().unwrap();
        assert_eq!(scheduler.direction(), -1);
        assert_eq!(backward.audio_reversed(), Some(true));
        let audio = backward.audio().unwrap();
        assert_eq!(audio.sample(0, 0), Some(9599.0));
        assert_eq!(audio.sample(1, 0), Some(-9599.0));
        assert_eq!(audio.sample(0, 1919), Some(7680.0));

        scheduler.set_option(O_AUDIO_DIRECTION, 0).unwrap();
        let plain = scheduler.fetch_at(3).unwrap().unwrap();
        assert_eq!(plain.audio_reversed(), None);
        assert_eq!(plain.audio().unwrap().sample(0, 0), Some(5760.0));
    }

    #[test]
    fn test_timeout_falls_back_to_caller() {
        let spec = PatternSpec {
            delay: Duration::from_millis(150),
            ..PatternSpec::default()
        };
        let (_, _, scheduler) = scheduler(spec, 1);
        scheduler.set_option(O_TIMEOUT_MS, 10).unwrap();
        let frame = scheduler.fetch_at(0).unwrap();
        assert_eq!(frame.map(|f| f.position()), Some(0));
    }

    #[test]
    fn test_sync_agrees_on_length() {
        let (_, _, scheduler) = scheduler(PatternSpec::default(), 2);
        scheduler.fetch_at(0).unwrap();
        scheduler.sync().unwrap();
        assert_eq!(scheduler.frames(), 100);
        assert!(scheduler.window_positions().is_empty());
        assert_eq!(scheduler.fetch_at(99).unwrap().unwrap().position(), 99);
    }

    #[test]
    fn test_active_reaches_nested_scheduler() {
        let registry = Arc::new(CacheRegistry::new());
        let inner = Scheduler::new(Arc::clone(&registry));
        inner.connect(Arc::new(Pattern::new(PatternSpec::default())), 0).unwrap();
        let inner: SourceRef = Arc::new(inner);
        let conform = Conform::new();
        conform.connect(Arc::clone(&inner), 0).unwrap();

        let outer = Scheduler::new(registry);
        outer.connect(Arc::new(conform), 0).unwrap();
        outer.set_option(O_ACTIVE, 0).unwrap();
        assert_eq!(inner.option(O_ACTIVE), Some(0));
        assert!(outer.set_option(O_TRIGGER, 8).is_err());
        assert!(outer.set_option(O_THREADS, -2).is_err());
    }
}
