//! Pull contract shared by every stage of a graph.
//!
//! A graph is a tree of `Arc<dyn Source>`: each stage pulls frames from the
//! stages connected to its input slots. Stages are shared between threads, so
//! every method takes `&self` and stages synchronise internally.
//!
//! Optional interfaces (pushing frames into a placeholder, toggling sync
//! propagation on a lock) are reached through [`Source::capability`] instead
//! of downcasting.

use std::sync::Arc;
use uuid::Uuid;

use super::frame::Frame;
use crate::error::{GraphError, GraphResult};

/// Shared handle to a stage
pub type SourceRef = Arc<dyn Source>;

/// Stage identity, used by the graph walkers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Lock,
    Nudger,
    Fork,
    Voodoo,
    Scheduler,
    FrameRate,
    Conform,
    Muxer,
    Pattern,
    Other(&'static str),
}

impl SourceKind {
    /// Serialisation name
    pub fn uri(&self) -> &'static str {
        match self {
            SourceKind::Lock => "lock",
            SourceKind::Nudger => "nudger:",
            SourceKind::Fork => "fork",
            SourceKind::Voodoo => "voodoo",
            SourceKind::Scheduler => "distributor",
            SourceKind::FrameRate => "frame_rate",
            SourceKind::Conform => "conform",
            SourceKind::Muxer => "muxer",
            SourceKind::Pattern => "pattern:",
            SourceKind::Other(uri) => uri,
        }
    }

    /// Stages which build private sub-graphs from their inputs
    pub fn is_fan_out(&self) -> bool {
        matches!(self, SourceKind::Fork | SourceKind::Voodoo)
    }
}

/// Push side of a placeholder source
pub trait FramePush: Send + Sync {
    /// Queue a frame by its position; `None` clears the queue
    fn push(&self, frame: Option<Frame>);
}

/// Runtime control of a lock's length synchronisation
pub trait SyncControl: Send + Sync {
    fn sync_propagate(&self) -> bool;
    fn set_sync_propagate(&self, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Push,
    SyncControl,
}

/// Typed handle returned by [`Source::capability`]
pub enum Capability<'a> {
    Push(&'a dyn FramePush),
    SyncControl(&'a dyn SyncControl),
}

/// A stage of a pull graph
pub trait Source: Send + Sync {
    /// Unique identifier of this instance
    fn uuid(&self) -> Uuid;

    fn kind(&self) -> SourceKind;

    fn uri(&self) -> &'static str {
        self.kind().uri()
    }

    /// Number of input slots
    fn slot_count(&self) -> usize {
        0
    }

    /// Wire an upstream into `slot`
    fn connect(&self, source: SourceRef, slot: usize) -> GraphResult<()> {
        let _ = source;
        Err(GraphError::InvalidSlot {
            stage: self.uri(),
            slot,
            count: self.slot_count(),
        })
    }

    /// Upstream connected to `slot`
    fn input(&self, slot: usize) -> Option<SourceRef> {
        let _ = slot;
        None
    }

    /// Move the cursor, clamped to `[0, frames - 1]`
    fn seek(&self, position: i32, relative: bool);

    /// Cursor for the calling context
    fn position(&self) -> i32;

    /// Frame count as of the last sync
    fn frames(&self) -> i32;

    /// Recompute the frame count and apply structural changes
    fn sync(&self) -> GraphResult<()> {
        Ok(())
    }

    /// Frame at the cursor. `Ok(None)` means not ready or not decodable.
    fn fetch(&self) -> GraphResult<Option<Frame>>;

    fn fetch_at(&self, position: i32) -> GraphResult<Option<Frame>> {
        self.seek(position, false);
        self.fetch()
    }

    /// True when concurrent callers need no extra protection
    fn is_thread_safe(&self) -> bool {
        (0..self.slot_count()).all(|slot| self.input(slot).is_none_or(|input| input.is_thread_safe()))
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        let _ = value;
        Err(GraphError::UnknownOption {
            stage: self.uri(),
            key: key.to_string(),
        })
    }

    fn option(&self, key: &str) -> Option<i64> {
        let _ = key;
        None
    }

    /// Keys understood by `set_option`, in dump order
    fn option_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Fresh instance with the same options, connected to `inputs`
    fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let _ = inputs;
        Err(GraphError::NotDuplicable { stage: self.uri() })
    }

    /// Name used by graph dumps instead of `uri()`. `Some("")` hides the stage.
    fn serialise_as(&self) -> Option<&'static str> {
        None
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability<'_>> {
        let _ = kind;
        None
    }
}

/// All input slots of a stage, connected or not
pub fn inputs_of(source: &dyn Source) -> Vec<Option<SourceRef>> {
    (0..source.slot_count()).map(|slot| source.input(slot)).collect()
}

/// Connect `inputs` to `target` slot by slot, skipping empty slots
pub fn connect_all(target: &dyn Source, inputs: Vec<Option<SourceRef>>) -> GraphResult<()> {
    for (slot, input) in inputs.into_iter().enumerate() {
        if let Some(input) = input {
            target.connect(input, slot)?;
        }
    }
    Ok(())
}

/// Same instance
pub fn same_source(a: &SourceRef, b: &SourceRef) -> bool {
    Arc::ptr_eq(a, b)
}
