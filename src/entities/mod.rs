//! Entities - frame data model and the pull contract
//!
//! Everything a stage exchanges with its neighbours lives here:
//! - `Frame` with shared (and possibly deferred) payloads
//! - `Source`, the trait every stage implements
//! - option keys and the single-caller `Cursor`

pub mod cursor;
pub mod frame;
pub mod keys;
pub mod traits;

pub use cursor::{Cursor, clamp_position};
pub use frame::{Audio, Frame, Image, Packet, Payload, PixelFormat, Rational, Trigger};
pub use traits::{
    Capability, CapabilityKind, FramePush, Source, SourceKind, SourceRef, SyncControl, connect_all, inputs_of,
    same_source,
};
