//! Graph stages
//!
//! - `lock` - shares a non-reentrant upstream between threads
//! - `nudger` - push-fed placeholder for branch graphs
//! - `fork`, `voodoo` - fan a single upstream out to branch graphs
//! - `scheduler` - speculative decode on a worker pool
//! - `frame_rate`, `conform`, `muxer` - helpers spliced in by the fan-out stages
//! - `pattern` - synthetic leaf source
//! - `rewire`, `dump` - graph passes

pub mod conform;
pub mod dump;
pub mod fork;
pub mod frame_rate;
pub mod lock;
pub mod muxer;
pub mod nudger;
pub mod pattern;
pub mod rewire;
pub mod scheduler;
pub mod voodoo;

pub use conform::Conform;
pub use dump::{dump, dump_lines};
pub use fork::Fork;
pub use frame_rate::FrameRate;
pub use lock::Lock;
pub use muxer::Muxer;
pub use nudger::Nudger;
pub use pattern::{Pattern, PatternSpec};
pub use rewire::{Descend, clone_graph, find_all, find_nearest, rewire, wrap_terminals};
pub use scheduler::Scheduler;
pub use voodoo::Voodoo;
