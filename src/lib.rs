//! FRAMEFORK - frame sharing, fan-out and speculative decode for pull graphs
//!
//! A graph is a tree of [`Source`] stages pulled from the root. This crate
//! provides the stages that let one decoder feed several consumers and many
//! threads: [`Lock`], [`Fork`], [`Voodoo`] and [`Scheduler`], together with the
//! audio timing they rely on.

// Shared caches and the worker pool
pub mod core;

// Frame-to-sample timing
pub mod audio;

pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod stages;

pub use audio::{AudioBlock, Cadence, Calculator};
pub use core::{CacheRegistry, ScopeCache, Workers};
pub use entities::{Frame, Rational, Source, SourceRef};
pub use error::{GraphError, GraphResult};
pub use stages::{Fork, Lock, Nudger, Scheduler, Voodoo};
