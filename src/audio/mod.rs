//! Audio timing - frame/sample mapping and per-frame block calculation

pub mod block;
pub mod samples;

pub use block::{AudioBlock, Calculator, StreamKind};
pub use samples::{
    Cadence, Cycle, cycle, cycle_with, map, map_first, map_last, samples_for_frame, samples_for_frame_with,
    samples_to_frame, samples_to_frame_with,
};
