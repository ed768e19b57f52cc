//! Option key constants for `Source::set_option`.
//!
//! Avoid string typos, enable IDE autocomplete.
//! Usage: `lock.set_option(O_QUEUE_SIZE, 100)?`

// === Caching ===
/// LRU capacity (nudger queue, lock cache, scheduler passthrough cache)
pub const O_QUEUE_SIZE: &str = "queue_size";
/// Wait bound in milliseconds (nudger, scheduler)
pub const O_TIMEOUT_MS: &str = "timeout_ms";
/// Lock: re-sync upstream on sync() (1) or trust the cached length (0)
pub const O_SYNC_PROPAGATE: &str = "sync_propagate";

// === Fan-out ===
/// Fork: number of branches
pub const O_SLOTS: &str = "slots";
/// Fork: branch whose frame is returned (0 = upstream)
pub const O_SOLO: &str = "solo";
/// Fork/Lock: writable image copy per fetch. Conform: keep the image
pub const O_IMAGE: &str = "image";
/// Conform: keep the audio
pub const O_AUDIO: &str = "audio";

// === Scheduler ===
/// Worker count (-1 = auto, 0 = passthrough)
pub const O_THREADS: &str = "threads";
/// Payloads realised by workers (bit 1 image, bit 2 stream, bit 4 audio)
pub const O_TRIGGER: &str = "trigger";
/// Reverse audio when playing backwards
pub const O_AUDIO_DIRECTION: &str = "audio_direction";
/// Allow threaded mode
pub const O_ACTIVE: &str = "active";

// === Misc stages ===
/// Nudger: reported frame count
pub const O_LENGTH: &str = "length";
/// FrameRate: target numerator
pub const O_FPS_NUM: &str = "fps_num";
/// FrameRate: target denominator
pub const O_FPS_DEN: &str = "fps_den";
/// Muxer: report the longer input's length
pub const O_USE_LONGEST: &str = "use_longest";

/// Interpret an integer option as a flag.
pub fn flag(value: i64) -> bool {
    value != 0
}
