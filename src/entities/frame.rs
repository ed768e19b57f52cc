//! Frame data model - positioned unit of image/audio payload
//!
//! **Why**: Several consumers hold the same decoded frame at once (lock cache,
//! scheduler map, fork branches). Payloads live behind `Arc` so `Clone` is the
//! cheap *shallow copy*: metadata is copied, pixels and samples are shared.
//!
//! **Used by**: every stage in `crate::stages`, the caches in `crate::core`
//!
//! # Deferred payloads
//!
//! Image and stream payloads may be attached as closures that decode on first
//! access (`Payload::deferred`). Realisation goes through a `OnceCell`, so two
//! threads touching the same shared payload decode it once. The scheduler uses
//! this to force decode on worker threads instead of the caller.

use log::trace;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Frame rate fraction (num/den), e.g. 30000/1001
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Both terms positive
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Divide out the common factor (25000/1000 -> 25/1)
    pub fn reduced(&self) -> Self {
        let g = gcd(self.num as i64, self.den as i64);
        if g <= 1 {
            *self
        } else {
            Self::new((self.num as i64 / g) as i32, (self.den as i64 / g) as i32)
        }
    }

    /// Same rate after reduction
    pub fn same_rate(&self, other: &Rational) -> bool {
        self.reduced() == other.reduced()
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 { 0.0 } else { self.num as f64 / self.den as f64 }
    }

    /// Seconds per frame
    pub fn frame_duration(&self) -> f64 {
        if self.num == 0 { 0.0 } else { self.den as f64 / self.num as f64 }
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(25, 1)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl std::str::FromStr for Rational {
    type Err = String;

    /// Accepts "30000/1001", "30000:1001" or "25"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, ['/', ':']);
        let num = parts
            .next()
            .and_then(|n| n.trim().parse::<i32>().ok())
            .ok_or_else(|| format!("invalid frame rate '{}'", s))?;
        let den = match parts.next() {
            Some(d) => d.trim().parse::<i32>().map_err(|_| format!("invalid frame rate '{}'", s))?,
            None => 1,
        };
        let rate = Rational::new(num, den);
        if rate.is_valid() { Ok(rate) } else { Err(format!("invalid frame rate '{}'", s)) }
    }
}

/// Greatest common divisor of the absolute values (0 when both are 0)
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Pixel format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8, // 8-bit RGBA
    Gray8, // 8-bit luma only
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// Decoded picture
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Image {
    /// Black image
    pub fn new(width: usize, height: usize, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0u8; width * height * format.bytes_per_pixel()],
        }
    }

    /// Wrap an existing buffer; the buffer length must match the dimensions
    pub fn from_data(width: usize, height: usize, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        (data.len() == width * height * format.bytes_per_pixel()).then_some(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Memory size in bytes
    pub fn mem(&self) -> usize {
        self.data.len()
    }
}

/// Interleaved f32 audio for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Audio {
    pub frequency: i32,
    pub channels: usize,
    pub samples: usize,
    pub data: Vec<f32>,
}

impl Audio {
    /// Silence
    pub fn new(frequency: i32, channels: usize, samples: usize) -> Self {
        Self {
            frequency,
            channels,
            samples,
            data: vec![0.0; samples * channels],
        }
    }

    /// Wrap interleaved samples; trailing partial sample frames are dropped
    pub fn from_samples(frequency: i32, channels: usize, mut data: Vec<f32>) -> Self {
        let channels = channels.max(1);
        let samples = data.len() / channels;
        data.truncate(samples * channels);
        Self {
            frequency,
            channels,
            samples,
            data,
        }
    }

    pub fn sample(&self, channel: usize, index: usize) -> Option<f32> {
        if channel >= self.channels || index >= self.samples {
            return None;
        }
        self.data.get(index * self.channels + channel).copied()
    }

    /// Copy `len` samples starting at `start`, padding with silence past the end
    pub fn slice(&self, start: usize, len: usize) -> Audio {
        let mut out = Audio::new(self.frequency, self.channels, len);
        let available = self.samples.saturating_sub(start).min(len);
        if available > 0 {
            let from = start * self.channels;
            let count = available * self.channels;
            out.data[..count].copy_from_slice(&self.data[from..from + count]);
        }
        out
    }

    /// Append another block with the same channel layout
    pub fn append(&mut self, other: &Audio) {
        debug_assert_eq!(self.channels, other.channels);
        self.data.extend_from_slice(&other.data);
        self.samples += other.samples;
    }

    /// Reverse the sample order, keeping each sample frame's channel order
    pub fn reversed(&self) -> Audio {
        let mut data = Vec::with_capacity(self.data.len());
        for frame in self.data.chunks(self.channels.max(1)).rev() {
            data.extend_from_slice(frame);
        }
        Audio {
            frequency: self.frequency,
            channels: self.channels,
            samples: self.samples,
            data,
        }
    }
}

/// Compressed stream packet associated to a frame
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub position: i32,
    pub key: bool,
    pub data: Vec<u8>,
}

type Loader<T> = Box<dyn FnOnce() -> Option<T> + Send>;

/// Payload which is either ready or decoded on first access
pub struct Payload<T> {
    cell: OnceCell<Option<Arc<T>>>,
    loader: Mutex<Option<Loader<T>>>,
}

impl<T> Payload<T> {
    pub fn ready(value: T) -> Self {
        Self {
            cell: OnceCell::with_value(Some(Arc::new(value))),
            loader: Mutex::new(None),
        }
    }

    pub fn deferred<F>(loader: F) -> Self
    where
        F: FnOnce() -> Option<T> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            loader: Mutex::new(Some(Box::new(loader))),
        }
    }

    /// Realise (if needed) and return the payload
    pub fn get(&self) -> Option<Arc<T>> {
        self.cell
            .get_or_init(|| {
                let loader = self.loader.lock().unwrap_or_else(|e| e.into_inner()).take();
                loader.and_then(|load| load()).map(Arc::new)
            })
            .clone()
    }

    pub fn is_realised(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T> fmt::Debug for Payload<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("realised", &self.is_realised())
            .finish()
    }
}

/// Payload selection for `Frame::realise`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger(u8);

impl Trigger {
    pub const NONE: Trigger = Trigger(0);
    pub const IMAGE: Trigger = Trigger(1);
    pub const STREAM: Trigger = Trigger(2);
    pub const AUDIO: Trigger = Trigger(4);

    pub fn from_bits(bits: i64) -> Self {
        Trigger((bits & 0x7) as u8)
    }

    pub fn bits(&self) -> i64 {
        self.0 as i64
    }

    pub fn contains(&self, other: Trigger) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Trigger {
    type Output = Trigger;
    fn bitor(self, rhs: Trigger) -> Trigger {
        Trigger(self.0 | rhs.0)
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::IMAGE | Trigger::STREAM
    }
}

/// Single positioned frame
#[derive(Debug, Clone)]
pub struct Frame {
    position: i32,
    fps: Rational,
    pts: f64,
    duration: f64,
    image: Option<Arc<Payload<Image>>>,
    audio: Option<Arc<Audio>>,
    stream: Option<Arc<Payload<Packet>>>,
    audio_reversed: Option<bool>,
}

impl Frame {
    /// Empty frame at `position`; pts and duration follow from the rate
    pub fn new(position: i32, fps: Rational) -> Self {
        Self {
            position,
            fps,
            pts: position as f64 * fps.frame_duration(),
            duration: fps.frame_duration(),
            image: None,
            audio: None,
            stream: None,
            audio_reversed: None,
        }
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    /// Move the frame to another position (pts follows)
    pub fn set_position(&mut self, position: i32) {
        self.position = position;
        self.pts = position as f64 * self.fps.frame_duration();
    }

    pub fn fps(&self) -> Rational {
        self.fps
    }

    pub fn set_fps(&mut self, fps: Rational) {
        self.fps = fps;
        self.pts = self.position as f64 * fps.frame_duration();
        self.duration = fps.frame_duration();
    }

    pub fn pts(&self) -> f64 {
        self.pts
    }

    pub fn set_pts(&mut self, pts: f64) {
        self.pts = pts;
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = duration;
    }

    /// Shallow copy: metadata copied, payloads shared
    pub fn shallow(&self) -> Frame {
        self.clone()
    }

    /// Image payload, decoding it if deferred
    pub fn image(&self) -> Option<Arc<Image>> {
        self.image.as_ref().and_then(|p| p.get())
    }

    /// An image payload is attached (realised or not)
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn image_realised(&self) -> bool {
        self.image.as_ref().is_some_and(|p| p.is_realised())
    }

    pub fn set_image(&mut self, image: Option<Image>) {
        self.image = image.map(|i| Arc::new(Payload::ready(i)));
    }

    pub fn set_deferred_image<F>(&mut self, loader: F)
    where
        F: FnOnce() -> Option<Image> + Send + 'static,
    {
        self.image = Some(Arc::new(Payload::deferred(loader)));
    }

    /// Share another frame's image payload without realising it
    pub fn share_image(&mut self, other: &Frame) {
        self.image = other.image.clone();
    }

    /// Replace the shared image with a private deep copy
    pub fn make_image_writable(&mut self) {
        if let Some(image) = self.image() {
            trace!("Deep copy of image at {} ({} bytes)", self.position, image.mem());
            self.image = Some(Arc::new(Payload::ready((*image).clone())));
        }
    }

    pub fn audio(&self) -> Option<Arc<Audio>> {
        self.audio.clone()
    }

    pub fn set_audio(&mut self, audio: Option<Audio>) {
        self.audio = audio.map(Arc::new);
    }

    /// Share another frame's audio payload
    pub fn share_audio(&mut self, other: &Frame) {
        self.audio = other.audio.clone();
    }

    pub fn stream(&self) -> Option<Arc<Packet>> {
        self.stream.as_ref().and_then(|p| p.get())
    }

    pub fn stream_realised(&self) -> bool {
        self.stream.as_ref().is_some_and(|p| p.is_realised())
    }

    pub fn set_stream(&mut self, packet: Option<Packet>) {
        self.stream = packet.map(|p| Arc::new(Payload::ready(p)));
    }

    pub fn set_deferred_stream<F>(&mut self, loader: F)
    where
        F: FnOnce() -> Option<Packet> + Send + 'static,
    {
        self.stream = Some(Arc::new(Payload::deferred(loader)));
    }

    /// Whether the audio was reversed for backwards playback (None = never handled)
    pub fn audio_reversed(&self) -> Option<bool> {
        self.audio_reversed
    }

    pub fn set_audio_reversed(&mut self, reversed: bool) {
        self.audio_reversed = Some(reversed);
    }

    /// Force decode of the payloads selected by `trigger`
    pub fn realise(&self, trigger: Trigger) {
        if trigger.contains(Trigger::IMAGE) {
            let _ = self.image();
        }
        if trigger.contains(Trigger::STREAM) {
            let _ = self.stream();
        }
        if trigger.contains(Trigger::AUDIO) {
            let _ = self.audio();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test: Shallow copy shares payloads but not metadata
    /// Validates: re-positioning a copy leaves the original intact
    #[test]
    fn test_shallow_copy_shares_payload() {
        let mut frame = Frame::new(5, Rational::new(25, 1));
        frame.set_image(Some(Image::new(4, 4, PixelFormat::Rgba8)));

        let mut copy = frame.shallow();
        copy.set_position(9);

        assert_eq!(frame.position(), 5);
        assert_eq!(copy.position(), 9);
        assert!(Arc::ptr_eq(&frame.image().unwrap(), &copy.image().unwrap()));
    }

    #[test]
    fn test_writable_image_is_private() {
        let mut frame = Frame::new(0, Rational::default());
        frame.set_image(Some(Image::new(2, 2, PixelFormat::Gray8)));
        let mut copy = frame.shallow();
        copy.make_image_writable();

        assert!(!Arc::ptr_eq(&frame.image().unwrap(), &copy.image().unwrap()));
        assert_eq!(*frame.image().unwrap(), *copy.image().unwrap());
    }

    /// Test: Deferred payload decodes exactly once across shallow copies
    #[test]
    fn test_deferred_image_realised_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut frame = Frame::new(0, Rational::default());
        frame.set_deferred_image(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Image::new(1, 1, PixelFormat::Gray8))
        });

        let copy = frame.shallow();
        assert!(!frame.image_realised());
        copy.realise(Trigger::IMAGE);
        assert!(frame.image_realised());
        assert!(frame.image().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_audio_reverse_keeps_channels() {
        let audio = Audio::from_samples(48000, 2, vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        let rev = audio.reversed();
        assert_eq!(rev.data, vec![3.0, -3.0, 2.0, -2.0, 1.0, -1.0]);
        assert_eq!(rev.samples, 3);
    }

    #[test]
    fn test_audio_slice_pads_with_silence() {
        let audio = Audio::from_samples(48000, 1, vec![1.0, 2.0, 3.0]);
        let slice = audio.slice(2, 3);
        assert_eq!(slice.data, vec![3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rational_parse_and_reduce() {
        let rate: Rational = "25000/1000".parse().unwrap();
        assert_eq!(rate.reduced(), Rational::new(25, 1));
        assert!(rate.same_rate(&Rational::new(25, 1)));
        assert_eq!("30000:1001".parse::<Rational>().unwrap(), Rational::new(30000, 1001));
        assert!("0/1".parse::<Rational>().is_err());
    }

    #[test]
    fn test_trigger_bits() {
        let trigger = Trigger::from_bits(5);
        assert!(trigger.contains(Trigger::IMAGE));
        assert!(trigger.contains(Trigger::AUDIO));
        assert!(!trigger.contains(Trigger::STREAM));
        assert_eq!(Trigger::default().bits(), 3);
    }
}
