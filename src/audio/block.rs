//! Per-frame audio block calculation
//!
//! The calculator knows the video rate, the sample frequency and the streams
//! of a container. For a frame position it produces an [`AudioBlock`]: which
//! samples belong to the frame, which packets carry them and how many samples
//! of the first packet must be dropped.
//!
//! Audio packets may be muxed at their own rate (`packet_rate`), and encoders
//! may prepend a lead-in of silence. Both are handled by shifting the frame's
//! sample range by the lead-in and locating it in the packet grid:
//!
//! ```text
//!   lead_in -> first -> last
//!              |        |
//! [p0...][p1][p2....][p3....]
//! ```

use log::debug;
use std::collections::BTreeMap;

use super::samples::{Cadence, samples_for_frame_with, samples_to_frame_with};
use crate::entities::frame::Rational;
use crate::error::TimingError;

/// Samples and packets that make up one frame's audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioBlock {
    /// Requested frame position
    pub position: i32,
    /// Samples in the frame
    pub samples: i32,
    /// First sample offset of the frame (before lead-in)
    pub first: i64,
    /// One past the last sample offset
    pub last: i64,
    /// First packet to decode
    pub first_packet: i32,
    /// Packets to decode, starting at `first_packet`
    pub packets: i32,
    /// Samples to drop from the start of the first packet
    pub discard: i32,
}

/// Registered stream category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamKind {
    Video,
    Audio,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamInfo {
    kind: StreamKind,
    time_base: Rational,
    offset: i64,
}

/// Frame to audio block calculator
#[derive(Debug, Clone)]
pub struct Calculator {
    source: String,
    fps: Rational,
    frequency: i32,
    cadence: Cadence,
    packet_rate: Option<Rational>,
    lead_in: i64,
    streams: BTreeMap<usize, StreamInfo>,
}

impl Calculator {
    pub fn new(fps: Rational, frequency: i32) -> Self {
        Self {
            source: String::new(),
            fps,
            frequency,
            cadence: Cadence::default(),
            packet_rate: None,
            lead_in: 0,
            streams: BTreeMap::new(),
        }
    }

    /// Name used in log and error messages
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    /// Audio packets follow their own frame rate
    pub fn with_packet_rate(mut self, rate: Rational) -> Self {
        self.packet_rate = rate.is_valid().then_some(rate);
        self
    }

    /// Encoder delay in samples
    pub fn with_lead_in(mut self, samples: i64) -> Self {
        self.lead_in = samples.max(0);
        self
    }

    pub fn set_fps(&mut self, fps: Rational) {
        debug!("Setting frame rate of '{}' as {}", self.source, fps);
        self.fps = fps;
    }

    pub fn set_frequency(&mut self, frequency: i32) {
        debug!("Setting frequency of '{}' as {}", self.source, frequency);
        self.frequency = frequency;
    }

    pub fn fps(&self) -> Rational {
        self.fps
    }

    pub fn frequency(&self) -> i32 {
        self.frequency
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Register stream `index` as video or audio with its time base
    pub fn set_stream_type(&mut self, index: usize, kind: StreamKind, time_base: Rational) -> Result<(), TimingError> {
        if kind == StreamKind::Unknown {
            return Err(TimingError::UnsupportedStream {
                index,
                source_name: self.source.clone(),
            });
        }
        debug!("Registering stream {} of '{}' as {:?} at {}", index, self.source, kind, time_base);
        let info = self.streams.entry(index).or_default();
        info.kind = kind;
        info.time_base = time_base;
        Ok(())
    }

    /// Dts of the first packet of a registered stream
    pub fn set_stream_offset(&mut self, index: usize, offset: i64) -> Result<(), TimingError> {
        match self.streams.get_mut(&index) {
            Some(info) => {
                debug!("Registering stream {} of '{}' with offset {}", index, self.source, offset);
                info.offset = offset;
                Ok(())
            }
            None => Err(TimingError::UnregisteredStream {
                index,
                source_name: self.source.clone(),
            }),
        }
    }

    pub fn stream_type(&self, index: usize) -> StreamKind {
        self.streams.get(&index).map(|i| i.kind).unwrap_or_default()
    }

    pub fn has_video(&self) -> bool {
        self.streams.values().any(|i| i.kind == StreamKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.streams.values().any(|i| i.kind == StreamKind::Audio)
    }

    fn known(&self, index: usize) -> Result<StreamInfo, TimingError> {
        match self.streams.get(&index) {
            Some(info) if info.kind != StreamKind::Unknown && info.time_base.is_valid() => Ok(*info),
            _ => Err(TimingError::UnknownStream {
                index,
                source_name: self.source.clone(),
            }),
        }
    }

    pub fn samples_for_frame(&self, frame: i32) -> i32 {
        samples_for_frame_with(frame, self.frequency, self.fps.num, self.fps.den, self.cadence)
    }

    pub fn samples_to_frame(&self, frame: i32) -> i64 {
        samples_to_frame_with(frame, self.frequency, self.fps.num, self.fps.den, self.cadence)
    }

    /// Stream position of a frame: the frame itself for video, its first sample for audio
    pub fn frame_to_position(&self, index: usize, frame: i32) -> Result<i64, TimingError> {
        match self.known(index)?.kind {
            StreamKind::Audio => Ok(self.samples_to_frame(frame)),
            _ => Ok(frame as i64),
        }
    }

    /// Length of a packet of `duration` time base units: 1 frame for video, samples for audio
    pub fn packet_duration(&self, index: usize, duration: i64) -> Result<i64, TimingError> {
        let info = self.known(index)?;
        match info.kind {
            StreamKind::Audio => Ok(ceil_div(
                self.frequency as i128 * info.time_base.num as i128 * duration as i128,
                info.time_base.den as i128,
            ) as i64),
            _ => Ok(1),
        }
    }

    /// Convert a packet dts to a frame (video) or sample (audio) position
    pub fn dts_to_position(&self, index: usize, dts: i64) -> Result<i64, TimingError> {
        let info = self.known(index)?;
        let dts = (dts - info.offset) as i128;
        let (num, den) = (info.time_base.num as i128, info.time_base.den as i128);
        match info.kind {
            StreamKind::Audio => Ok(ceil_div(self.frequency as i128 * num * dts, den) as i64),
            _ => {
                // round(fps * num * dts / den)
                let n = self.fps.num as i128 * num * dts;
                let d = self.fps.den as i128 * den;
                if d == 0 {
                    return Ok(0);
                }
                Ok((2 * n + d).div_euclid(2 * d) as i64)
            }
        }
    }

    /// Convert a frame (video) or sample (audio) position to a packet dts
    pub fn position_to_dts(&self, index: usize, position: i64) -> Result<i64, TimingError> {
        let info = self.known(index)?;
        let (num, den) = (info.time_base.num as i128, info.time_base.den as i128);
        let position = position as i128;
        let delta = match info.kind {
            StreamKind::Audio => ceil_div(position * den, num * self.frequency as i128),
            _ => ceil_div(position * den * self.fps.den as i128, num * self.fps.num as i128),
        };
        Ok(info.offset + delta as i64)
    }

    /// Audio block for `position`; None without a valid rate and frequency
    pub fn calculate(&self, position: i32) -> Option<AudioBlock> {
        if !self.fps.is_valid() || self.frequency <= 0 {
            return None;
        }

        let samples = self.samples_for_frame(position);
        let first = self.samples_to_frame(position);
        let last = first + samples as i64;

        let shifted = first + self.lead_in;
        let (first_packet, packets, discard) = match self.packet_rate {
            Some(rate) => {
                let start = self.packet_for_sample(shifted, rate);
                let end = self.packet_for_sample(shifted + samples.max(1) as i64 - 1, rate);
                let offset = shifted - self.packet_start(start, rate);
                (start, end - start + 1, offset as i32)
            }
            // Packets follow the video frames, lead-in stays inside the frame grid
            None => {
                let start = self.packet_for_sample(shifted, self.fps);
                let end = self.packet_for_sample(shifted + samples.max(1) as i64 - 1, self.fps);
                let offset = shifted - self.samples_to_frame(start);
                (start, end - start + 1, offset as i32)
            }
        };

        Some(AudioBlock {
            position,
            samples,
            first,
            last,
            first_packet,
            packets,
            discard,
        })
    }

    fn packet_start(&self, packet: i32, rate: Rational) -> i64 {
        samples_to_frame_with(packet, self.frequency, rate.num, rate.den, self.cadence)
    }

    /// Packet whose sample range contains `sample`
    fn packet_for_sample(&self, sample: i64, rate: Rational) -> i32 {
        // Estimate from the ideal rate, then walk to the exact packet
        let estimate = (sample as i128 * rate.num as i128).div_euclid(self.frequency as i128 * rate.den as i128);
        let mut packet = estimate as i32;
        while self.packet_start(packet, rate) > sample {
            packet -= 1;
        }
        while self.packet_start(packet + 1, rate) <= sample {
            packet += 1;
        }
        packet
    }
}

fn ceil_div(n: i128, d: i128) -> i128 {
    if d == 0 {
        return 0;
    }
    let q = n.div_euclid(d);
    if n.rem_euclid(d) != 0 { q + 1 } else { q }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pal() -> Calculator {
        Calculator::new(Rational::new(25, 1), 48000).with_source("test.mxf")
    }

    #[test]
    fn test_block_without_lead_in() {
        let block = pal().calculate(3).unwrap();
        assert_eq!(block.samples, 1920);
        assert_eq!(block.first, 5760);
        assert_eq!(block.last, 7680);
        assert_eq!(block.first_packet, 3);
        assert_eq!(block.packets, 1);
        assert_eq!(block.discard, 0);
    }

    /// Test: Lead-in shifts the range into the previous packet grid
    /// Validates: discard == shifted offset - start of first packet
    #[test]
    fn test_lead_in_discard() {
        let calc = pal().with_lead_in(576);
        let block = calc.calculate(0).unwrap();
        assert_eq!(block.first_packet, 0);
        assert_eq!(block.packets, 2);
        assert_eq!(block.discard, 576);

        let block = calc.calculate(4).unwrap();
        assert_eq!(block.first_packet, 4);
        assert_eq!(block.discard, 576);
    }

    #[test]
    fn test_packet_rate_grid() {
        // 1024 sample packets: 48000 / 1024 = 46.875 packets per second
        let calc = pal().with_packet_rate(Rational::new(375, 8));
        let block = calc.calculate(1).unwrap();
        // Samples 1920..3840 live in packets 1 (1024..2048) to 3 (3072..4096)
        assert_eq!(block.first_packet, 1);
        assert_eq!(block.packets, 3);
        assert_eq!(block.discard, 1920 - 1024);
    }

    #[test]
    fn test_ntsc_blocks_tile() {
        let calc = Calculator::new(Rational::new(30000, 1001), 48000);
        let mut expected = 0;
        for position in 0..20 {
            let block = calc.calculate(position).unwrap();
            assert_eq!(block.first, expected);
            assert_eq!(block.packets, 1);
            assert_eq!(block.discard, 0);
            expected = block.last;
        }
        assert_eq!(expected, 4 * 8008);
    }

    #[test]
    fn test_stream_registry() {
        let mut calc = pal();
        assert_eq!(calc.stream_type(1), StreamKind::Unknown);
        assert!(matches!(
            calc.set_stream_type(2, StreamKind::Unknown, Rational::new(1, 90000)),
            Err(TimingError::UnsupportedStream { index: 2, .. })
        ));
        assert!(matches!(
            calc.set_stream_offset(1, 10),
            Err(TimingError::UnregisteredStream { index: 1, .. })
        ));

        calc.set_stream_type(0, StreamKind::Video, Rational::new(1, 25)).unwrap();
        calc.set_stream_type(1, StreamKind::Audio, Rational::new(1, 48000)).unwrap();
        calc.set_stream_offset(1, 480).unwrap();
        assert!(calc.has_video() && calc.has_audio());

        assert_eq!(calc.frame_to_position(0, 7).unwrap(), 7);
        assert_eq!(calc.frame_to_position(1, 7).unwrap(), 7 * 1920);
        assert_eq!(calc.packet_duration(0, 1).unwrap(), 1);
        assert_eq!(calc.packet_duration(1, 1024).unwrap(), 1024);
        assert_eq!(calc.dts_to_position(0, 12).unwrap(), 12);
        assert_eq!(calc.dts_to_position(1, 480 + 1920).unwrap(), 1920);
        assert_eq!(calc.position_to_dts(1, 1920).unwrap(), 480 + 1920);
        assert_eq!(calc.position_to_dts(0, 12).unwrap(), 12);
        assert!(matches!(calc.frame_to_position(5, 0), Err(TimingError::UnknownStream { .. })));
    }

    #[test]
    fn test_invalid_rate_has_no_block() {
        assert!(Calculator::new(Rational::new(0, 1), 48000).calculate(0).is_none());
        assert!(Calculator::new(Rational::new(25, 1), 0).calculate(0).is_none());
    }
}
