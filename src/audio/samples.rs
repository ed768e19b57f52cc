//! Frame <-> audio sample mapping
//!
//! A frame rate of `num/den` and a frequency `f` give `f * den / num` samples
//! per frame. When that is not an integer, every frame gets the floor and a
//! one sample correction is spread over a repeating cycle with a running
//! remainder, so the cycle always sums to exactly `f * C * den / num`.
//!
//! All arithmetic is exact (64 bit integers), so cumulative offsets never
//! drift however far the position is from zero.
//!
//! Broadcast formats at 48kHz use fixed tables for the NTSC family of rates;
//! these are selected with [`Cadence`].

use crate::entities::frame::{Rational, gcd};

/// Sample distribution policy for the NTSC family at 48kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    /// Running remainder pattern for every rate
    Computed,
    /// IMX / D10 tables
    #[default]
    Imx,
    /// DV tables
    Dv,
}

impl std::str::FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "computed" => Ok(Cadence::Computed),
            "imx" => Ok(Cadence::Imx),
            "dv" => Ok(Cadence::Dv),
            other => Err(format!("unknown cadence '{}' (computed, imx, dv)", other)),
        }
    }
}

const NTSC: Rational = Rational::new(30000, 1001);
const P60: Rational = Rational::new(60000, 1001);
const P24: Rational = Rational::new(24000, 1001);

/// Fixed 48kHz table for the rate, if the cadence defines one
fn table(frequency: i32, fps: Rational, cadence: Cadence) -> Option<&'static [i64]> {
    if frequency != 48000 {
        return None;
    }
    match (cadence, fps) {
        (Cadence::Imx, NTSC) => Some(&[1602, 1601, 1602, 1601, 1602]),
        (Cadence::Dv, NTSC) => Some(&[1600, 1602, 1602, 1602, 1602]),
        (Cadence::Imx, P60) => Some(&[800, 801, 801, 801, 801]),
        // DV pairs p60 frames into one block: 10 frames per cycle
        (Cadence::Dv, P60) => Some(&[800, 800, 801, 801, 801, 801, 801, 801, 801, 801]),
        // 23.976 carries 2002 samples per frame in both families
        (Cadence::Imx | Cadence::Dv, P24) => Some(&[2002]),
        _ => None,
    }
}

/// Repeating sample pattern for one frequency/rate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    /// Frames per cycle
    pub length: i64,
    /// Samples every frame receives before correction
    pub base: i64,
    /// Correction applied to the frames that receive one (+1, or 0 for integral rates)
    pub deficit: i64,
    /// Samples in one full cycle
    pub samples: i64,
}

/// Computed pattern in reduced form: `p / q` samples per frame
#[derive(Debug, Clone, Copy)]
struct Spread {
    p: i64,
    q: i64,
}

impl Spread {
    fn new(frequency: i32, fps: Rational) -> Option<Self> {
        if frequency <= 0 || !fps.is_valid() {
            return None;
        }
        let p = frequency as i64 * fps.den as i64;
        let q = fps.num as i64;
        let g = gcd(p, q);
        Some(Self { p: p / g, q: q / g })
    }

    fn base(&self) -> i64 {
        self.p / self.q
    }

    fn rem(&self) -> i64 {
        self.p % self.q
    }

    fn length(&self) -> i64 {
        if self.rem() == 0 { 1 } else { self.q }
    }

    /// Samples before in-cycle frame `n` (0 <= n <= length)
    fn offset_in_cycle(&self, n: i64) -> i64 {
        if n == 0 {
            return 0;
        }
        let (q, r) = (self.q, self.rem());
        let first = i64::from(2 * r > q);
        // round(r * (n - 1) / q) with halves rounded up
        n * self.base() + first + (2 * r * (n - 1) + q) / (2 * q)
    }

    fn samples_to_frame(&self, position: i64) -> i64 {
        let length = self.length();
        let cycles = position.div_euclid(length);
        cycles * self.p * length / self.q + self.offset_in_cycle(position.rem_euclid(length))
    }
}

fn table_samples_to_frame(cycle: &[i64], position: i64) -> i64 {
    let length = cycle.len() as i64;
    let total: i64 = cycle.iter().sum();
    let partial: i64 = cycle[..position.rem_euclid(length) as usize].iter().sum();
    position.div_euclid(length) * total + partial
}

/// Samples carried by the frame at `position` (0 for invalid input)
pub fn samples_for_frame(position: i32, frequency: i32, fps_num: i32, fps_den: i32) -> i32 {
    samples_for_frame_with(position, frequency, fps_num, fps_den, Cadence::default())
}

/// Sample offset of the first sample of the frame at `position` (0 for invalid input)
pub fn samples_to_frame(position: i32, frequency: i32, fps_num: i32, fps_den: i32) -> i64 {
    samples_to_frame_with(position, frequency, fps_num, fps_den, Cadence::default())
}

pub fn samples_for_frame_with(position: i32, frequency: i32, fps_num: i32, fps_den: i32, cadence: Cadence) -> i32 {
    let fps = Rational::new(fps_num, fps_den);
    if let Some(cycle) = table(frequency, fps.reduced(), cadence) {
        return cycle[(position as i64).rem_euclid(cycle.len() as i64) as usize] as i32;
    }
    match Spread::new(frequency, fps) {
        Some(spread) => {
            let n = position as i64;
            (spread.samples_to_frame(n + 1) - spread.samples_to_frame(n)) as i32
        }
        None => 0,
    }
}

pub fn samples_to_frame_with(position: i32, frequency: i32, fps_num: i32, fps_den: i32, cadence: Cadence) -> i64 {
    let fps = Rational::new(fps_num, fps_den);
    if let Some(cycle) = table(frequency, fps.reduced(), cadence) {
        return table_samples_to_frame(cycle, position as i64);
    }
    Spread::new(frequency, fps).map_or(0, |spread| spread.samples_to_frame(position as i64))
}

/// Cycle description for the default cadence
pub fn cycle(frequency: i32, fps_num: i32, fps_den: i32) -> Cycle {
    cycle_with(frequency, fps_num, fps_den, Cadence::default())
}

pub fn cycle_with(frequency: i32, fps_num: i32, fps_den: i32, cadence: Cadence) -> Cycle {
    let fps = Rational::new(fps_num, fps_den);
    if let Some(cycle) = table(frequency, fps.reduced(), cadence) {
        let base = cycle.iter().copied().min().unwrap_or(0);
        let samples: i64 = cycle.iter().sum();
        return Cycle {
            length: cycle.len() as i64,
            base,
            deficit: i64::from(cycle.iter().any(|&s| s != base)),
            samples,
        };
    }
    match Spread::new(frequency, fps) {
        Some(spread) => Cycle {
            length: spread.length(),
            base: spread.base(),
            deficit: i64::from(spread.rem() != 0),
            samples: spread.samples_to_frame(spread.length()),
        },
        None => Cycle {
            length: 1,
            base: 0,
            deficit: 0,
            samples: 0,
        },
    }
}

/// Position at rate `to` corresponding to the start of `position` at rate `from`
pub fn map(position: i32, from: Rational, to: Rational) -> f64 {
    if !from.is_valid() || !to.is_valid() {
        return 0.0;
    }
    let t1 = from.num as f64 * to.den as f64;
    let t2 = to.num as f64 * from.den as f64;
    position as f64 * (t2 / t1)
}

/// First `to` position overlapping `position` at rate `from`
pub fn map_first(position: i32, from: Rational, to: Rational) -> i32 {
    if !from.is_valid() || !to.is_valid() {
        return 0;
    }
    let n = position as i64 * to.num as i64 * from.den as i64;
    let d = from.num as i64 * to.den as i64;
    n.div_euclid(d) as i32
}

/// Last `to` position overlapping `position` at rate `from`
pub fn map_last(position: i32, from: Rational, to: Rational) -> i32 {
    if !from.is_valid() || !to.is_valid() {
        return 0;
    }
    let n = (position as i64 + 1) * to.num as i64 * from.den as i64;
    let d = from.num as i64 * to.den as i64;
    // ceil(n / d) - 1
    (n.div_euclid(d) + i64::from(n.rem_euclid(d) != 0) - 1) as i32
}
