//! Command line interface
//!
//! - `cadence` - sample distribution and audio blocks for a rate
//! - `play` - speculative decode of a synthetic source, forwards or backwards
//! - `graph` - fork a synthetic source and dump the rewired branches

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::{Cadence, Calculator, cycle_with};
use crate::config::{EngineConfig, ForkConfig};
use crate::core::CacheRegistry;
use crate::entities::keys::{O_SOLO, O_THREADS};
use crate::entities::{Rational, Source, SourceRef};
use crate::stages::{Conform, Fork, FrameRate, Nudger, Pattern, PatternSpec, Scheduler, dump};

/// Frame sharing, fan-out and speculative decode for pull graphs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Write the log to a file instead of stderr
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// JSON configuration file (overrides FRAMEFORK_CONFIG)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print samples per frame and audio blocks for a frame rate
    Cadence {
        /// Frame rate: 25, 30000/1001, 24000:1001
        #[arg(value_name = "FPS")]
        fps: Rational,

        /// Sample rate (default from config)
        #[arg(short = 'r', long = "frequency")]
        frequency: Option<i32>,

        /// computed, imx or dv (default from config)
        #[arg(long)]
        cadence: Option<Cadence>,

        /// Frames to print
        #[arg(short = 'n', long = "frames", default_value_t = 10)]
        frames: i32,

        /// Rate audio packets are muxed at
        #[arg(long = "packet-rate", value_name = "FPS")]
        packet_rate: Option<Rational>,

        /// Encoder lead-in in samples
        #[arg(long = "lead-in", default_value_t = 0)]
        lead_in: i64,
    },

    /// Pull frames through a scheduler over a synthetic source
    Play {
        /// Frames in the source
        #[arg(short = 'n', long = "frames", default_value_t = 100)]
        frames: i32,

        /// Worker threads (-1 auto, 0 pass-through; default from config)
        #[arg(short = 't', long = "threads", allow_hyphen_values = true)]
        threads: Option<i64>,

        /// Simulated decode cost per frame
        #[arg(short = 'd', long = "delay-ms", default_value_t = 10)]
        delay_ms: u64,

        /// Play backwards from the last frame
        #[arg(long)]
        reverse: bool,
    },

    /// Fork a synthetic source and dump the branch graphs
    Graph {
        /// Number of branches
        #[arg(short = 'b', long = "branches", default_value_t = 2)]
        branches: usize,

        /// Rate of the first branch (conformed back to the source rate)
        #[arg(long = "branch-fps", value_name = "FPS")]
        branch_fps: Option<Rational>,

        /// Return the frame of this branch
        #[arg(long, default_value_t = 0)]
        solo: i64,
    },
}

/// Run the selected subcommand
pub fn run(args: &Args, config: &EngineConfig) -> Result<()> {
    match &args.command {
        Command::Cadence {
            fps,
            frequency,
            cadence,
            frames,
            packet_rate,
            lead_in,
        } => run_cadence(
            *fps,
            frequency.unwrap_or(config.timing.frequency),
            cadence.unwrap_or(config.timing.cadence),
            *frames,
            *packet_rate,
            *lead_in,
        ),
        Command::Play {
            frames,
            threads,
            delay_ms,
            reverse,
        } => run_play(config, *frames, *threads, Duration::from_millis(*delay_ms), *reverse),
        Command::Graph {
            branches,
            branch_fps,
            solo,
        } => run_graph(config, *branches, *branch_fps, *solo),
    }
}

fn run_cadence(
    fps: Rational,
    frequency: i32,
    cadence: Cadence,
    frames: i32,
    packet_rate: Option<Rational>,
    lead_in: i64,
) -> Result<()> {
    if !fps.is_valid() || frequency <= 0 {
        bail!("invalid rate {} at {} Hz", fps, frequency);
    }
    let cycle = cycle_with(frequency, fps.num, fps.den, cadence);
    println!(
        "{} fps @ {} Hz ({:?}): cycle of {} frames, {} samples",
        fps, frequency, cadence, cycle.length, cycle.samples
    );

    let mut calculator = Calculator::new(fps, frequency).with_cadence(cadence).with_lead_in(lead_in);
    if let Some(rate) = packet_rate {
        calculator = calculator.with_packet_rate(rate);
    }
    println!("{:>8} {:>8} {:>12} {:>8} {:>8} {:>8}", "frame", "samples", "first", "packet", "packets", "discard");
    for position in 0..frames {
        let block = calculator
            .calculate(position)
            .with_context(|| format!("no audio block for frame {}", position))?;
        println!(
            "{:>8} {:>8} {:>12} {:>8} {:>8} {:>8}",
            block.position, block.samples, block.first, block.first_packet, block.packets, block.discard
        );
    }
    Ok(())
}

fn run_play(config: &EngineConfig, frames: i32, threads: Option<i64>, delay: Duration, reverse: bool) -> Result<()> {
    let pattern = Pattern::new(PatternSpec {
        frames,
        delay,
        deferred: true,
        frequency: config.timing.frequency,
        cadence: config.timing.cadence,
        ..PatternSpec::default()
    });
    let registry = Arc::new(CacheRegistry::new());
    let scheduler = Scheduler::with_config(Arc::clone(&registry), &config.scheduler);
    if let Some(threads) = threads {
        scheduler.set_option(O_THREADS, threads)?;
    }
    scheduler.connect(Arc::new(pattern), 0)?;
    scheduler.sync()?;

    let order: Vec<i32> = if reverse {
        (0..scheduler.frames()).rev().collect()
    } else {
        (0..scheduler.frames()).collect()
    };

    let start = Instant::now();
    let mut served = 0;
    for position in order {
        match scheduler.fetch_at(position)? {
            Some(frame) => {
                served += 1;
                debug!(
                    "frame {} ({} samples, reversed audio: {:?})",
                    frame.position(),
                    frame.audio().map_or(0, |a| a.samples),
                    frame.audio_reversed()
                );
            }
            None => info!("frame {} unavailable", position),
        }
    }
    let elapsed = start.elapsed();
    println!(
        "{} of {} frames in {:.1?} ({:.1} fps, {} threaded)",
        served,
        scheduler.frames(),
        elapsed,
        served as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        if scheduler.is_threaded() { "" } else { "not" }
    );
    Ok(())
}

fn run_graph(config: &EngineConfig, branches: usize, branch_fps: Option<Rational>, solo: i64) -> Result<()> {
    if branches == 0 {
        bail!("a fork needs at least one branch");
    }
    let fork = Fork::with_config(&ForkConfig {
        slots: branches,
        ..config.fork
    });
    fork.connect(Arc::new(Pattern::new(PatternSpec::default())), 0)?;

    for slot in 1..=branches {
        let mut branch: SourceRef = Arc::new(Nudger::with_config(&config.nudger));
        if let Some(fps) = branch_fps.filter(|_| slot == 1) {
            let rate = FrameRate::new(fps);
            rate.connect(branch, 0)?;
            branch = Arc::new(rate);
        }
        let conform = Conform::new();
        conform.connect(branch, 0)?;
        fork.connect(Arc::new(conform), slot)?;
    }
    fork.set_option(O_SOLO, solo)?;
    fork.sync()?;

    for slot in 1..=branches {
        let branch = fork.branch(slot).context("fork has no rewired branch")?;
        println!("# branch {}", slot);
        println!("{}", dump(&branch));
    }
    let frame = fork.fetch_at(0)?.context("fork produced no frame")?;
    println!(
        "# frame {} at {} fps, image: {}, audio samples: {}",
        frame.position(),
        frame.fps(),
        frame.has_image(),
        frame.audio().map_or(0, |a| a.samples)
    );
    Ok(())
}
