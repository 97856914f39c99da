//! `skywatch` command-line frontend.
//!
//! Analyses a pre-recorded raw video file: detects moving objects and
//! writes time-lapse stacks and event products into the output directory.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;

use skywatch::config::ObserverConfig;
use skywatch::mask::Mask;
use skywatch::observer::Observer;
use skywatch::products::ProductWriter;
use skywatch::source::{FrameSource, RawVideoSource};

/// Observe and analyse a raw video stream.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Input raw video file (.vid)
    #[arg(short, long)]
    input: PathBuf,

    /// Observatory id stamped into product filenames and metadata
    #[arg(short, long, default_value = "obs0")]
    obstory: String,

    /// Output directory for analysis products
    #[arg(short = 'd', long, default_value = "datadir")]
    output: PathBuf,

    /// Polygon mask file restricting where triggers may occur
    #[arg(short, long)]
    mask: Option<PathBuf>,

    /// JSON configuration file; defaults apply for missing keys
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frame rate of the recording
    #[arg(short, long, default_value_t = 24.71)]
    fps: f64,

    /// UTC second of the first frame; defaults to now
    #[arg(long)]
    utc_start: Option<f64>,

    /// Directory label distinguishing analysis runs (live / nonlive)
    #[arg(short, long, default_value = "nonlive")]
    label: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ObserverConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ObserverConfig::default(),
    };

    let utc_start = args.utc_start.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    });

    let mut source = RawVideoSource::open(&args.input, args.fps, utc_start)
        .with_context(|| format!("opening {}", args.input.display()))?;
    let (width, height) = (source.width(), source.height());

    let mask = match &args.mask {
        Some(path) => Mask::from_polygon_file(path, width, height)
            .with_context(|| format!("loading mask {}", path.display()))?,
        None => Mask::allow_all(width, height),
    };

    let products = ProductWriter::new(&args.output, &args.obstory, &args.label);
    let mut observer = Observer::new(config, width, height, args.fps, mask, products);

    let stop = observer.stop_flag();
    ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
        .context("installing SIGINT handler")?;

    observer.run(&mut source)?;
    log::info!("Analysis complete: {} frames processed.", observer.frame_counter());
    Ok(())
}
