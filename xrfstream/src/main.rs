use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xrfcore::data::element::ElementSpecification;
use xrfcore::fitting::parameters::{CalibratedModel, Calibration};
use xrfcore::fitting::roi::RoiFitRoutine;
use xrfcore::simulation::spectrum::SpectrumSimulator;
use xrfcore::stream::accumulator::StreamAccumulator;
use xrfcore::stream::block::FitContext;
use xrfstream::config::StreamerConfig;
use xrfstream::publisher::{PublisherHandle, SpectraNetStreamer};
use xrfstream::source::SyntheticRaster;
use xrfstream::transport::{Transport, ZmqTransport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream per-element XRF counts of synthetic raster scans over ZeroMQ")]
struct Args {
    /// JSON streamer configuration
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Element catalogue (`NAME CENTER_KEV WIDTH_EV` lines, or a .json list)
    #[arg(short = 'e', long)]
    elements: Option<PathBuf>,

    /// Override the publish endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Run without binding the publish socket
    #[arg(long)]
    no_transport: bool,

    #[arg(long, default_value = "1")]
    scans: usize,

    #[arg(long, default_value = "16")]
    rows: usize,

    #[arg(long, default_value = "16")]
    cols: usize,

    #[arg(long, default_value = "4")]
    detectors: u32,

    #[arg(long, default_value = "2048")]
    channels: usize,

    #[arg(long, default_value = "0.0", allow_negative_numbers = true)]
    energy_offset: f64,

    #[arg(long, default_value = "0.01")]
    energy_slope: f64,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    let mut config = match &args.config {
        Some(path) => StreamerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StreamerConfig::default(),
    };
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if args.no_transport {
        config.transport_enabled = false;
    }
    config.validate().context("Invalid streamer configuration")?;

    let elements = match &args.elements {
        Some(path) => ElementSpecification::from_file(path)
            .with_context(|| format!("Failed to load elements from {}", path.display()))?,
        None => ElementSpecification::default_k_lines(),
    };
    info!("Fitting {}", elements);

    let calibration = Calibration::new(args.energy_offset, args.energy_slope);
    let model = Arc::new(CalibratedModel::from_calibration(calibration));
    let elements = Arc::new(elements);

    for (name, bounds) in RoiFitRoutine.roi_bounds(model.as_ref(), args.channels, &elements)? {
        info!("ROI {}: channels {}", name, bounds);
    }

    let transport: Option<Box<dyn Transport>> = if config.transport_enabled {
        let transport = ZmqTransport::bind(&config.endpoint, config.linger_ms, config.send_hwm)
            .with_context(|| format!("Failed to bind {}", config.endpoint))?;
        Some(Box::new(transport))
    } else {
        warn!("Transport disabled, completed records will be discarded");
        None
    };
    let streamer = SpectraNetStreamer::new(transport, &config)?;
    let publisher = PublisherHandle::spawn(streamer, config.queue_capacity)?;

    let sink = publisher.sink();
    let accumulator = StreamAccumulator::new().with_completion_callback(move |block| {
        sink.submit(block);
    });

    let simulator = SpectrumSimulator::new(calibration, args.channels, 500.0, 0.2);
    let mut raster = SyntheticRaster::new(args.rows, args.cols, simulator, args.seed);
    for detector_id in 0..args.detectors {
        raster = raster.with_detector(detector_id, FitContext::new(model.clone(), elements.clone()));
    }

    for scan in 0..args.scans {
        let summary = raster.scan(&accumulator)?;
        info!("Scan {}: {} deliveries, {} rejected", scan, summary.deliveries, summary.rejected);
    }

    let residual = accumulator.shutdown();
    if residual > 0 {
        warn!("{} detector(s) never completed their scan", residual);
    }
    drop(accumulator);

    match publisher.shutdown(config.shutdown_timeout()) {
        Some(stats) => info!("Publisher finished ({})", stats),
        None => warn!("Publisher abandoned after {:?}", config.shutdown_timeout()),
    }

    Ok(())
}
