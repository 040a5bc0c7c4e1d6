//! Stream Recorder Application
//!
//! Records an MPEG-TS stream received over UDP or RTP into rotating files.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ts_recorder::{
    config::{AddressFamily, AppConfig},
    Recorder,
};

#[derive(Parser, Debug)]
#[command(name = "ts-recorder")]
#[command(about = "Record an MPEG-TS stream from UDP/RTP into rotating files")]
#[command(version)]
struct Args {
    /// File name prefix
    #[arg(short = 'n', long)]
    prefix: Option<String>,

    /// Rotation interval in seconds
    #[arg(short, long)]
    seconds: Option<u64>,

    /// Output directory
    #[arg(short = 'd', long)]
    output_dir: Option<PathBuf>,

    /// Save files in subdirs YYYY/MM/DD/HH/file
    #[arg(short = 'D', long)]
    create_dirs: bool,

    /// Where to read from: udp://224.0.0.1:5000, rtp://[ff01::1111]:5000
    #[arg(short, long)]
    input: Option<String>,

    /// Do not report RTP discontinuity errors in input
    #[arg(short = 'z', long)]
    input_ignore_disc: bool,

    /// Use only IPv4 addresses
    #[arg(short = '4', long, conflicts_with = "ipv6")]
    ipv4: bool,

    /// Use only IPv6 addresses
    #[arg(short = '6', long)]
    ipv6: bool,

    /// Config file (TOML); defaults to the per-user config if present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, config: &mut AppConfig) {
        if let Some(prefix) = &self.prefix {
            config.output.prefix = Some(prefix.clone());
        }
        if let Some(seconds) = self.seconds {
            config.output.rotate_secs = seconds;
        }
        if let Some(dir) = &self.output_dir {
            config.output.dir = dir.clone();
        }
        if self.create_dirs {
            config.output.create_dirs = true;
        }
        if let Some(input) = &self.input {
            config.input.url = Some(input.clone());
        }
        if self.input_ignore_disc {
            config.input.report_discontinuity = false;
        }
        if self.ipv4 {
            config.input.family = AddressFamily::V4;
        } else if self.ipv6 {
            config.input.family = AddressFamily::V6;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load config file, then let flags override it
    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load_default()?,
    };
    args.apply(&mut config);

    let recorder = Recorder::new(config)?;
    let config = recorder.config();

    tracing::info!("Start ts-recorder v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Prefix     : {}", config.prefix()?);
    tracing::info!("Input addr : {}", recorder.input());
    tracing::info!("Seconds    : {}", config.output.rotate_secs);
    tracing::info!(
        "Output dir : {} (create directories: {})",
        config.output.dir.display(),
        if config.output.create_dirs { "YES" } else { "no" }
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        // A second signal while draining means the user wants out now.
        if !r.swap(false, Ordering::SeqCst) {
            std::process::exit(130);
        }
        tracing::info!("Shutdown requested, flushing buffers");
    })?;

    let stats = recorder.run(&running)?;

    tracing::info!(
        "Stop ts-recorder (bytes_processed:{})",
        stats.capture.bytes_read
    );
    tracing::info!(
        "  Datagrams: {}, packets written: {}, files: {} created / {} appended",
        stats.capture.datagrams,
        stats.writer.packets_written,
        stats.writer.rotation.files_created,
        stats.writer.rotation.files_appended
    );
    if stats.capture.rtp_discontinuities > 0 {
        tracing::info!(
            "  RTP discontinuities: {} ({} datagrams lost)",
            stats.capture.rtp_discontinuities,
            stats.capture.rtp_lost
        );
    }
    if stats.writer.rotation.write_failures > 0 || stats.writer.rotation.open_failures > 0 {
        tracing::warn!(
            "  Write failures: {}, open failures: {}, bytes dropped: {}",
            stats.writer.rotation.write_failures,
            stats.writer.rotation.open_failures,
            stats.writer.rotation.bytes_dropped
        );
    }
    if stats.overflow_packets > 0 {
        tracing::info!(
            "  Writer fell behind: {} overflow packets, max queue depth {}",
            stats.overflow_packets,
            stats.writer.max_queue_depth
        );
    }

    Ok(())
}
