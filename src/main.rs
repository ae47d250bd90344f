//! Command-line driver: walks image directories, pushes every picture through
//! the pipeline with one receiver each, then detaches and re-attaches them all
//! to exercise cache and salvage reuse.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use imagepipe::cache::{BufferCache, MemoryPressure};
use imagepipe::config::Configuration;
use imagepipe::events::CoordinatorStats;
use imagepipe::memory::MemoryClass;
use imagepipe::processing::decode::ImageDecoder;
use imagepipe::receiver::{DisplayState, Receiver};
use imagepipe::spec::{ImageSpec, ScaleType, ScopeId, SpecFlags};
use imagepipe::tasks::coordinator;
use imagepipe::tasks::transport::{scan_images, LocalFileTransport};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Pressure {
    Moderate,
    High,
    Critical,
}

impl From<Pressure> for MemoryPressure {
    fn from(p: Pressure) -> Self {
        match p {
            Pressure::Moderate => MemoryPressure::Moderate,
            Pressure::High => MemoryPressure::High,
            Pressure::Critical => MemoryPressure::Critical,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "imagepipe",
    version,
    about = "Decode a directory of images through the caching pipeline"
)]
struct Args {
    /// Directories to scan recursively for images
    #[arg(value_name = "DIR", required = true)]
    inputs: Vec<PathBuf>,
    /// Path to YAML config; built-in defaults when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Longest edge of the decoded pictures
    #[arg(long, default_value_t = 256)]
    size: u32,
    /// Cover the size instead of fitting inside it
    #[arg(long)]
    crop: bool,
    /// Center-crop results to squares
    #[arg(long)]
    square: bool,
    /// Decode straight from disk instead of going through the transport
    #[arg(long)]
    direct: bool,
    /// Memory pressure to signal while every receiver is detached
    #[arg(long, value_enum)]
    pressure: Option<Pressure>,
    /// Give up on a picture after this long
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    timeout: Duration,
    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Default, Serialize)]
struct PassSummary {
    displayed: usize,
    failed: usize,
    timed_out: usize,
}

#[derive(Debug, Serialize)]
struct Summary {
    images: usize,
    first_pass: PassSummary,
    second_pass: PassSummary,
    decodes_for_second_pass: u64,
    stats: CoordinatorStats,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let level = match verbosity {
        0 => None,
        1 => Some("imagepipe=debug"),
        _ => Some("imagepipe=trace"),
    };
    if let Some(directive) = level {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

async fn settle_all(receivers: &mut [Receiver], timeout: Duration) -> PassSummary {
    let mut summary = PassSummary::default();
    for receiver in receivers.iter_mut() {
        match tokio::time::timeout(timeout, receiver.settle()).await {
            Ok(DisplayState::Displaying) => summary.displayed += 1,
            Ok(_) => {
                if let (Some(spec), Some(err)) = (receiver.spec(), receiver.last_error()) {
                    warn!(key = %spec.cache_key(), error = %err, "picture failed");
                }
                summary.failed += 1;
            }
            Err(_) => summary.timed_out += 1,
        }
    }
    summary
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let cfg = match &args.config {
        Some(path) => Configuration::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Configuration::default(),
    }
    .validated()
    .context("invalid configuration values")?;

    let images = scan_images(&args.inputs);
    if images.is_empty() {
        bail!("no images found under {:?}", args.inputs);
    }
    info!(count = images.len(), "scanned images");

    let budget = MemoryClass::detect().budget(&cfg.cache);
    info!(budget, "cache budget");
    let cache = BufferCache::new(budget);

    let transport = LocalFileTransport::new(&args.inputs[0]);
    let mut flags = SpecFlags::NONE;
    if args.square {
        flags |= SpecFlags::SQUARE;
    }
    let scale = if args.crop { ScaleType::Crop } else { ScaleType::Fit };
    let specs: Vec<ImageSpec> = images
        .iter()
        .enumerate()
        .map(|(idx, path)| {
            let spec = if args.direct {
                ImageSpec::local(path)
            } else {
                let file_id = idx as i64 + 1;
                transport.register(file_id, path);
                ImageSpec::remote(ScopeId(1), file_id)
            };
            spec.with_size(args.size).with_scale(scale).with_flags(flags)
        })
        .collect();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let decoder = Arc::new(ImageDecoder::new(cfg.decode.clone()));
    let (coordinator, handle) =
        coordinator::spawn(&cfg, cache.clone(), Arc::new(transport), decoder, cancel.clone())?;

    let mut receivers: Vec<Receiver> = specs
        .into_iter()
        .map(|spec| {
            let mut receiver = Receiver::new(&coordinator, &cfg.fade);
            receiver.set_spec(Some(spec));
            receiver
        })
        .collect();
    let first_pass = settle_all(&mut receivers, args.timeout).await;
    info!(?first_pass, "first pass done");

    let before = coordinator.stats().await?;
    for receiver in &mut receivers {
        receiver.detach();
    }
    if let Some(level) = args.pressure {
        cache.on_memory_pressure(level.into());
    }
    for receiver in &mut receivers {
        receiver.attach();
    }
    let second_pass = settle_all(&mut receivers, args.timeout).await;
    let stats = coordinator.stats().await?;
    info!(?second_pass, "second pass done");

    let summary = Summary {
        images: images.len(),
        first_pass,
        second_pass,
        decodes_for_second_pass: stats.decodes_dispatched - before.decodes_dispatched,
        stats,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} images: {} shown, {} failed, {} timed out; re-attach needed {} decodes",
            summary.images,
            summary.first_pass.displayed,
            summary.first_pass.failed,
            summary.first_pass.timed_out,
            summary.decodes_for_second_pass
        );
        let c = &summary.stats.cache;
        println!(
            "cache: {} hits, {} salvaged, {} misses, {} evicted, {} resident bytes of {}",
            c.hits, c.salvage_hits, c.misses, c.evictions, c.resident_bytes, c.budget
        );
    }

    drop(receivers);
    coordinator.shutdown();
    handle.await.context("coordinator task panicked")??;
    Ok(())
}
