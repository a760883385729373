use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use raw_thumbnailer::config::{PipelineConfig, StoreConfig};
use raw_thumbnailer::raw::loader;
use raw_thumbnailer::{
    AssetId, ChannelObserver, DerivativeKind, FileSource, PipelineEvent, Priority, RawCodec,
    RequestStatus, ThumbnailPipelineService,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "raw-thumbnailer", version)]
#[command(about = "Generate cached thumbnails and previews for a folder of RAW photos")]
struct Cli {
    /// Folder to scan (recursively)
    folder: PathBuf,

    /// JSON pipeline config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Derivative tier: thumb (256px), instant (384px) or working (1280px)
    #[arg(long)]
    kind: Option<DerivativeKind>,

    /// Concurrent codec calls (1-3)
    #[arg(long)]
    workers: Option<usize>,

    /// Durable store backing the cache
    #[arg(long, value_enum)]
    store: Option<StoreArg>,

    /// How many files (in path order) to request at Visible priority
    #[arg(long, default_value_t = 24)]
    visible: usize,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum StoreArg {
    Memory,
    Disk,
    Sqlite,
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(kind) = self.kind {
            config.kind = kind;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        // Keep a configured location when the flag names the same store type
        config.store = match (self.store, config.store) {
            (None, store) => store,
            (Some(StoreArg::Memory), _) => StoreConfig::Memory,
            (Some(StoreArg::Disk), store @ StoreConfig::Disk { .. }) => store,
            (Some(StoreArg::Disk), _) => StoreConfig::Disk { dir: None },
            (Some(StoreArg::Sqlite), store @ StoreConfig::Sqlite { .. }) => store,
            (Some(StoreArg::Sqlite), _) => StoreConfig::Sqlite { path: None },
        };

        config.validate()?;
        Ok(config)
    }
}

/// Supported files under `folder`, in path order.
fn scan_folder(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && loader::is_supported(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

#[derive(Debug, Default)]
struct Summary {
    ready: usize,
    failed: usize,
    bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    raw_thumbnailer::logging::init_logging(cli.verbose)?;

    let config = cli.pipeline_config()?;
    let store = config
        .store
        .open(config.kind)
        .await
        .context("opening durable store")?;
    info!(store = store.name(), kind = ?config.kind, "store ready");

    let files = scan_folder(&cli.folder);
    if files.is_empty() {
        println!("No supported images found in {}", cli.folder.display());
        return Ok(());
    }
    info!(count = files.len(), folder = %cli.folder.display(), "scanned folder");

    let (observer, mut events) = ChannelObserver::channel();
    let pipeline = ThumbnailPipelineService::builder(Arc::new(RawCodec::new()))
        .config(config)
        .store(store)
        .observer(Arc::new(observer))
        .start()?;

    let started = Instant::now();
    let mut remaining: VecDeque<(usize, PathBuf)> = files.into_iter().enumerate().collect();
    let total = remaining.len();
    let mut outstanding = 0usize;
    let mut summary = Summary::default();

    loop {
        // Feed until the queue pushes back; Visible files go first, so a
        // full queue never evicts anything we are waiting for.
        while let Some((index, path)) = remaining.pop_front() {
            let priority = if index < cli.visible {
                Priority::Visible
            } else {
                Priority::Preload
            };
            let asset = AssetId::new(path.to_string_lossy());
            let source = Arc::new(FileSource::new(&path));
            match pipeline.request(asset, source, priority, None) {
                RequestStatus::QueueFull => {
                    remaining.push_front((index, path));
                    break;
                }
                status => {
                    debug!(path = %path.display(), ?status, "requested");
                    outstanding += 1;
                }
            }
        }

        if outstanding == 0 {
            break;
        }

        let Some(event) = events.recv().await else {
            warn!("event channel closed early");
            break;
        };
        outstanding -= 1;
        match event {
            PipelineEvent::Ready { handle, .. } => {
                summary.ready += 1;
                summary.bytes += handle.bytes().len();
            }
            PipelineEvent::Failed { asset, error } => {
                summary.failed += 1;
                eprintln!("failed: {asset}: {error}");
            }
        }
    }

    let stats = pipeline.stats();
    pipeline.shutdown().await;

    println!(
        "{} of {} ready, {} failed, {} KB in {:.1?}",
        summary.ready,
        total,
        summary.failed,
        summary.bytes / 1024,
        started.elapsed()
    );
    println!(
        "cache: {} memory hits, {} durable hits, {} durable misses, {} evictions",
        stats.cache.memory_hits,
        stats.cache.durable_hits,
        stats.cache.durable_misses,
        stats.cache.evictions
    );

    Ok(())
}
