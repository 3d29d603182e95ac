use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bitmill_service::config::Config;
use bitmill_service::decode::LoadRequest;
use bitmill_service::engine::{Engine, Loaded};
use bitmill_service::registry::{CenterCrop, FitCenter, Model, Transformations};
use bitmill_service::resource::Bitmap;
use bitmill_service::types::{DiskCacheStrategy, SIZE_ORIGINAL};
use clap::{Args, ValueEnum};
use futures::future;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    All,
    None,
    Data,
    Resource,
    Automatic,
}

impl From<Strategy> for DiskCacheStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::All => DiskCacheStrategy::All,
            Strategy::None => DiskCacheStrategy::None,
            Strategy::Data => DiskCacheStrategy::Data,
            Strategy::Resource => DiskCacheStrategy::Resource,
            Strategy::Automatic => DiskCacheStrategy::Automatic,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Transform {
    None,
    CenterCrop,
    FitCenter,
}

impl Transform {
    fn transformations(self) -> Transformations {
        match self {
            Transform::None => Transformations::new(),
            Transform::CenterCrop => Transformations::new().with::<Bitmap>(CenterCrop),
            Transform::FitCenter => Transformations::new().with::<Bitmap>(FitCenter),
        }
    }
}

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// The image files to load.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Target width, defaults to the width of the image.
    #[arg(long)]
    pub width: Option<u32>,

    /// Target height, defaults to the height of the image.
    #[arg(long)]
    pub height: Option<u32>,

    /// Which stages of a load are written to the disk cache.
    #[arg(long, value_enum, default_value = "automatic")]
    pub strategy: Strategy,

    #[arg(long, value_enum, default_value = "none")]
    pub transform: Transform,
}

impl LoadArgs {
    fn request(&self, path: PathBuf) -> LoadRequest {
        LoadRequest::new(Model::new(path))
            .size(
                self.width.unwrap_or(SIZE_ORIGINAL),
                self.height.unwrap_or(SIZE_ORIGINAL),
            )
            .disk_cache_strategy(self.strategy.into())
            .transformations(self.transform.transformations())
    }
}

fn describe(loaded: &Loaded) -> String {
    match loaded.resource.downcast_ref::<Bitmap>() {
        Some(bitmap) => format!(
            "{}x{} from {}",
            bitmap.width(),
            bitmap.height(),
            loaded.data_source
        ),
        None => format!("{} bytes from {}", loaded.resource.size(), loaded.data_source),
    }
}

async fn load_all(engine: &Engine, args: &LoadArgs) -> usize {
    let loads = args.paths.iter().map(|path| {
        let request = args.request(path.clone());
        async move {
            let start = Instant::now();
            let result = engine.load_async(request).await;
            (path, result, start.elapsed())
        }
    });

    let mut failed = 0;
    for (path, result, elapsed) in future::join_all(loads).await {
        // whole milliseconds are precise enough
        let elapsed = Duration::from_millis(elapsed.as_millis() as u64);
        let elapsed = humantime::format_duration(elapsed);
        match result {
            Ok(loaded) => {
                println!("{}: {} in {elapsed}", path.display(), describe(&loaded));
                if let Err(error) = engine.release(&loaded.resource) {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to release resource"
                    );
                }
            }
            Err(error) => {
                failed += 1;
                println!("{}: {error}", path.display());
                for cause in error.root_causes() {
                    println!("  caused by: {cause}");
                }
            }
        }
    }
    failed
}

/// Loads every path through a fresh engine.
pub fn run(config: Config, args: LoadArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    let engine = Engine::new(&config);
    let failed = runtime.block_on(load_all(&engine, &args));
    // waits for pending disk cache writes
    engine.shutdown();

    if failed > 0 {
        bail!("{failed} of {} loads failed", args.paths.len());
    }
    Ok(())
}
