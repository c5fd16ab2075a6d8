//! tiledem - build composite elevation tiles from RGB-encoded DEM providers.
//!
//! ```text
//! tiledem fetch --bbox 139.76,35.67,139.78,35.69 --primary qmap_dem --out dem_out
//! tiledem tiles --bbox 139.76,35.67,139.78,35.69 --zoom 15
//! tiledem sources
//! tiledem inspect dem_out/tile_17_116423_51613.tif
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tiledem::{
    http_fetcher_factory, read_geotiff, CancelToken, Config, GeoExtent, JobProgress, ManifestExport, MosaicBuilder,
    ProgressCallback, TileJobScheduler, TileStage,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Rough wall time per tile, used for the estimate printed by `tiles`.
const SECONDS_PER_TILE: f64 = 0.15;

#[derive(Parser)]
#[command(name = "tiledem", version)]
#[command(about = "Composite elevation tiles from RGB-encoded DEM providers", long_about = None)]
struct Cli {
    /// Log filter, overriding RUST_LOG (e.g. "debug" or "tiledem=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch and composite every tile covering a bounding box
    Fetch(FetchArgs),
    /// List the configured tile sources
    Sources {
        /// YAML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show the tile range for a bounding box without downloading
    Tiles(TilesArgs),
    /// Print a summary of a GeoTIFF tile
    Inspect {
        /// GeoTIFF written by `fetch`
        file: PathBuf,
    },
}

#[derive(Args)]
struct TilesArgs {
    /// Bounding box as lon_min,lat_min,lon_max,lat_max
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
    bbox: GeoExtent,

    /// Primary source key
    #[arg(long, default_value = "qmap_dem")]
    primary: String,

    /// Output zoom (defaults to the primary source's native zoom)
    #[arg(long)]
    zoom: Option<u8>,

    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads (overrides the configuration)
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    tiles: TilesArgs,

    /// Target CRS recorded in the manifest
    #[arg(long, default_value = "EPSG:4326")]
    crs: String,

    /// Output directory
    #[arg(long)]
    out: PathBuf,

    /// Per-request timeout in seconds (overrides the configuration)
    #[arg(long)]
    timeout: Option<u64>,
}

fn parse_bbox(s: &str) -> std::result::Result<GeoExtent, String> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{}': {}", p.trim(), e)))
        .collect::<std::result::Result<_, _>>()?;
    match parts[..] {
        [lon_min, lat_min, lon_max, lat_max] => Ok(GeoExtent::new(lon_min, lat_min, lon_max, lat_max)),
        _ => Err("expected lon_min,lat_min,lon_max,lat_max".to_string()),
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(path: Option<&Path>, workers: Option<usize>) -> Result<Config> {
    let mut config = Config::load_or_default(path)
        .with_context(|| format!("loading configuration {}", path.map(|p| p.display().to_string()).unwrap_or_default()))?;
    if let Some(workers) = workers {
        config.scheduler.max_workers = workers;
    }
    Ok(config)
}

fn scheduler_for(config: &Config) -> Result<TileJobScheduler> {
    config.validate()?;
    Ok(TileJobScheduler::new(
        config.catalog(),
        config.scheduler.max_workers,
        config.tile_side,
    )?)
}

fn cmd_tiles(args: &TilesArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), args.workers)?;
    let scheduler = scheduler_for(&config)?;
    let range = scheduler.plan_extent(&args.bbox, &args.primary, args.zoom)?;

    let estimate = SECONDS_PER_TILE * range.len() as f64 / scheduler.workers() as f64;
    println!("Zoom:      {}", range.zoom);
    println!("Columns:   {}..={} ({})", range.x0, range.x1, range.width());
    println!("Rows:      {}..={} ({})", range.y0, range.y1, range.height());
    println!("Tiles:     {}", range.len());
    println!("Estimate:  {:.1} s with {} workers", estimate, scheduler.workers());
    Ok(())
}

fn cmd_fetch(args: &FetchArgs) -> Result<()> {
    let tiles = &args.tiles;
    let mut config = load_config(tiles.config.as_deref(), tiles.workers)?;
    if let Some(timeout) = args.timeout {
        config.fetch.timeout_secs = timeout;
    }
    let scheduler = scheduler_for(&config)?;

    // Configuration problems surface here, before any request is sent.
    let range = scheduler.plan_extent(&tiles.bbox, &tiles.primary, tiles.zoom)?;
    info!(
        primary = %tiles.primary,
        zoom = range.zoom,
        tiles = range.len(),
        workers = scheduler.workers(),
        "fetching"
    );

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            warn!("interrupted, letting running tiles finish");
            cancel.cancel();
        })
        .context("installing Ctrl-C handler")?;
    }

    let step = (range.len() / 20).max(1);
    let progress: ProgressCallback = Box::new(move |p: &JobProgress| {
        if p.completed % step == 0 || p.completed == p.total {
            info!(
                completed = p.completed,
                total = p.total,
                failed = p.failed,
                "{:.0}%",
                p.fraction() * 100.0
            );
        }
    });

    let report = scheduler.run_extent(
        &tiles.bbox,
        &tiles.primary,
        Some(range.zoom),
        http_fetcher_factory(config.fetch.clone(), config.tile_side),
        Some(&progress),
        &cancel,
    )?;

    if report.produced.is_empty() {
        bail!("cancelled before any tile was produced");
    }

    let stage = TileStage::new(config.nodata).context("creating staging directory")?;
    let staged = stage.stage_all(&report.produced)?;
    let manifest = ManifestExport::new(&args.out).build(&staged, config.nodata, &args.crs)?;

    println!();
    println!("Produced:  {} of {} tiles", report.produced.len(), report.total);
    println!("No data:   {}", report.failed.len());
    if report.cancelled {
        println!("Skipped:   {} (cancelled)", report.skipped());
    }
    println!("Elapsed:   {:.1} s", report.elapsed.as_secs_f64());
    println!("Manifest:  {}", manifest.display());
    Ok(())
}

fn cmd_sources(config: Option<&Path>) -> Result<()> {
    let config = load_config(config, None)?;
    let catalog = config.catalog();
    catalog.validate()?;

    for source in &catalog.sources {
        let role = if source.key == catalog.supplemental {
            "supplemental".to_string()
        } else if let Some(i) = catalog.fallbacks.iter().position(|k| *k == source.key) {
            format!("fallback {}", i + 1)
        } else {
            String::new()
        };
        println!(
            "{:<12} z{:<3} {:<17} {:<13} {}",
            source.key,
            source.native_zoom,
            serde_name(source.decode_format),
            role,
            source.name
        );
    }
    Ok(())
}

fn serde_name(format: tiledem::DecodeFormat) -> &'static str {
    match format {
        tiledem::DecodeFormat::GsiRgb24bit => "GSI_RGB_24BIT",
        tiledem::DecodeFormat::QmapRgbScaled => "QMAP_RGB_SCALED",
        tiledem::DecodeFormat::AlphaMaskedRgb => "ALPHA_MASKED_RGB",
    }
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let raster = read_geotiff(path).with_context(|| format!("reading {}", path.display()))?;
    let b = &raster.bounds;

    println!("File:      {}", path.display());
    println!("Size:      {} x {}", raster.width, raster.height);
    println!("Bounds:    ({:.2}, {:.2}) - ({:.2}, {:.2}) EPSG:3857", b.minx, b.miny, b.maxx, b.maxy);
    match raster.nodata {
        Some(nd) => println!("NODATA:    {}", nd),
        None => println!("NODATA:    none"),
    }
    println!("Valid:     {:.2}%", raster.valid_fraction() * 100.0);
    match raster.min_max() {
        Some((lo, hi)) => println!("Range:     {:.2} .. {:.2} m", lo, hi),
        None => println!("Range:     no valid samples"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    tiledem_metrics::describe_metrics();

    match &cli.command {
        Command::Fetch(args) => cmd_fetch(args),
        Command::Sources { config } => cmd_sources(config.as_deref()),
        Command::Tiles(args) => cmd_tiles(args),
        Command::Inspect { file } => cmd_inspect(file),
    }
}
