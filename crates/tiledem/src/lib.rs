//! # tiledem
//!
//! Composite elevation rasters from tiled, RGB-encoded DEM providers.
//!
//! Given a geographic extent, a primary source and an output zoom, the crate
//! enumerates the Web Mercator tiles covering the extent and builds one
//! elevation tile per index by merging several providers in priority order.
//!
//! ## Overview
//!
//! ### Height encodings
//!
//! Providers publish heights as PNG or WebP images, packing a value in
//! centimeters into the 24 RGB bits. Three encodings are supported, see
//! [`DecodeFormat`]. Missing data is carried as [`NODATA`] (NaN) in a
//! [`HeightBuffer`].
//!
//! ### Compositing
//!
//! For every output tile the [`CompositeEngine`] tries the primary source,
//! then the catalog's supplemental source, then the fallbacks. Each source
//! is resampled to the output zoom (upsampled from an ancestor tile or
//! downsampled from its descendants, with NODATA-aware interpolation) and
//! may only fill cells that are still empty.
//!
//! A provider that cannot serve a tile is never an error: it yields
//! [`FetchOutcome::Unavailable`] and the next source is tried.
//!
//! ### Batches
//!
//! The [`TileJobScheduler`] runs one composite per tile on a bounded worker
//! pool. Tiles without data are counted and skipped; only a batch that
//! produced nothing fails.
//!
//! ## Example
//!
//! ```no_run
//! use tiledem::{
//!     http_fetcher_factory, CancelToken, Config, GeoExtent, ManifestExport, MosaicBuilder,
//!     TileJobScheduler, TileStage,
//! };
//!
//! let config = Config::default();
//! let scheduler = TileJobScheduler::new(config.catalog(), config.scheduler.max_workers, config.tile_side)?;
//!
//! let extent = GeoExtent::new(139.76, 35.67, 139.78, 35.69);
//! let report = scheduler.run_extent(
//!     &extent,
//!     "qmap_dem",
//!     None,
//!     http_fetcher_factory(config.fetch.clone(), config.tile_side),
//!     None,
//!     &CancelToken::new(),
//! )?;
//! println!("{} tiles, {} without data", report.produced.len(), report.failed.len());
//!
//! let stage = TileStage::new(config.nodata)?;
//! let staged = stage.stage_all(&report.produced)?;
//! let manifest = ManifestExport::new("dem_out").build(&staged, config.nodata, "EPSG:4326")?;
//! println!("wrote {}", manifest.display());
//! # Ok::<(), tiledem::DemError>(())
//! ```

mod composite;
mod config;
mod decode;
mod error;
mod fetch;
mod geo;
mod heights;
mod raster;
mod resample;
mod scheduler;
mod source;
mod stage;

pub use composite::{CompositeEngine, CompositeResult};
pub use config::{Config, DEFAULT_OUTPUT_NODATA};
pub use decode::{decode_heights, decode_image, decode_pixel, encode_gsi, pack_rgb, PixelGrid, HEIGHT_UNIT_M};
pub use error::DemError;
pub use fetch::{
    assess_response, DownloadStats, FetchOutcome, FetchPolicy, HttpTileFetcher, TileFetch, UnavailableReason,
    DEFAULT_MAX_SENTINEL_RATIO, DEFAULT_MIN_BODY_BYTES, DEFAULT_MIN_VALID_FRACTION, DEFAULT_TIMEOUT_SECS,
};
pub use geo::{
    lonlat_to_mercator, lonlat_to_tile, mercator_to_lonlat, tile_bounds_projected, GeoExtent, ProjectedBounds,
    TileIndex, TileRange, EARTH_RADIUS_M, MAX_MERCATOR_LAT, MAX_ZOOM,
};
pub use heights::{is_valid, HeightBuffer, DEFAULT_TILE_SIDE, NODATA};
pub use raster::{read_geotiff, write_geotiff, RasterTile, WEB_MERCATOR_EPSG};
pub use resample::{masked_resize, resize_bilinear, Resampler, MASK_THRESHOLD};
pub use scheduler::{
    default_workers, http_fetcher_factory, BatchReport, CancelToken, JobProgress, ProgressCallback,
    SchedulerConfig, TileJobScheduler, MAX_WORKERS_CAP,
};
pub use source::{AxisOrder, DecodeFormat, SourceCatalog, TileSourceSpec};
pub use stage::{Manifest, ManifestExport, ManifestTile, MosaicBuilder, StagedTile, TileStage, MANIFEST_FILE};

/// Result type for tiledem operations.
pub type Result<T> = std::result::Result<T, DemError>;
