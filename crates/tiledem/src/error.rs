//! Error types for the tiledem crate.

use thiserror::Error;

/// Errors that can occur while building composite elevation tiles.
///
/// Per-source unavailability is deliberately absent here: a provider that
/// cannot serve a tile yields [`crate::FetchOutcome::Unavailable`] and the
/// composite moves on to the next source.
#[derive(Debug, Error)]
pub enum DemError {
    /// I/O error reading or writing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF encode/decode error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Configuration file could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    /// Manifest could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The geographic extent is empty, inverted or outside the valid domain.
    #[error("Invalid extent ({lon_min}, {lat_min}) - ({lon_max}, {lat_max}): {reason}")]
    InvalidExtent {
        /// Western edge.
        lon_min: f64,
        /// Southern edge.
        lat_min: f64,
        /// Eastern edge.
        lon_max: f64,
        /// Northern edge.
        lat_max: f64,
        /// Why the extent was rejected.
        reason: &'static str,
    },

    /// The extent collapsed to an empty tile range at the requested zoom.
    #[error("Tile range collapsed at zoom {zoom}: x {x0}..{x1}, y {y0}..{y1}")]
    EmptyTileRange {
        /// Zoom level.
        zoom: u8,
        /// First column.
        x0: u32,
        /// Last column.
        x1: u32,
        /// First row.
        y0: u32,
        /// Last row.
        y1: u32,
    },

    /// Invalid zoom level.
    #[error("Invalid zoom level {0} (must be 0-24)")]
    InvalidZoomLevel(u8),

    /// Tile column or row outside `0..2^z`.
    #[error("Tile x={x} y={y} is outside the zoom {z} grid")]
    InvalidTileIndex {
        /// Zoom level.
        z: u8,
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },

    /// The requested output zoom is not the native zoom of any configured source.
    #[error("No configured source serves zoom {0}")]
    UnsupportedZoom(u8),

    /// Source key not present in the catalog.
    #[error("Unknown tile source '{0}'")]
    UnknownSource(String),

    /// A configuration value is out of range.
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// Catalog failed validation.
    #[error("Invalid source catalog: {0}")]
    InvalidCatalog(String),

    /// Pixel buffer cannot be decoded into heights.
    #[error("Undecodable pixel buffer: {0}")]
    Undecodable(String),

    /// A resampling request addressed a tile outside the source tile it was
    /// derived from.
    #[error("Tile z={z} x={x} y={y} is not covered by source tile at zoom {src_zoom}: {reason}")]
    IndexMismatch {
        /// Target zoom.
        z: u8,
        /// Target column.
        x: u32,
        /// Target row.
        y: u32,
        /// Source zoom.
        src_zoom: u8,
        /// Detail.
        reason: String,
    },

    /// The worker pool could not be started.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Every tile in the batch came back empty.
    #[error("No tiles produced any elevation data ({failed} of {total} failed)")]
    NoTilesProduced {
        /// Tiles without data.
        failed: usize,
        /// Tiles attempted.
        total: usize,
    },

    /// The downstream mosaic/warp collaborator failed.
    #[error("Mosaic failed: {0}")]
    Mosaic(String),
}
