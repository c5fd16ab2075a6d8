//! Metric declarations for the tiledem pipeline.
//!
//! This crate describes every metric the fetcher, compositor and job
//! scheduler emit. It re-exports the `metrics` crate for convenience and
//! defines all metrics as structured [`Metric`] constants to avoid typos.
//!
//! No recorder is installed here; without one every metric call is a no-op.
//!
//! # Example
//!
//! ```rust,ignore
//! use tiledem_metrics::{SourceLabels, metric_defs, describe_metrics};
//!
//! // Initialize metrics descriptions at startup
//! describe_metrics();
//!
//! let labels = SourceLabels::new("gsi_dem5a").with_reason("http_status");
//! metrics::counter!(metric_defs::FETCH_UNAVAILABLE.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

/// A metric declaration: name, kind, unit and description.
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "tiledem.fetch.attempts").
    pub name: &'static str,
    /// Counter, gauge or histogram.
    pub kind: MetricKind,
    /// Unit of measurement.
    pub unit: Unit,
    /// Human-readable description.
    pub description: &'static str,
}

impl Metric {
    /// A counter.
    pub const fn counter(name: &'static str, unit: Unit, description: &'static str) -> Self {
        Self { name, kind: MetricKind::Counter, unit, description }
    }

    /// A gauge.
    pub const fn gauge(name: &'static str, unit: Unit, description: &'static str) -> Self {
        Self { name, kind: MetricKind::Gauge, unit, description }
    }

    /// A histogram.
    pub const fn histogram(name: &'static str, unit: Unit, description: &'static str) -> Self {
        Self { name, kind: MetricKind::Histogram, unit, description }
    }

    /// Registers this metric's unit and description with the installed recorder.
    pub fn describe(&self) {
        let (name, unit, description) = (self.name, self.unit, self.description);
        match self.kind {
            MetricKind::Counter => describe_counter!(name, unit, description),
            MetricKind::Gauge => describe_gauge!(name, unit, description),
            MetricKind::Histogram => describe_histogram!(name, unit, description),
        }
    }
}

/// All metric definitions for the pipeline.
pub mod metric_defs {
    use super::{Metric, Unit};

    // Fetching. FETCH_ATTEMPTS is labelled by source, FETCH_UNAVAILABLE by
    // source and reason (see [`crate::SourceLabels`]).

    /// Tile requests issued.
    pub const FETCH_ATTEMPTS: Metric = Metric::counter("tiledem.fetch.attempts", Unit::Count, "Tile requests issued");

    /// Response body bytes received.
    pub const FETCH_BYTES: Metric = Metric::counter("tiledem.fetch.bytes", Unit::Bytes, "Response body bytes received");

    /// Requests that produced no usable tile.
    pub const FETCH_UNAVAILABLE: Metric = Metric::counter(
        "tiledem.fetch.unavailable",
        Unit::Count,
        "Tile requests that produced no usable tile",
    );

    // Compositing

    /// Output tiles with at least one valid sample.
    pub const COMPOSITE_TILES: Metric =
        Metric::counter("tiledem.composite.tiles", Unit::Count, "Composited tiles with data");

    /// Output tiles for which no source had data.
    pub const COMPOSITE_EMPTY: Metric =
        Metric::counter("tiledem.composite.empty", Unit::Count, "Composited tiles without any data");

    /// NODATA cells left after compositing one tile.
    pub const COMPOSITE_HOLES: Metric = Metric::histogram(
        "tiledem.composite.holes",
        Unit::Count,
        "NODATA cells remaining per composited tile",
    );

    // Jobs

    /// Wall time to build one output tile.
    pub const JOB_TILE_DURATION: Metric =
        Metric::histogram("tiledem.job.tile_duration", Unit::Seconds, "Time to build one output tile");

    /// Tiles that ended in an error.
    pub const JOB_TILES_FAILED: Metric =
        Metric::counter("tiledem.job.tiles_failed", Unit::Count, "Tiles whose task ended in an error");

    /// Tiles not yet completed in the running batch.
    pub const JOB_TILES_PENDING: Metric = Metric::gauge(
        "tiledem.job.tiles_pending",
        Unit::Count,
        "Tiles not yet completed in the running batch",
    );

    // Staging

    /// Raster bytes written to the staging area.
    pub const STAGE_BYTES: Metric =
        Metric::counter("tiledem.stage.bytes", Unit::Bytes, "GeoTIFF bytes written to the staging area");

    /// All metrics, for bulk registration.
    pub const ALL: &[&Metric] = &[
        &FETCH_ATTEMPTS,
        &FETCH_BYTES,
        &FETCH_UNAVAILABLE,
        &COMPOSITE_TILES,
        &COMPOSITE_EMPTY,
        &COMPOSITE_HOLES,
        &JOB_TILE_DURATION,
        &JOB_TILES_FAILED,
        &JOB_TILES_PENDING,
        &STAGE_BYTES,
    ];
}

/// Labels identifying the tile source a metric refers to.
///
/// # Example
///
/// ```rust
/// use tiledem_metrics::SourceLabels;
///
/// let labels = SourceLabels::new("qmap_dem").with_reason("sparse_coverage");
/// let label_vec = labels.to_labels();
/// assert_eq!(label_vec.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct SourceLabels {
    /// Source key
    pub source: String,
    /// Why a request failed, for failure counters
    pub reason: Option<&'static str>,
}

impl SourceLabels {
    /// Creates labels for a source key.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: None,
        }
    }

    /// Adds a failure reason.
    pub fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Converts the labels to the metrics crate label format.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("source", self.source.clone())];
        if let Some(reason) = self.reason {
            labels.push(("reason", reason.to_string()));
        }
        labels
    }
}

/// Describes all metrics used by the pipeline.
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
