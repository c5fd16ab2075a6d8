//! Priority compositing of several sources into one output tile.
//!
//! Sources are tried in catalog order (primary, supplemental, fallbacks).
//! Each one may only fill cells that are still NODATA, so a lower-priority
//! source can never overwrite a value supplied by a higher-priority one.
//! Compositing stops as soon as no holes remain.

use crate::fetch::TileFetch;
use crate::geo::{ProjectedBounds, TileIndex};
use crate::heights::HeightBuffer;
use crate::resample::Resampler;
use crate::source::SourceCatalog;
use crate::Result;
use tiledem_metrics::metric_defs;
use tracing::{debug, warn};

/// Outcome of compositing one output tile.
#[derive(Debug, Clone)]
pub struct CompositeResult {
    /// The output tile.
    pub tile: TileIndex,
    /// Heights, or `None` when no source had any data for the tile.
    pub heights: Option<HeightBuffer>,
    /// Keys of the sources that contributed at least one sample, in priority order.
    pub provenance: Vec<String>,
}

impl CompositeResult {
    /// True if the tile has no data at all.
    pub fn is_empty(&self) -> bool {
        self.heights.is_none()
    }

    /// The highest-priority contributing source.
    pub fn source(&self) -> Option<&str> {
        self.provenance.first().map(String::as_str)
    }

    /// Projected bounds of the tile.
    pub fn bounds(&self) -> ProjectedBounds {
        self.tile.projected_bounds()
    }
}

/// Builds composite tiles from a catalog and a fetcher.
///
/// The engine holds no mutable state; the composite buffer lives on the
/// stack of a single [`CompositeEngine::composite`] call.
pub struct CompositeEngine<'a, F: TileFetch + ?Sized> {
    catalog: &'a SourceCatalog,
    fetcher: &'a F,
    resampler: Resampler,
}

impl<'a, F: TileFetch + ?Sized> CompositeEngine<'a, F> {
    /// Create an engine producing `side x side` tiles.
    pub fn new(catalog: &'a SourceCatalog, fetcher: &'a F, side: usize) -> Self {
        Self {
            catalog,
            fetcher,
            resampler: Resampler::new(side),
        }
    }

    /// Composite `target` starting from the `primary` source.
    ///
    /// Unavailable sources are skipped, and so is a source whose tiles cannot
    /// be resampled onto `target`. The only error is an unknown primary key.
    pub fn composite(&self, target: TileIndex, primary: &str) -> Result<CompositeResult> {
        let plan = self.catalog.plan(primary)?;
        let mut buffer = HeightBuffer::empty(self.resampler.side());
        let mut provenance = Vec::new();

        for source in plan {
            if !buffer.has_holes() {
                break;
            }

            let heights = match self
                .resampler
                .resample(source.native_zoom, target, |t| self.fetcher.fetch(source, t).into_tile())
            {
                Ok(heights) => heights,
                Err(error) => {
                    warn!(tile = %target, source = %source.key, %error, "skipping source");
                    continue;
                }
            };
            let Some(heights) = heights else {
                debug!(tile = %target, source = %source.key, "source has no data");
                continue;
            };

            let filled = buffer.fill_holes_from(&heights);
            debug!(tile = %target, source = %source.key, filled, "filled holes");
            if filled > 0 {
                provenance.push(source.key.clone());
            }
        }

        let holes = buffer.hole_count();
        metrics::histogram!(metric_defs::COMPOSITE_HOLES.name).record(holes as f64);

        let heights = if buffer.is_all_nodata() {
            metrics::counter!(metric_defs::COMPOSITE_EMPTY.name).increment(1);
            None
        } else {
            metrics::counter!(metric_defs::COMPOSITE_TILES.name).increment(1);
            Some(buffer)
        };

        Ok(CompositeResult {
            tile: target,
            heights,
            provenance,
        })
    }
}
