//! Bounded parallel execution of per-tile composite jobs.
//!
//! Every output tile is an independent task on a fixed-size rayon pool.
//! Each task builds its own fetcher and owns its composite buffer, so tasks
//! share nothing but a completion counter. Results come back over a channel
//! in completion order and carry their [`TileIndex`].

use crate::composite::{CompositeEngine, CompositeResult};
use crate::fetch::{FetchPolicy, HttpTileFetcher, TileFetch};
use crate::geo::{GeoExtent, TileIndex, TileRange};
use crate::source::SourceCatalog;
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiledem_metrics::metric_defs;
use tracing::{debug, info, warn};

/// Upper bound on concurrent tile tasks, to stay polite to providers.
pub const MAX_WORKERS_CAP: usize = 16;

/// Two workers per core, capped at [`MAX_WORKERS_CAP`].
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cores * 2).clamp(1, MAX_WORKERS_CAP)
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size.
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
        }
    }
}

/// Cooperative cancellation flag shared between a batch and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Tasks that have not started yet will be skipped.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Running totals reported after each completed tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProgress {
    /// Tiles finished, with or without data.
    pub completed: usize,
    /// Tiles in the batch.
    pub total: usize,
    /// Finished tiles without data.
    pub failed: usize,
}

impl JobProgress {
    /// Completed fraction in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Callback for progress updates.
pub type ProgressCallback = Box<dyn Fn(&JobProgress) + Send + Sync>;

/// Everything a batch produced.
#[derive(Debug)]
pub struct BatchReport {
    /// Tiles with data, in completion order.
    pub produced: Vec<CompositeResult>,
    /// Tiles no source could fill, or whose task errored.
    pub failed: Vec<TileIndex>,
    /// Tiles in the batch.
    pub total: usize,
    /// True if the batch was cancelled before every tile ran.
    pub cancelled: bool,
    /// Wall time of the batch.
    pub elapsed: Duration,
}

impl BatchReport {
    /// Tiles never run because of cancellation.
    pub fn skipped(&self) -> usize {
        self.total - self.produced.len() - self.failed.len()
    }
}

enum TaskOutcome {
    Produced(CompositeResult),
    Absent(TileIndex),
    Errored(TileIndex, String),
    Skipped,
}

/// A fetcher factory producing blocking HTTP fetchers, one per task.
pub fn http_fetcher_factory(policy: FetchPolicy, side: usize) -> impl Fn() -> Result<HttpTileFetcher> + Sync {
    move || HttpTileFetcher::new(policy.clone(), side)
}

/// Runs composite jobs for many tiles on a bounded worker pool.
pub struct TileJobScheduler {
    catalog: SourceCatalog,
    pool: rayon::ThreadPool,
    workers: usize,
    side: usize,
}

impl std::fmt::Debug for TileJobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileJobScheduler")
            .field("workers", &self.workers)
            .field("side", &self.side)
            .field("sources", &self.catalog.sources.len())
            .finish()
    }
}

impl TileJobScheduler {
    /// Create a scheduler with `workers` threads producing `side x side` tiles.
    ///
    /// The catalog is validated here so a bad catalog fails before any
    /// network work.
    pub fn new(catalog: SourceCatalog, workers: usize, side: usize) -> Result<Self> {
        catalog.validate()?;
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tiledem-worker-{}", i))
            .build()
            .map_err(|e| DemError::WorkerPool(e.to_string()))?;

        Ok(Self {
            catalog,
            pool,
            workers,
            side,
        })
    }

    /// The source catalog.
    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    /// Worker pool size.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Output tile side length.
    pub fn side(&self) -> usize {
        self.side
    }

    /// Resolve the output zoom and the tile range for an extent.
    ///
    /// Pure configuration check: no network access.
    pub fn plan_extent(&self, extent: &GeoExtent, primary: &str, zoom: Option<u8>) -> Result<TileRange> {
        let zoom = self.catalog.output_zoom(primary, zoom)?;
        self.check_geometry(primary, zoom)?;
        TileRange::from_extent(extent, zoom)
    }

    /// Every finer source in the primary's plan must tile evenly into one
    /// output tile: `2^(src_zoom - zoom)` has to divide the side length.
    fn check_geometry(&self, primary: &str, zoom: u8) -> Result<()> {
        for source in self.catalog.plan(primary)? {
            let shift = match source.native_zoom.checked_sub(zoom) {
                Some(shift) if shift > 0 => shift,
                _ => continue,
            };
            let scale = 1usize << shift;
            if scale > self.side || self.side % scale != 0 {
                return Err(DemError::InvalidSetting(format!(
                    "tile_side {} cannot hold {}x{} tiles of '{}' (zoom {}) at output zoom {}",
                    self.side, scale, scale, source.key, source.native_zoom, zoom
                )));
            }
        }
        Ok(())
    }

    /// Composite every tile covering `extent`.
    pub fn run_extent<F, M>(
        &self,
        extent: &GeoExtent,
        primary: &str,
        zoom: Option<u8>,
        make_fetcher: M,
        progress: Option<&ProgressCallback>,
        cancel: &CancelToken,
    ) -> Result<BatchReport>
    where
        F: TileFetch,
        M: Fn() -> Result<F> + Sync,
    {
        let range = self.plan_extent(extent, primary, zoom)?;
        info!(
            zoom = range.zoom,
            columns = range.width(),
            rows = range.height(),
            "planned {} tiles",
            range.len()
        );
        let tiles: Vec<TileIndex> = range.iter().collect();
        self.run(&tiles, primary, make_fetcher, progress, cancel)
    }

    /// Composite the given tiles.
    ///
    /// Tiles without data are counted as failed and the batch carries on.
    /// Fails with [`DemError::NoTilesProduced`] only if nothing at all was
    /// produced and the batch was not cancelled.
    pub fn run<F, M>(
        &self,
        tiles: &[TileIndex],
        primary: &str,
        make_fetcher: M,
        progress: Option<&ProgressCallback>,
        cancel: &CancelToken,
    ) -> Result<BatchReport>
    where
        F: TileFetch,
        M: Fn() -> Result<F> + Sync,
    {
        self.catalog.get(primary)?;
        let mut zooms: Vec<u8> = tiles.iter().map(|t| t.z).collect();
        zooms.sort_unstable();
        zooms.dedup();
        for zoom in zooms {
            self.check_geometry(primary, zoom)?;
        }

        let total = tiles.len();
        let started = Instant::now();
        let completed = AtomicUsize::new(0);
        let mut produced = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled = false;

        info!(total, primary, workers = self.workers, "starting tile batch");
        metrics::gauge!(metric_defs::JOB_TILES_PENDING.name).set(total as f64);

        let (tx, rx) = crossbeam_channel::unbounded();
        self.pool.in_place_scope(|scope| {
            for &tile in tiles {
                let tx = tx.clone();
                let make_fetcher = &make_fetcher;
                let completed = &completed;
                scope.spawn(move |_| {
                    let outcome = if cancel.is_cancelled() {
                        TaskOutcome::Skipped
                    } else {
                        let outcome = self.run_tile(tile, primary, make_fetcher);
                        completed.fetch_add(1, Ordering::SeqCst);
                        outcome
                    };
                    // The receiver lives until every sender is gone.
                    let _ = tx.send(outcome);
                });
            }
            drop(tx);

            for outcome in rx.iter() {
                match outcome {
                    TaskOutcome::Produced(result) => produced.push(result),
                    TaskOutcome::Absent(tile) => {
                        warn!(z = tile.z, x = tile.x, y = tile.y, "no source had data for tile");
                        failed.push(tile);
                    }
                    TaskOutcome::Errored(tile, error) => {
                        warn!(z = tile.z, x = tile.x, y = tile.y, %error, "tile task failed");
                        metrics::counter!(metric_defs::JOB_TILES_FAILED.name).increment(1);
                        failed.push(tile);
                    }
                    TaskOutcome::Skipped => {}
                }

                if cancel.is_cancelled() {
                    cancelled = true;
                    continue;
                }
                let done = completed.load(Ordering::SeqCst);
                metrics::gauge!(metric_defs::JOB_TILES_PENDING.name).set(total.saturating_sub(done) as f64);
                if let Some(callback) = progress {
                    callback(&JobProgress {
                        completed: done,
                        total,
                        failed: failed.len(),
                    });
                }
            }
        });

        let report = BatchReport {
            produced,
            failed,
            total,
            cancelled,
            elapsed: started.elapsed(),
        };

        info!(
            produced = report.produced.len(),
            failed = report.failed.len(),
            skipped = report.skipped(),
            elapsed_secs = report.elapsed.as_secs_f64(),
            "tile batch finished"
        );
        if !report.failed.is_empty() {
            info!("{} of {} tiles had no data", report.failed.len(), total);
        }

        if report.produced.is_empty() && !report.cancelled {
            return Err(DemError::NoTilesProduced {
                failed: report.failed.len(),
                total,
            });
        }
        Ok(report)
    }

    fn run_tile<F, M>(&self, tile: TileIndex, primary: &str, make_fetcher: &M) -> TaskOutcome
    where
        F: TileFetch,
        M: Fn() -> Result<F>,
    {
        let started = Instant::now();
        let fetcher = match make_fetcher() {
            Ok(fetcher) => fetcher,
            Err(e) => return TaskOutcome::Errored(tile, e.to_string()),
        };

        let engine = CompositeEngine::new(&self.catalog, &fetcher, self.side);
        let outcome = match engine.composite(tile, primary) {
            Ok(result) if result.is_empty() => TaskOutcome::Absent(tile),
            Ok(result) => {
                debug!(z = tile.z, x = tile.x, y = tile.y, sources = ?result.provenance, "tile composited");
                TaskOutcome::Produced(result)
            }
            Err(e) => TaskOutcome::Errored(tile, e.to_string()),
        };

        metrics::histogram!(metric_defs::JOB_TILE_DURATION.name).record(started.elapsed().as_secs_f64());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchOutcome, UnavailableReason};
    use crate::heights::HeightBuffer;
    use crate::source::TileSourceSpec;
    use std::sync::Mutex;

    const SIDE: usize = 8;

    /// Primary source data only for tiles with an even column.
    struct EvenColumns;

    impl TileFetch for EvenColumns {
        fn fetch(&self, source: &TileSourceSpec, tile: TileIndex) -> FetchOutcome {
            if source.key == "qmap_dem" && tile.x % 2 == 0 {
                FetchOutcome::Tile(HeightBuffer::filled(SIDE, tile.x as f32))
            } else {
                FetchOutcome::Unavailable(UnavailableReason::HttpStatus(404))
            }
        }
    }

    struct NothingAnywhere;

    impl TileFetch for NothingAnywhere {
        fn fetch(&self, _source: &TileSourceSpec, _tile: TileIndex) -> FetchOutcome {
            FetchOutcome::Unavailable(UnavailableReason::Transport("offline".to_string()))
        }
    }

    fn row_of_tiles(n: u32) -> Vec<TileIndex> {
        (0..n).map(|i| TileIndex { x: 116420 + i, y: 51613, z: 17 }).collect()
    }

    fn scheduler(workers: usize) -> TileJobScheduler {
        TileJobScheduler::new(SourceCatalog::builtin(), workers, SIDE).unwrap()
    }

    #[test]
    fn test_default_workers_capped() {
        let n = default_workers();
        assert!(n >= 1 && n <= MAX_WORKERS_CAP);
    }

    #[test]
    fn test_absent_tiles_do_not_abort_batch() {
        let tiles = row_of_tiles(6);
        let report = scheduler(3)
            .run(&tiles, "qmap_dem", || Ok(EvenColumns), None, &CancelToken::new())
            .unwrap();

        assert_eq!(report.total, 6);
        assert_eq!(report.produced.len(), 3);
        assert_eq!(report.failed.len(), 3);
        assert!(!report.cancelled);
        for result in &report.produced {
            assert_eq!(result.tile.x % 2, 0);
            let heights = result.heights.as_ref().unwrap();
            assert_eq!(heights.get(0, 0), result.tile.x as f32);
        }
        assert!(report.failed.iter().all(|t| t.x % 2 == 1));
    }

    #[test]
    fn test_nothing_produced_is_error() {
        let tiles = row_of_tiles(3);
        let err = scheduler(2)
            .run(&tiles, "qmap_dem", || Ok(NothingAnywhere), None, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DemError::NoTilesProduced { failed: 3, total: 3 }));
    }

    #[test]
    fn test_progress_reaches_total() {
        let tiles = row_of_tiles(5);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Box::new(move |p: &JobProgress| sink.lock().unwrap().push(*p));

        scheduler(2)
            .run(&tiles, "qmap_dem", || Ok(EvenColumns), Some(&callback), &CancelToken::new())
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        let last = seen.last().unwrap();
        assert_eq!(last.completed, 5);
        assert_eq!(last.failed, 2);
        assert_eq!(last.fraction(), 1.0);
    }

    #[test]
    fn test_cancelled_before_start_skips_everything() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let tiles = row_of_tiles(4);
        let report = scheduler(2)
            .run(&tiles, "qmap_dem", || Ok(EvenColumns), None, &cancel)
            .unwrap();
        assert!(report.cancelled);
        assert!(report.produced.is_empty());
        assert_eq!(report.skipped(), 4);
    }

    /// Serves every primary tile and cancels the batch on its first request.
    struct CancelOnFirstFetch {
        cancel: CancelToken,
        fetches: Arc<AtomicUsize>,
    }

    impl TileFetch for CancelOnFirstFetch {
        fn fetch(&self, source: &TileSourceSpec, _tile: TileIndex) -> FetchOutcome {
            if self.fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                self.cancel.cancel();
            }
            if source.key == "qmap_dem" {
                FetchOutcome::Tile(HeightBuffer::filled(SIDE, 1.0))
            } else {
                FetchOutcome::Unavailable(UnavailableReason::HttpStatus(404))
            }
        }
    }

    #[test]
    fn test_cancel_mid_batch_keeps_running_tile() {
        let cancel = CancelToken::new();
        let fetches = Arc::new(AtomicUsize::new(0));
        let tiles = row_of_tiles(5);

        let calls_after_cancel = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&calls_after_cancel);
        let watched = cancel.clone();
        let callback: ProgressCallback = Box::new(move |_p: &JobProgress| {
            if watched.is_cancelled() {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        let report = scheduler(1)
            .run(
                &tiles,
                "qmap_dem",
                || {
                    Ok(CancelOnFirstFetch {
                        cancel: cancel.clone(),
                        fetches: Arc::clone(&fetches),
                    })
                },
                Some(&callback),
                &cancel,
            )
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.produced.len(), 1);
        assert!(tiles.contains(&report.produced[0].tile));
        assert!(report.failed.is_empty());
        assert_eq!(report.skipped(), 4);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(calls_after_cancel.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tile_side_too_small_for_finer_source() {
        // A z14 output pulls z17 qmap tiles: 8x8 of them per output tile.
        let sched = TileJobScheduler::new(SourceCatalog::builtin(), 1, 4).unwrap();
        let calls = AtomicUsize::new(0);
        let factory = || -> Result<NothingAnywhere> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(NothingAnywhere)
        };

        let extent = GeoExtent::new(139.76, 35.68, 139.77, 35.69);
        let err = sched
            .run_extent(&extent, "gsi_dem10b", None, &factory, None, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DemError::InvalidSetting(_)));

        let tiles = [TileIndex { x: 14552, y: 6451, z: 14 }];
        let err = sched
            .run(&tiles, "gsi_dem10b", &factory, None, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DemError::InvalidSetting(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Eight samples fit the 8x8 children exactly.
        let sched = TileJobScheduler::new(SourceCatalog::builtin(), 1, 8).unwrap();
        assert!(sched.plan_extent(&extent, "gsi_dem10b", None).is_ok());
    }

    #[test]
    fn test_factory_error_counts_as_failed_tile() {
        let tiles = row_of_tiles(2);
        let err = scheduler(1)
            .run(
                &tiles,
                "qmap_dem",
                || -> Result<EvenColumns> { Err(DemError::WorkerPool("no client".to_string())) },
                None,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, DemError::NoTilesProduced { failed: 2, total: 2 }));
    }

    #[test]
    fn test_config_errors_before_any_fetch() {
        let sched = scheduler(1);
        let inverted = GeoExtent::new(140.0, 36.0, 139.0, 35.0);
        let calls = AtomicUsize::new(0);
        let factory = || -> Result<NothingAnywhere> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(NothingAnywhere)
        };

        let err = sched
            .run_extent(&inverted, "qmap_dem", None, &factory, None, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DemError::InvalidExtent { .. }));

        let extent = GeoExtent::new(139.76, 35.68, 139.77, 35.69);
        let err = sched
            .run_extent(&extent, "qmap_dem", Some(16), &factory, None, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DemError::UnsupportedZoom(16)));

        let err = sched
            .run_extent(&extent, "missing", None, &factory, None, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DemError::UnknownSource(_)));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
