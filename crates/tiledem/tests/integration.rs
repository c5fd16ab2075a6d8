//! End-to-end tests of the tile pipeline against in-memory providers.
//!
//! No network access: every source is served by [`MockProviders`].

use approx::assert_abs_diff_eq;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tiledem::{
    read_geotiff, AxisOrder, CancelToken, DecodeFormat, DemError, FetchOutcome, GeoExtent, HeightBuffer,
    ManifestExport, MosaicBuilder, SourceCatalog, TileFetch, TileIndex, TileJobScheduler, TileSourceSpec,
    TileStage, UnavailableReason, NODATA,
};

const SIDE: usize = 256;

type Provider = Box<dyn Fn(TileIndex) -> Option<HeightBuffer> + Send + Sync>;

/// Serves tiles from closures keyed by source, logging every request.
#[derive(Clone, Default)]
struct MockProviders {
    providers: Arc<HashMap<String, Provider>>,
    requests: Arc<Mutex<Vec<(String, TileIndex)>>>,
}

impl MockProviders {
    fn new(providers: Vec<(&str, Provider)>) -> Self {
        Self {
            providers: Arc::new(providers.into_iter().map(|(k, p)| (k.to_string(), p)).collect()),
            requests: Arc::default(),
        }
    }

    fn requests_for(&self, key: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|(k, _)| k == key).count()
    }
}

impl TileFetch for MockProviders {
    fn fetch(&self, source: &TileSourceSpec, tile: TileIndex) -> FetchOutcome {
        assert_eq!(tile.z, source.native_zoom, "fetch must use the native zoom");
        self.requests.lock().unwrap().push((source.key.clone(), tile));
        match self.providers.get(&source.key).and_then(|p| p(tile)) {
            Some(buf) => FetchOutcome::Tile(buf),
            None => FetchOutcome::Unavailable(UnavailableReason::HttpStatus(404)),
        }
    }
}

fn constant(value: f32) -> Provider {
    Box::new(move |_| Some(HeightBuffer::filled(SIDE, value)))
}

fn source(key: &str, zoom: u8, format: DecodeFormat) -> TileSourceSpec {
    TileSourceSpec {
        key: key.to_string(),
        name: key.to_string(),
        native_zoom: zoom,
        url_template: format!("https://tiles.invalid/{}/{{z}}/{{x}}/{{y}}.png", key),
        decode_format: format,
        axis_order: AxisOrder::Xy,
        coverage_check: false,
    }
}

/// Three-tier catalog: primary, supplemental and one coarser fallback.
fn catalog() -> SourceCatalog {
    SourceCatalog {
        sources: vec![
            source("primary", 17, DecodeFormat::GsiRgb24bit),
            source("supplemental", 17, DecodeFormat::QmapRgbScaled),
            source("fallback", 15, DecodeFormat::GsiRgb24bit),
        ],
        supplemental: "supplemental".to_string(),
        fallbacks: vec!["fallback".to_string()],
    }
}

fn tokyo_tile() -> TileIndex {
    TileIndex { x: 116423, y: 51613, z: 17 }
}

/// An extent strictly inside one tile.
fn extent_inside(tile: TileIndex) -> GeoExtent {
    let b = tile.lonlat_bounds();
    let eps = 1e-6;
    GeoExtent::new(b.lon_min + eps, b.lat_min + eps, b.lon_max - eps, b.lat_max - eps)
}

#[test]
fn test_single_tile_uniform_primary() {
    let providers = MockProviders::new(vec![("primary", constant(100.0)), ("supplemental", constant(1.0))]);
    let scheduler = TileJobScheduler::new(catalog(), 2, SIDE).unwrap();

    let report = scheduler
        .run_extent(
            &extent_inside(tokyo_tile()),
            "primary",
            Some(17),
            || Ok(providers.clone()),
            None,
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(report.total, 1);
    assert_eq!(report.produced.len(), 1);
    let result = &report.produced[0];
    assert_eq!(result.tile, tokyo_tile());
    assert_eq!(result.provenance, vec!["primary"]);

    let heights = result.heights.as_ref().unwrap();
    assert_eq!(heights.side(), SIDE);
    assert_eq!(heights.hole_count(), 0);
    assert!(heights.as_slice().iter().all(|v| *v == 100.0));
    assert_eq!(providers.requests_for("supplemental"), 0);
}

#[test]
fn test_checkerboard_primary_filled_by_supplemental() {
    let checkerboard: Provider = Box::new(|_| {
        let data = (0..SIDE * SIDE)
            .map(|i| if (i % SIDE + i / SIDE) % 2 == 0 { NODATA } else { 10.0 })
            .collect();
        HeightBuffer::from_vec(SIDE, data)
    });
    let providers = MockProviders::new(vec![
        ("primary", checkerboard),
        ("supplemental", constant(50.0)),
        ("fallback", constant(-1.0)),
    ]);
    let scheduler = TileJobScheduler::new(catalog(), 1, SIDE).unwrap();

    let report = scheduler
        .run(&[tokyo_tile()], "primary", || Ok(providers.clone()), None, &CancelToken::new())
        .unwrap();

    let result = &report.produced[0];
    assert_eq!(result.provenance, vec!["primary", "supplemental"]);
    let heights = result.heights.as_ref().unwrap();
    for row in 0..SIDE {
        for col in 0..SIDE {
            let expected = if (col + row) % 2 == 0 { 50.0 } else { 10.0 };
            assert_eq!(heights.get(col, row), expected, "cell ({}, {})", col, row);
        }
    }
    assert_eq!(providers.requests_for("fallback"), 0);
}

#[test]
fn test_coarse_fallback_is_upsampled() {
    let providers = MockProviders::new(vec![("fallback", constant(123.0))]);
    let scheduler = TileJobScheduler::new(catalog(), 1, SIDE).unwrap();

    let report = scheduler
        .run(&[tokyo_tile()], "primary", || Ok(providers.clone()), None, &CancelToken::new())
        .unwrap();

    let result = &report.produced[0];
    assert_eq!(result.source(), Some("fallback"));
    let heights = result.heights.as_ref().unwrap();
    assert_eq!(heights.hole_count(), 0);
    for v in heights.as_slice() {
        assert_abs_diff_eq!(*v, 123.0, epsilon = 1e-3);
    }
    // One z15 ancestor request covers the z17 target.
    assert_eq!(providers.requests_for("fallback"), 1);
}

#[test]
fn test_builtin_catalog_downsamples_fine_source() {
    // Output at z15 from the z17 supplemental: 16 children per tile.
    let providers = MockProviders::new(vec![("qmap_dem", constant(7.5))]);
    let scheduler = TileJobScheduler::new(SourceCatalog::builtin(), 2, SIDE).unwrap();
    let target = tokyo_tile().ancestor(15);

    let report = scheduler
        .run(&[target], "gsi_dem5a", || Ok(providers.clone()), None, &CancelToken::new())
        .unwrap();

    let result = &report.produced[0];
    assert_eq!(result.provenance, vec!["qmap_dem"]);
    let heights = result.heights.as_ref().unwrap();
    assert_eq!(heights.hole_count(), 0);
    for v in heights.as_slice() {
        assert_abs_diff_eq!(*v, 7.5, epsilon = 1e-3);
    }
    assert_eq!(providers.requests_for("qmap_dem"), 16);
}

#[test]
fn test_exhaustive_failure_continues_batch() {
    let only_one = tokyo_tile();
    let sparse: Provider = Box::new(move |t| (t == only_one).then(|| HeightBuffer::filled(SIDE, 5.0)));
    let providers = MockProviders::new(vec![("primary", sparse)]);
    let scheduler = TileJobScheduler::new(catalog(), 4, SIDE).unwrap();

    let tiles: Vec<TileIndex> = (0..4).map(|dx| TileIndex { x: only_one.x - 1 + dx, ..only_one }).collect();
    let report = scheduler
        .run(&tiles, "primary", || Ok(providers.clone()), None, &CancelToken::new())
        .unwrap();

    assert_eq!(report.produced.len(), 1);
    assert_eq!(report.produced[0].tile, only_one);
    assert_eq!(report.failed.len(), 3);
    assert!(!report.failed.contains(&only_one));
    // Lower tiers were only asked for the empty tiles.
    assert_eq!(providers.requests_for("supplemental"), 3);
    assert_eq!(providers.requests_for("fallback"), 3);
}

#[test]
fn test_inverted_extent_fails_before_scheduling() {
    let scheduler = TileJobScheduler::new(catalog(), 1, SIDE).unwrap();
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let factory = move || -> tiledem::Result<MockProviders> {
        *counter.lock().unwrap() += 1;
        Ok(MockProviders::default())
    };

    let inverted = GeoExtent::new(139.78, 35.69, 139.76, 35.67);
    let err = scheduler
        .run_extent(&inverted, "primary", None, factory, None, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, DemError::InvalidExtent { .. }));
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[test]
fn test_stage_and_export_batch() {
    let providers = MockProviders::new(vec![("primary", constant(42.0))]);
    let scheduler = TileJobScheduler::new(catalog(), 2, SIDE).unwrap();
    let tiles = [tokyo_tile(), TileIndex { x: 116424, ..tokyo_tile() }];
    let report = scheduler
        .run(&tiles, "primary", || Ok(providers.clone()), None, &CancelToken::new())
        .unwrap();

    let out = tempfile::tempdir().unwrap();
    let staged_dir;
    {
        let stage = TileStage::new_in(out.path(), -9999.0).unwrap();
        staged_dir = stage.path().to_path_buf();
        let staged = stage.stage_all(&report.produced).unwrap();
        assert_eq!(staged.len(), 2);

        let manifest = ManifestExport::new(out.path().join("export"))
            .build(&staged, -9999.0, "EPSG:4326")
            .unwrap();
        assert!(manifest.exists());

        let raster = read_geotiff(&staged[0].path).unwrap();
        assert_eq!((raster.width, raster.height), (SIDE as u32, SIDE as u32));
        assert_eq!(raster.min_max(), Some((42.0, 42.0)));
        assert_abs_diff_eq!(raster.bounds.minx, staged[0].bounds.minx, epsilon = 1e-6);
    }
    assert!(!staged_dir.exists());
    assert!(out.path().join("export").join("tile_17_116424_51613.tif").exists());
}
