//! Scratch staging of per-tile rasters and the hand-off to a mosaic builder.
//!
//! A [`TileStage`] owns a temporary directory that is removed when the stage
//! is dropped, whether the run succeeded or not. Staged tiles are handed to a
//! [`MosaicBuilder`], the seam to whatever merges and reprojects them.

use crate::composite::CompositeResult;
use crate::geo::{ProjectedBounds, TileIndex};
use crate::raster::write_geotiff;
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tiledem_metrics::metric_defs;
use tracing::debug;

/// One tile raster written to the staging directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedTile {
    /// Output tile.
    pub index: TileIndex,
    /// Projected extent.
    pub bounds: ProjectedBounds,
    /// GeoTIFF location.
    pub path: PathBuf,
    /// Contributing sources, highest priority first.
    pub provenance: Vec<String>,
}

/// Temporary directory holding staged tile rasters.
#[derive(Debug)]
pub struct TileStage {
    dir: TempDir,
    nodata: f32,
}

impl TileStage {
    /// Create a staging directory in the system temp location.
    pub fn new(nodata: f32) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("tiledem-").tempdir()?;
        Ok(Self { dir, nodata })
    }

    /// Create a staging directory under `parent`.
    pub fn new_in(parent: &Path, nodata: f32) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("tiledem-").tempdir_in(parent)?;
        Ok(Self { dir, nodata })
    }

    /// Staging directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Output NODATA value.
    pub fn nodata(&self) -> f32 {
        self.nodata
    }

    /// Write one composite as a GeoTIFF plus a provenance sidecar.
    ///
    /// Returns `None` for an empty composite.
    pub fn stage(&self, result: &CompositeResult) -> Result<Option<StagedTile>> {
        let Some(heights) = &result.heights else {
            return Ok(None);
        };

        let t = result.tile;
        let path = self.dir.path().join(format!("tile_{}_{}_{}.tif", t.z, t.x, t.y));
        let bounds = result.bounds();
        write_geotiff(&path, heights, &bounds, self.nodata)?;
        fs::write(path.with_extension("src"), result.provenance.join("\n"))?;

        let bytes = fs::metadata(&path)?.len();
        metrics::counter!(metric_defs::STAGE_BYTES.name).increment(bytes);
        debug!(z = t.z, x = t.x, y = t.y, bytes, "staged tile");

        Ok(Some(StagedTile {
            index: t,
            bounds,
            path,
            provenance: result.provenance.clone(),
        }))
    }

    /// Stage every non-empty composite.
    pub fn stage_all<'a>(&self, results: impl IntoIterator<Item = &'a CompositeResult>) -> Result<Vec<StagedTile>> {
        let mut staged = Vec::new();
        for result in results {
            if let Some(tile) = self.stage(result)? {
                staged.push(tile);
            }
        }
        Ok(staged)
    }
}

/// Merges staged tiles into a final product.
///
/// Implementations report their own failures as [`DemError::Mosaic`].
pub trait MosaicBuilder {
    /// Build the product and return its location.
    fn build(&self, tiles: &[StagedTile], nodata: f32, target_crs: &str) -> Result<PathBuf>;
}

/// Manifest entry for one exported tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestTile {
    /// Tile as `z/x/y`.
    pub tile: String,
    /// File name relative to the manifest.
    pub file: String,
    /// `[minx, miny, maxx, maxy]` in EPSG:3857 meters.
    pub bounds: [f64; 4],
    /// Contributing sources.
    pub provenance: Vec<String>,
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// CRS the tiles are stored in.
    pub source_crs: String,
    /// CRS the mosaic should be warped to.
    pub target_crs: String,
    /// NODATA value of every tile.
    pub nodata: f32,
    /// Exported tiles.
    pub tiles: Vec<ManifestTile>,
}

/// Name of the manifest written by [`ManifestExport`].
pub const MANIFEST_FILE: &str = "manifest.json";

/// Copies staged tiles into a persistent directory and describes them in a
/// JSON manifest for an external warp tool.
#[derive(Debug, Clone)]
pub struct ManifestExport {
    out_dir: PathBuf,
}

impl ManifestExport {
    /// Export into `out_dir`, created if missing.
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into() }
    }

    /// Output directory.
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn export(&self, tiles: &[StagedTile], nodata: f32, target_crs: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.out_dir)?;

        let mut entries = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let file = tile
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("tile_{}_{}_{}.tif", tile.index.z, tile.index.x, tile.index.y));
            fs::copy(&tile.path, self.out_dir.join(&file))?;

            let b = &tile.bounds;
            entries.push(ManifestTile {
                tile: tile.index.to_string(),
                file,
                bounds: [b.minx, b.miny, b.maxx, b.maxy],
                provenance: tile.provenance.clone(),
            });
        }

        let manifest = Manifest {
            source_crs: "EPSG:3857".to_string(),
            target_crs: target_crs.to_string(),
            nodata,
            tiles: entries,
        };
        let path = self.out_dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(&manifest)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

impl MosaicBuilder for ManifestExport {
    fn build(&self, tiles: &[StagedTile], nodata: f32, target_crs: &str) -> Result<PathBuf> {
        if tiles.is_empty() {
            return Err(DemError::Mosaic("no tiles to export".to_string()));
        }
        self.export(tiles, nodata, target_crs)
            .map_err(|e| DemError::Mosaic(format!("{}: {}", self.out_dir.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heights::{HeightBuffer, NODATA};
    use crate::raster::read_geotiff;

    fn composite(x: u32, value: f32) -> CompositeResult {
        let mut heights = HeightBuffer::filled(8, value);
        heights.set(0, 0, NODATA);
        CompositeResult {
            tile: TileIndex { x, y: 51613, z: 17 },
            heights: Some(heights),
            provenance: vec!["qmap_dem".to_string(), "gsi_dem5a".to_string()],
        }
    }

    #[test]
    fn test_stage_writes_tile_and_sidecar() {
        let stage = TileStage::new(-9999.0).unwrap();
        let staged = stage.stage(&composite(116423, 42.0)).unwrap().unwrap();

        assert!(staged.path.ends_with("tile_17_116423_51613.tif"));
        let sidecar = fs::read_to_string(staged.path.with_extension("src")).unwrap();
        assert_eq!(sidecar, "qmap_dem\ngsi_dem5a");

        let raster = read_geotiff(&staged.path).unwrap();
        assert_eq!(raster.data[0], -9999.0);
        assert_eq!(raster.data[1], 42.0);
    }

    #[test]
    fn test_empty_composite_not_staged() {
        let stage = TileStage::new(-9999.0).unwrap();
        let empty = CompositeResult {
            tile: TileIndex { x: 1, y: 1, z: 2 },
            heights: None,
            provenance: Vec::new(),
        };
        assert!(stage.stage(&empty).unwrap().is_none());
    }

    #[test]
    fn test_stage_removed_on_drop() {
        let stage = TileStage::new(-9999.0).unwrap();
        stage.stage(&composite(5, 1.0)).unwrap();
        let dir = stage.path().to_path_buf();
        assert!(dir.exists());
        drop(stage);
        assert!(!dir.exists());
    }

    #[test]
    fn test_manifest_export() {
        let stage = TileStage::new(-9999.0).unwrap();
        let results = [composite(10, 1.0), composite(11, 2.0)];
        let staged = stage.stage_all(&results).unwrap();

        let out = tempfile::tempdir().unwrap();
        let export = ManifestExport::new(out.path().join("dem"));
        let manifest_path = export.build(&staged, -9999.0, "EPSG:4326").unwrap();

        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.target_crs, "EPSG:4326");
        assert_eq!(manifest.tiles.len(), 2);
        assert_eq!(manifest.tiles[0].tile, "17/10/51613");
        assert!(export.out_dir().join(&manifest.tiles[1].file).exists());
    }

    #[test]
    fn test_manifest_export_failure_is_mosaic_error() {
        let out = tempfile::tempdir().unwrap();
        let blocker = out.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let stage = TileStage::new(-9999.0).unwrap();
        let staged = stage.stage_all(&[composite(3, 1.0)]).unwrap();

        // Output directory path runs through a regular file.
        let export = ManifestExport::new(blocker.join("dem"));
        assert!(matches!(export.build(&staged, -9999.0, "EPSG:3857"), Err(DemError::Mosaic(_))));
        assert!(matches!(export.build(&[], -9999.0, "EPSG:3857"), Err(DemError::Mosaic(_))));
    }
}
