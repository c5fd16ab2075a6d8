//! Tile source descriptors and the source catalog.
//!
//! A source is pure configuration: where to fetch tiles, at which native
//! zoom, and how to turn pixels into heights. The catalog orders sources
//! into a primary / supplemental / fallback priority list.

use crate::geo::{TileIndex, MAX_ZOOM};
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Pixel encoding of a source's height tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecodeFormat {
    /// Signed 24-bit fixed point, 1 cm units, `2^23` is NODATA.
    #[serde(rename = "GSI_RGB_24BIT")]
    GsiRgb24bit,
    /// Unsigned 24-bit, 1 cm units, `(128, 0, 0)` is NODATA.
    QmapRgbScaled,
    /// Unsigned 24-bit, 1 cm units, transparent pixels are NODATA.
    AlphaMaskedRgb,
}

/// Placement of column and row in a provider's URL path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisOrder {
    /// `{x}` is the column, `{y}` the row.
    #[default]
    Xy,
    /// `{x}` receives the row and `{y}` the column.
    Yx,
}

/// One elevation tile provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSourceSpec {
    /// Unique key used on the command line and in provenance records.
    pub key: String,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    /// Zoom level the provider publishes.
    pub native_zoom: u8,
    /// URL with `{z}`, `{x}` and `{y}` placeholders.
    pub url_template: String,
    /// Pixel encoding.
    pub decode_format: DecodeFormat,
    /// URL axis order.
    #[serde(default)]
    pub axis_order: AxisOrder,
    /// Apply the fake-success coverage heuristics to this provider's responses.
    #[serde(default)]
    pub coverage_check: bool,
}

impl TileSourceSpec {
    /// Build the request URL for a tile at this source's native zoom.
    pub fn tile_url(&self, tile: TileIndex) -> String {
        let (first, second) = match self.axis_order {
            AxisOrder::Xy => (tile.x, tile.y),
            AxisOrder::Yx => (tile.y, tile.x),
        };
        self.url_template
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &first.to_string())
            .replace("{y}", &second.to_string())
    }

    fn validate(&self) -> Result<()> {
        if self.native_zoom > MAX_ZOOM {
            return Err(DemError::InvalidCatalog(format!(
                "source '{}' has native zoom {} above {}",
                self.key, self.native_zoom, MAX_ZOOM
            )));
        }
        for placeholder in ["{z}", "{x}", "{y}"] {
            if !self.url_template.contains(placeholder) {
                return Err(DemError::InvalidCatalog(format!(
                    "source '{}' url template lacks {}",
                    self.key, placeholder
                )));
            }
        }
        Ok(())
    }
}

/// Ordered set of sources plus the priority roles used by compositing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    /// Every known source.
    pub sources: Vec<TileSourceSpec>,
    /// Key of the universal high-resolution source tried right after the primary.
    pub supplemental: String,
    /// Generic fallbacks, finest first.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl SourceCatalog {
    /// Check keys, roles and templates.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.key.as_str()) {
                return Err(DemError::InvalidCatalog(format!("duplicate source key '{}'", source.key)));
            }
        }
        for key in std::iter::once(&self.supplemental).chain(&self.fallbacks) {
            if !seen.contains(key.as_str()) {
                return Err(DemError::InvalidCatalog(format!("role refers to unknown source '{}'", key)));
            }
        }
        Ok(())
    }

    /// Look up a source by key.
    pub fn get(&self, key: &str) -> Result<&TileSourceSpec> {
        self.sources
            .iter()
            .find(|s| s.key == key)
            .ok_or_else(|| DemError::UnknownSource(key.to_string()))
    }

    /// The supplemental source.
    pub fn supplemental(&self) -> Result<&TileSourceSpec> {
        self.get(&self.supplemental)
    }

    /// Distinct native zoom levels, ascending.
    pub fn zooms(&self) -> Vec<u8> {
        let mut zooms: Vec<u8> = self.sources.iter().map(|s| s.native_zoom).collect();
        zooms.sort_unstable();
        zooms.dedup();
        zooms
    }

    /// Output zoom for a primary source, checking an explicit request against
    /// the zooms the catalog actually serves.
    pub fn output_zoom(&self, primary: &str, requested: Option<u8>) -> Result<u8> {
        let primary = self.get(primary)?;
        match requested {
            None => Ok(primary.native_zoom),
            Some(z) if self.sources.iter().any(|s| s.native_zoom == z) => Ok(z),
            Some(z) => Err(DemError::UnsupportedZoom(z)),
        }
    }

    /// Attempt order for a tile: primary, supplemental, then fallbacks,
    /// each source at most once.
    pub fn plan(&self, primary: &str) -> Result<Vec<&TileSourceSpec>> {
        let mut plan = vec![self.get(primary)?];
        for key in std::iter::once(&self.supplemental).chain(&self.fallbacks) {
            let source = self.get(key)?;
            if !plan.iter().any(|s| s.key == source.key) {
                plan.push(source);
            }
        }
        Ok(plan)
    }

    /// Built-in catalog of Japanese DEM tile services.
    pub fn builtin() -> Self {
        fn gsi(key: &str, name: &str, layer: &str, zoom: u8) -> TileSourceSpec {
            TileSourceSpec {
                key: key.to_string(),
                name: name.to_string(),
                native_zoom: zoom,
                url_template: format!("https://cyberjapandata.gsi.go.jp/xyz/{}/{{z}}/{{x}}/{{y}}.png", layer),
                decode_format: DecodeFormat::GsiRgb24bit,
                axis_order: AxisOrder::Xy,
                coverage_check: false,
            }
        }

        Self {
            sources: vec![
                TileSourceSpec {
                    key: "qmap_dem".to_string(),
                    name: "Q-chizu merged GSI DEM (1 m class)".to_string(),
                    native_zoom: 17,
                    url_template: "https://mapdata.qchizu.xyz/03_dem/52_gsi/all_2025/1_02/{z}/{x}/{y}.webp"
                        .to_string(),
                    decode_format: DecodeFormat::QmapRgbScaled,
                    axis_order: AxisOrder::Xy,
                    coverage_check: true,
                },
                gsi("gsi_dem5a", "GSI DEM5A (laser survey)", "dem5a_png", 15),
                gsi("gsi_dem5b", "GSI DEM5B (photogrammetry)", "dem5b_png", 15),
                gsi("gsi_dem5c", "GSI DEM5C (photogrammetry, interpolated)", "dem5c_png", 15),
                gsi("gsi_dem10b", "GSI DEM10B", "dem_png", 14),
            ],
            supplemental: "qmap_dem".to_string(),
            fallbacks: vec![
                "gsi_dem5a".to_string(),
                "gsi_dem5b".to_string(),
                "gsi_dem5c".to_string(),
                "gsi_dem10b".to_string(),
            ],
        }
    }
}

impl Default for SourceCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
