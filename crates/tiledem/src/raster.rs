//! Single-band GeoTIFF output for composited tiles.
//!
//! Tiles are written as Float32 rasters in Web Mercator (EPSG:3857) with
//! the usual GeoTIFF georeferencing tags and a GDAL NODATA tag, which is
//! what downstream mosaic/warp tools expect.

use crate::geo::ProjectedBounds;
use crate::heights::{HeightBuffer, NODATA};
use crate::{DemError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

/// EPSG code of the tile pyramid's projection.
pub const WEB_MERCATOR_EPSG: u16 = 3857;

// Header (version 1.1.0, 3 keys), GTModelType = projected,
// GTRasterType = pixel is area, ProjectedCSType = EPSG:3857.
const GEO_KEYS: [u16; 16] = [
    1, 1, 0, 3, //
    1024, 0, 1, 1, //
    1025, 0, 1, 1, //
    3072, 0, 1, WEB_MERCATOR_EPSG,
];

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Write `heights` as a georeferenced Float32 GeoTIFF.
///
/// NODATA samples are stored as `nodata`, which is also recorded in the
/// GDAL_NODATA tag.
pub fn write_geotiff(path: &Path, heights: &HeightBuffer, bounds: &ProjectedBounds, nodata: f32) -> Result<()> {
    let side = heights.side();
    let (px, py) = bounds.pixel_size(side);
    let data = heights.to_filled_vec(nodata);
    let nodata_text = format_nodata(nodata);

    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;
    let mut image = encoder.new_image::<colortype::Gray32Float>(side as u32, side as u32)?;

    let dir = image.encoder();
    dir.write_tag(tag(MODEL_PIXEL_SCALE), &[px, py, 0.0][..])?;
    dir.write_tag(tag(MODEL_TIEPOINT), &[0.0, 0.0, 0.0, bounds.minx, bounds.maxy, 0.0][..])?;
    dir.write_tag(tag(GEO_KEY_DIRECTORY), &GEO_KEYS[..])?;
    dir.write_tag(tag(GDAL_NODATA), nodata_text.as_str())?;

    image.write_data(&data)?;
    Ok(())
}

fn format_nodata(nodata: f32) -> String {
    if nodata.is_nan() {
        "nan".to_string()
    } else {
        nodata.to_string()
    }
}

/// A tile raster read back from disk.
#[derive(Debug, Clone)]
pub struct RasterTile {
    /// Samples, row-major from the north-west corner.
    pub data: Vec<f32>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Projected extent.
    pub bounds: ProjectedBounds,
    /// Value marking missing samples, if the file declares one.
    pub nodata: Option<f32>,
}

impl RasterTile {
    /// Whether a sample holds a height.
    pub fn is_valid(&self, value: f32) -> bool {
        match self.nodata {
            _ if value.is_nan() => false,
            Some(nd) => value != nd,
            None => true,
        }
    }

    /// Fraction of valid samples.
    pub fn valid_fraction(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let valid = self.data.iter().filter(|v| self.is_valid(**v)).count();
        valid as f64 / self.data.len() as f64
    }

    /// Lowest and highest valid sample.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.data
            .iter()
            .copied()
            .filter(|v| self.is_valid(*v))
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Convert to a height buffer, mapping the file's nodata back to NODATA.
    ///
    /// Only square rasters convert.
    pub fn to_heights(&self) -> Option<HeightBuffer> {
        if self.width != self.height {
            return None;
        }
        let data = self
            .data
            .iter()
            .map(|&v| if self.is_valid(v) { v } else { NODATA })
            .collect();
        HeightBuffer::from_vec(self.width as usize, data)
    }
}

/// Read a GeoTIFF written by [`write_geotiff`] (or any single-band raster
/// carrying tiepoint and pixel scale tags).
pub fn read_geotiff(path: &Path) -> Result<RasterTile> {
    let file = BufReader::new(File::open(path)?);
    let mut decoder = Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;

    let tiepoint = decoder.get_tag_f64_vec(tag(MODEL_TIEPOINT))?;
    let scale = decoder.get_tag_f64_vec(tag(MODEL_PIXEL_SCALE))?;
    if tiepoint.len() < 6 || scale.len() < 2 {
        return Err(DemError::Undecodable(format!(
            "{}: malformed georeferencing tags",
            path.display()
        )));
    }
    let minx = tiepoint[3];
    let maxy = tiepoint[4];
    let bounds = ProjectedBounds {
        minx,
        miny: maxy - f64::from(height) * scale[1],
        maxx: minx + f64::from(width) * scale[0],
        maxy,
    };

    let nodata = decoder
        .get_tag_ascii_string(tag(GDAL_NODATA))
        .ok()
        .and_then(|s| s.trim().trim_end_matches('\0').parse::<f32>().ok());

    let data = match decoder.read_image()? {
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        _ => {
            return Err(DemError::Undecodable(format!(
                "{}: unsupported sample format",
                path.display()
            )))
        }
    };

    Ok(RasterTile {
        data,
        width,
        height,
        bounds,
        nodata,
    })
}
