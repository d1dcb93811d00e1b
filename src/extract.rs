//! Sampling rasters at survey points.
//!
//! Every point yields exactly one row per raster, so tables stay aligned
//! with the point set even where imagery is missing: masked or out-of-grid
//! samples become `None` instead of dropping the row.

use crate::crs::ensure_same_crs;
use crate::error::{PipelineError, Result};
use crate::points::Point;
use crate::raster::{Grid, Properties, Raster};
use crate::reducer::Reducer;
use crate::resample::resample_nearest;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a raster is evaluated at each point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractOptions {
    /// `first` samples the containing pixel; any other reducer runs over the
    /// pixels whose centres fall inside `buffer`
    #[serde(default = "default_reducer")]
    pub reducer: Reducer,
    /// Buffer radius in CRS units (0 samples the point itself)
    #[serde(default)]
    pub buffer: f64,
    /// Expected CRS of the sampled rasters
    #[serde(default)]
    pub crs: Option<String>,
    /// Sampling resolution; rasters at another resolution are resampled first
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default = "default_tile_scale")]
    pub tile_scale: u32,
}

fn default_reducer() -> Reducer {
    Reducer::First
}

fn default_tile_scale() -> u32 {
    1
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            reducer: default_reducer(),
            buffer: 0.0,
            crs: None,
            scale: None,
            tile_scale: default_tile_scale(),
        }
    }
}

impl ExtractOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.buffer.is_finite() && self.buffer >= 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "buffer must be non-negative, got {}",
                self.buffer
            )));
        }
        if let Some(scale) = self.scale {
            if scale <= 0.0 || !scale.is_finite() {
                return Err(PipelineError::InvalidScale(scale));
            }
        }
        if self.tile_scale == 0 {
            return Err(PipelineError::InvalidConfig("tile_scale must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// One point evaluated against one raster
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    pub point_id: String,
    pub attributes: BTreeMap<String, String>,
    pub properties: Properties,
    /// Band values in raster band order; `None` where masked or outside the grid
    pub values: Vec<(String, Option<f64>)>,
}

impl SampleRow {
    pub const ID_COLUMN: &'static str = "id";
    pub const ATTRIBUTE_PREFIX: &'static str = "point_";

    pub fn value(&self, band: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name == band)
            .and_then(|(_, v)| *v)
    }

    /// Every column of the row as text: id, point attributes, raster
    /// properties, then band values. Missing values are empty strings.
    ///
    /// A point attribute sharing its name with the id column, a property or a
    /// band is written as `point_<name>`, so neither value is lost.
    pub fn fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(1 + self.attributes.len() + self.properties.len() + self.values.len());
        fields.push((Self::ID_COLUMN.to_string(), self.point_id.clone()));
        for (key, value) in &self.attributes {
            fields.push((self.attribute_column(key), value.clone()));
        }
        for (key, value) in &self.properties {
            fields.push((key.clone(), value.to_string()));
        }
        for (band, value) in &self.values {
            fields.push((band.clone(), value.map(|v| v.to_string()).unwrap_or_default()));
        }
        fields
    }

    fn attribute_column(&self, key: &str) -> String {
        let taken = key == Self::ID_COLUMN
            || self.properties.contains_key(key)
            || self.values.iter().any(|(band, _)| band == key);
        if taken {
            format!("{}{}", Self::ATTRIBUTE_PREFIX, key)
        } else {
            key.to_string()
        }
    }
}

/// Sample `raster` at every point, keeping the point order
pub fn extract(raster: &Raster, points: &[Point], options: &ExtractOptions) -> Result<Vec<SampleRow>> {
    options.validate()?;
    if let Some(crs) = &options.crs {
        ensure_same_crs(crs, &raster.grid.crs)?;
    }

    let resampled;
    let raster = match options.scale {
        Some(scale) if (scale - raster.grid.pixel_width()).abs() > 1e-9 => {
            let target = Grid::from_bounds(&raster.grid.bounds(), scale, raster.grid.crs.clone())?;
            resampled = resample_nearest(raster, &target)?;
            &resampled
        }
        _ => raster,
    };

    let window = buffer_window(&raster.grid, options.buffer);
    let chunk_size = points
        .len()
        .div_ceil(rayon::current_num_threads() * options.tile_scale as usize)
        .max(1);
    debug!(
        "Sampling {} points in chunks of {} ({} bands)",
        points.len(),
        chunk_size,
        raster.bands().len()
    );

    let chunks: Vec<Vec<SampleRow>> = points
        .par_chunks(chunk_size)
        .map(|chunk| {
            chunk
                .iter()
                .map(|point| sample_point(raster, point, options, &window))
                .collect()
        })
        .collect();
    Ok(chunks.into_iter().flatten().collect())
}

/// Sample every raster of a series; rows are grouped by raster, then point
pub fn extract_series(rasters: &[Raster], points: &[Point], options: &ExtractOptions) -> Result<Vec<SampleRow>> {
    let mut rows = Vec::with_capacity(rasters.len() * points.len());
    for raster in rasters {
        rows.extend(extract(raster, points, options)?);
    }
    info!(
        "Extracted {} rows ({} rasters x {} points)",
        rows.len(),
        rasters.len(),
        points.len()
    );
    Ok(rows)
}

/// Cell offsets within `buffer` of a cell centre
fn buffer_window(grid: &Grid, buffer: f64) -> Vec<(isize, isize)> {
    if buffer <= 0.0 {
        return vec![(0, 0)];
    }
    let cells = (buffer / grid.pixel_width()).ceil() as isize + 1;
    let mut offsets = Vec::new();
    for dr in -cells..=cells {
        for dc in -cells..=cells {
            offsets.push((dr, dc));
        }
    }
    offsets
}

fn sample_point(raster: &Raster, point: &Point, options: &ExtractOptions, window: &[(isize, isize)]) -> SampleRow {
    let grid = &raster.grid;
    let cell = grid.cell_at(point.x, point.y);

    // Cells whose centres lie inside the buffer
    let mut region = Vec::new();
    if let Some((row, col)) = cell {
        if options.reducer != Reducer::First && options.buffer > 0.0 {
            for &(dr, dc) in window {
                let (r, c) = (row as isize + dr, col as isize + dc);
                if r < 0 || c < 0 || r >= grid.height as isize || c >= grid.width as isize {
                    continue;
                }
                let (x, y) = grid.cell_center(r as usize, c as usize);
                if (x - point.x).hypot(y - point.y) <= options.buffer {
                    region.push((r as usize, c as usize));
                }
            }
        }
    }

    let mut buf = Vec::with_capacity(region.len());
    let values = raster
        .bands()
        .iter()
        .map(|band| {
            let value = cell.and_then(|containing| {
                buf.clear();
                buf.extend(region.iter().map(|&idx| band.data[idx]).filter(|v| !v.is_nan()));
                let v = if buf.is_empty() {
                    band.data[containing]
                } else {
                    options.reducer.reduce(&mut buf)
                };
                (!v.is_nan()).then_some(v as f64)
            });
            (band.name.clone(), value)
        })
        .collect();

    SampleRow {
        point_id: point.id.clone(),
        attributes: point.attributes.clone(),
        properties: raster.properties.clone(),
        values,
    }
}
