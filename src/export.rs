//! Table and image outputs.

use crate::crs::ensure_same_crs;
use crate::error::{PipelineError, Result};
use crate::extract::SampleRow;
use crate::io::write_geotiff;
use crate::raster::{BoundingBox, Grid, Raster};
use crate::resample::resample_nearest;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

/// Housekeeping properties dropped from tables unless selected explicitly.
/// `date` is absent: it is the period label that tells rows of one point apart.
pub const DEFAULT_EXCLUDED: [&str; 5] = ["month", "system:time_start", "count", "histogram", "year"];

/// Which columns of a sample table are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "columns", rename_all = "snake_case")]
pub enum TableSelector {
    All,
    /// Exactly these columns, in this order
    Include(Vec<String>),
    /// Every column except these
    Exclude(Vec<String>),
}

impl Default for TableSelector {
    fn default() -> Self {
        TableSelector::Exclude(DEFAULT_EXCLUDED.iter().map(|s| s.to_string()).collect())
    }
}

impl TableSelector {
    /// Resolve against the columns present in a table (first-seen order)
    pub fn resolve(&self, available: &[String]) -> Result<Vec<String>> {
        match self {
            TableSelector::All => Ok(available.to_vec()),
            TableSelector::Include(columns) => {
                for column in columns {
                    if !available.contains(column) {
                        return Err(PipelineError::UnknownColumn(column.clone()));
                    }
                }
                Ok(columns.clone())
            }
            TableSelector::Exclude(excluded) => Ok(available
                .iter()
                .filter(|c| !excluded.contains(c))
                .cloned()
                .collect()),
        }
    }
}

/// Union of the columns of `rows`, in first-seen order
pub fn table_columns(rows: &[SampleRow]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();
    for row in rows {
        for (name, _) in row.fields() {
            if seen.insert(name.clone()) {
                columns.push(name);
            }
        }
    }
    columns
}

/// Write `rows` as CSV and return the written header.
///
/// Rows from different rasters may carry different bands; absent cells are
/// left empty.
pub fn write_table(rows: &[SampleRow], selector: &TableSelector, path: &Path) -> Result<Vec<String>> {
    let available = table_columns(rows);
    let columns = match selector {
        // Nothing to check against yet; keep the declared header
        TableSelector::Include(columns) if rows.is_empty() => columns.clone(),
        _ => selector.resolve(&available)?,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&columns)?;
    for row in rows {
        let fields: HashMap<String, String> = row.fields().into_iter().collect();
        writer.write_record(
            columns
                .iter()
                .map(|c| fields.get(c).map(String::as_str).unwrap_or("")),
        )?;
    }
    writer.flush()?;

    info!("Wrote {} rows x {} columns to {}", rows.len(), columns.len(), path.display());
    Ok(columns)
}

/// Output grid of an image export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageExport {
    #[serde(default)]
    pub crs: Option<String>,
    /// Pixel size; the raster's own resolution when unset
    #[serde(default)]
    pub scale: Option<f64>,
    /// Exported extent; the raster's bounds when unset
    #[serde(default)]
    pub region: Option<BoundingBox>,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
}

fn default_max_pixels() -> u64 {
    100_000_000
}

impl Default for ImageExport {
    fn default() -> Self {
        Self {
            crs: None,
            scale: None,
            region: None,
            max_pixels: default_max_pixels(),
        }
    }
}

impl ImageExport {
    /// Grid the raster is written on; fails before allocating when the
    /// pixel budget is exceeded
    pub fn target_grid(&self, raster: &Raster) -> Result<Grid> {
        if let Some(crs) = &self.crs {
            ensure_same_crs(crs, &raster.grid.crs)?;
        }
        let scale = self.scale.unwrap_or_else(|| raster.grid.pixel_width());
        if scale <= 0.0 || !scale.is_finite() {
            return Err(PipelineError::InvalidScale(scale));
        }
        let region = self.region.unwrap_or_else(|| raster.grid.bounds());
        region.validate()?;

        let width = (region.width() / scale).ceil() as u64;
        let height = (region.height() / scale).ceil() as u64;
        let pixels = width.saturating_mul(height);
        if pixels > self.max_pixels {
            return Err(PipelineError::TooManyPixels {
                pixels,
                max_pixels: self.max_pixels,
            });
        }
        Grid::from_bounds(&region, scale, raster.grid.crs.clone())
    }
}

/// Resample `raster` onto the export grid and write it as a GeoTIFF
pub fn export_image(raster: &Raster, export: &ImageExport, path: &Path) -> Result<Grid> {
    let grid = export.target_grid(raster)?;
    let resampled = resample_nearest(raster, &grid)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_geotiff(&resampled, path)?;
    info!(
        "Exported {} bands ({}x{} @ {}) to {}",
        resampled.bands().len(),
        grid.width,
        grid.height,
        grid.pixel_width(),
        path.display()
    );
    Ok(grid)
}
