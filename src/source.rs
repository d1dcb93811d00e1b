//! Image sources: where raw captures come from.
//!
//! The series builder only sees the [`ImageSource`] trait, so captures can
//! come from a GeoTIFF catalog on disk or be handed over in memory.

use crate::error::{PipelineError, Result};
use crate::io::read_geotiff;
use crate::period::DateRange;
use crate::raster::{BoundingBox, Properties, Raster};
use chrono::{Datelike, NaiveDateTime};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One raw, time-stamped acquisition
#[derive(Debug, Clone)]
pub struct Capture {
    pub id: String,
    pub collection: String,
    pub timestamp: NaiveDateTime,
    pub cloud_percentage: Option<f64>,
    pub raster: Raster,
}

/// Inclusive calendar-month window; `start > end` wraps over the new year
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthRange {
    pub start: u32,
    pub end: u32,
}

impl MonthRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=12).contains(&self.start) || !(1..=12).contains(&self.end) {
            return Err(PipelineError::InvalidConfig(format!(
                "month range {}..{} outside 1..12",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn contains(&self, month: u32) -> bool {
        if self.start <= self.end {
            (self.start..=self.end).contains(&month)
        } else {
            month >= self.start || month <= self.end
        }
    }
}

/// Scene-level predicates applied before any pixel work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityFilter {
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub max_cloud_percentage: Option<f64>,
    #[serde(default)]
    pub months: Option<MonthRange>,
}

impl QualityFilter {
    pub fn validate(&self) -> Result<()> {
        if let Some(months) = &self.months {
            months.validate()?;
        }
        if let Some(max) = self.max_cloud_percentage {
            if !(0.0..=100.0).contains(&max) {
                return Err(PipelineError::InvalidConfig(format!(
                    "max_cloud_percentage {} outside 0..100",
                    max
                )));
            }
        }
        Ok(())
    }

    /// Scene metadata check; captures without a cloud score pass the cloud test
    pub fn accepts(&self, collection: &str, timestamp: NaiveDateTime, cloud: Option<f64>) -> bool {
        if let Some(wanted) = &self.collection {
            if wanted != collection {
                return false;
            }
        }
        if let (Some(max), Some(cloud)) = (self.max_cloud_percentage, cloud) {
            if cloud >= max {
                return false;
            }
        }
        if let Some(months) = &self.months {
            if !months.contains(timestamp.month()) {
                return false;
            }
        }
        true
    }
}

pub trait ImageSource: Sync {
    /// Captures inside `range` whose footprint intersects `aoi` and that pass `filter`
    fn query(&self, range: &DateRange, aoi: &BoundingBox, filter: &QualityFilter) -> Result<Vec<Capture>>;
}

/// Captures held in memory, for embedding programs and tests
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    captures: Vec<Capture>,
}

impl MemorySource {
    pub fn new(captures: Vec<Capture>) -> Self {
        Self { captures }
    }

    pub fn push(&mut self, capture: Capture) {
        self.captures.push(capture);
    }
}

impl ImageSource for MemorySource {
    fn query(&self, range: &DateRange, aoi: &BoundingBox, filter: &QualityFilter) -> Result<Vec<Capture>> {
        let mut found: Vec<Capture> = self
            .captures
            .iter()
            .filter(|c| range.contains(c.timestamp))
            .filter(|c| filter.accepts(&c.collection, c.timestamp, c.cloud_percentage))
            .filter(|c| c.raster.grid.bounds().intersects(aoi))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.timestamp);
        Ok(found)
    }
}

/// Entry of a JSON scene catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub collection: String,
    /// GeoTIFF path, relative to the catalog file
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
    #[serde(default)]
    pub cloud_percentage: Option<f64>,
    /// Footprint; when absent the raster is opened to find it
    #[serde(default)]
    pub bounds: Option<BoundingBox>,
    #[serde(default)]
    pub properties: Properties,
}

/// Scene catalog backed by GeoTIFF files on disk
#[derive(Debug, Clone)]
pub struct CatalogSource {
    root: PathBuf,
    crs: String,
    entries: Vec<CatalogEntry>,
}

impl CatalogSource {
    /// Load a catalog (a JSON array of entries). Rasters are tagged with `crs`.
    pub fn open(path: &Path, crs: &str) -> Result<Self> {
        info!("Opening scene catalog: {}", path.display());
        let text = fs::read_to_string(path)?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&text)?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        info!("Catalog lists {} captures", entries.len());
        Ok(Self {
            root,
            crs: crs.to_string(),
            entries,
        })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    fn load(&self, entry: &CatalogEntry) -> Result<Capture> {
        let mut raster = read_geotiff(&self.root.join(&entry.path), &self.crs)?;
        raster.properties.extend(entry.properties.clone());
        raster.set_property("source", entry.collection.clone());
        Ok(Capture {
            id: entry.id.clone(),
            collection: entry.collection.clone(),
            timestamp: entry.timestamp,
            cloud_percentage: entry.cloud_percentage,
            raster,
        })
    }
}

impl ImageSource for CatalogSource {
    fn query(&self, range: &DateRange, aoi: &BoundingBox, filter: &QualityFilter) -> Result<Vec<Capture>> {
        let mut found = Vec::new();
        for entry in &self.entries {
            if !range.contains(entry.timestamp)
                || !filter.accepts(&entry.collection, entry.timestamp, entry.cloud_percentage)
            {
                continue;
            }
            if matches!(entry.bounds, Some(b) if !b.intersects(aoi)) {
                continue;
            }
            let capture = self.load(entry)?;
            if !capture.raster.grid.bounds().intersects(aoi) {
                debug!("Capture {} lies outside the area of interest", entry.id);
                continue;
            }
            found.push(capture);
        }
        found.sort_by_key(|c| c.timestamp);
        debug!(
            "{} captures between {} and {}",
            found.len(),
            range.start,
            range.end
        );
        Ok(found)
    }
}
