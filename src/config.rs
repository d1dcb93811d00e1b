//! JSON pipeline configuration.
//!
//! Everything that can be wrong with a configuration is reported by
//! [`PipelineConfig::validate`], before any capture is read.

use crate::crs::parse_epsg;
use crate::error::{PipelineError, Result};
use crate::export::{ImageExport, TableSelector};
use crate::extract::ExtractOptions;
use crate::focal::KernelSpec;
use crate::period::Interval;
use crate::points::PointColumns;
use crate::raster::BoundingBox;
use crate::series::SeriesSpec;
use chrono::NaiveDate;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub interval: Interval,
    pub aoi: BoundingBox,
    #[serde(default = "default_crs")]
    pub crs: String,
    /// Pixel size of the composite template grid
    pub scale: f64,
    #[serde(default = "default_tile_scale")]
    pub tile_scale: u32,
    /// JSON scene catalog read by the command-line tool
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    #[serde(default)]
    pub points: Option<PointsConfig>,
    #[serde(default)]
    pub series: Vec<SeriesSpec>,
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
}

fn default_crs() -> String {
    "EPSG:3348".to_string()
}

fn default_tile_scale() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointsConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub columns: PointColumns,
}

/// Static raster (terrain, canopy height, land cover) sampled like a
/// one-element series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub path: PathBuf,
    /// Turn a categorical band into one indicator band per class
    #[serde(default)]
    pub fractions: Option<ClassFractions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFractions {
    pub band: String,
    /// Classes to keep; every class found in the band when empty
    #[serde(default)]
    pub classes: Vec<LandClass>,
    #[serde(default)]
    pub nodata: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandClass {
    pub value: i32,
    pub name: String,
}

/// One sample table: a source sampled at every point, optionally after
/// focal aggregation at each listed kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub kernels: Vec<KernelSpec>,
    #[serde(default)]
    pub sampling: ExtractOptions,
    #[serde(default)]
    pub columns: TableSelector,
    /// Write one file per kernel instead of a single long table
    #[serde(default)]
    pub per_kernel: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub kernels: Vec<KernelSpec>,
    #[serde(flatten)]
    pub export: ImageExport,
}

impl PipelineConfig {
    /// Parse and validate a config file. Relative paths are resolved
    /// against the directory holding the file.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Reading config: {}", path.display());
        let text = fs::read_to_string(path)?;
        let mut config: PipelineConfig = serde_json::from_str(&text)?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, dir: &Path) {
        if let Some(catalog) = &mut self.catalog {
            *catalog = dir.join(&*catalog);
        }
        if let Some(points) = &mut self.points {
            points.path = dir.join(&points.path);
        }
        for layer in &mut self.layers {
            layer.path = dir.join(&layer.path);
        }
    }

    /// Names of every series and layer, the sources tables and images draw on
    pub fn source_names(&self) -> Vec<&str> {
        self.series
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.layers.iter().map(|l| l.name.as_str()))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.end < self.start {
            return Err(PipelineError::InvalidDateRange {
                start: self.start.to_string(),
                end: self.end.to_string(),
            });
        }
        self.interval.validate()?;
        self.aoi.validate()?;
        parse_epsg(&self.crs)?;
        if self.scale <= 0.0 || !self.scale.is_finite() {
            return Err(PipelineError::InvalidScale(self.scale));
        }
        if self.tile_scale == 0 {
            return Err(PipelineError::InvalidConfig("tile_scale must be at least 1".to_string()));
        }

        let mut names = BTreeSet::new();
        for name in self.source_names() {
            if !names.insert(name) {
                return Err(PipelineError::InvalidConfig(format!("source '{}' defined twice", name)));
            }
        }
        for series in &self.series {
            series.validate()?;
        }

        let mut outputs = BTreeSet::new();
        for table in &self.tables {
            if !outputs.insert(format!("table:{}", table.name)) {
                return Err(PipelineError::InvalidConfig(format!("table '{}' defined twice", table.name)));
            }
            self.check_source(&table.source)?;
            check_kernels(&table.name, &table.kernels)?;
            table.sampling.validate()?;
            if let Some(crs) = &table.sampling.crs {
                self.check_crs(crs)?;
            }
            if self.points.is_none() {
                return Err(PipelineError::InvalidConfig(format!(
                    "table '{}' needs a points file",
                    table.name
                )));
            }
        }
        for image in &self.images {
            if !outputs.insert(format!("image:{}", image.name)) {
                return Err(PipelineError::InvalidConfig(format!("image '{}' defined twice", image.name)));
            }
            self.check_source(&image.source)?;
            check_kernels(&image.name, &image.kernels)?;
            if let Some(crs) = &image.export.crs {
                self.check_crs(crs)?;
            }
            if let Some(scale) = image.export.scale {
                if scale <= 0.0 || !scale.is_finite() {
                    return Err(PipelineError::InvalidScale(scale));
                }
            }
            if let Some(region) = &image.export.region {
                region.validate()?;
            }
        }
        Ok(())
    }

    fn check_source(&self, name: &str) -> Result<()> {
        if self.source_names().contains(&name) {
            Ok(())
        } else {
            Err(PipelineError::UnknownSource(name.to_string()))
        }
    }

    fn check_crs(&self, crs: &str) -> Result<()> {
        crate::crs::ensure_same_crs(&self.crs, crs)
    }
}

/// Kernel outputs of one table or image must not collide
fn check_kernels(owner: &str, kernels: &[KernelSpec]) -> Result<()> {
    let mut suffixes = BTreeSet::new();
    for kernel in kernels {
        kernel.validate()?;
        if !suffixes.insert(kernel.band_name("")) {
            return Err(PipelineError::InvalidConfig(format!(
                "'{}' lists kernel radius {} with reducer {} twice",
                owner,
                kernel.radius_label(),
                kernel.reducer.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::IntervalUnit;

    const CONFIG: &str = r#"{
        "start": "2010-01-01",
        "end": "2012-01-01",
        "interval": {"count": 12, "unit": "months"},
        "aoi": {"min_x": 0, "min_y": 0, "max_x": 1000, "max_y": 1000},
        "scale": 10,
        "catalog": "scenes.json",
        "points": {"path": "sites.csv", "id": "location"},
        "series": [{"name": "s2", "indices": ["NDVI"],
                    "band_map": {"red": "B4", "nir": "B8"}}],
        "layers": [{"name": "landcover", "path": "lc.tif",
                    "fractions": {"band": "band_1", "classes": [{"value": 1, "name": "forest"}]}}],
        "tables": [{"name": "ndvi", "source": "s2",
                    "kernels": [{"radius": 150}, {"radius": 565}],
                    "columns": {"mode": "include", "columns": ["id", "NDVI_150"]}}],
        "images": [{"name": "lc", "source": "landcover", "scale": 30, "max_pixels": 1000000}]
    }"#;

    fn config() -> PipelineConfig {
        serde_json::from_str(CONFIG).unwrap()
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = config();
        assert_eq!(config.crs, "EPSG:3348");
        assert_eq!(config.interval.unit, IntervalUnit::Months);
        assert_eq!(config.tile_scale, 1);
        assert_eq!(config.points.as_ref().unwrap().columns.x, "x");
        assert_eq!(config.tables[0].kernels.len(), 2);
        assert_eq!(config.images[0].export.scale, Some(30.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_source() {
        let mut config = config();
        config.tables[0].source = "landsat".to_string();
        assert!(matches!(config.validate(), Err(PipelineError::UnknownSource(s)) if s == "landsat"));
    }

    #[test]
    fn test_reversed_dates() {
        let mut config = config();
        config.end = NaiveDate::from_ymd_opt(2009, 1, 1).unwrap();
        assert!(matches!(config.validate(), Err(PipelineError::InvalidDateRange { .. })));
    }

    #[test]
    fn test_zero_interval() {
        let mut config = config();
        config.interval.count = 0;
        assert!(matches!(config.validate(), Err(PipelineError::InvalidInterval(_))));
    }

    #[test]
    fn test_repeated_kernel() {
        let mut config = config();
        config.tables[0].kernels.push(KernelSpec::circle(150.0));
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_tables_need_points() {
        let mut config = config();
        config.points = None;
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, CONFIG).unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.catalog, Some(dir.path().join("scenes.json")));
        assert_eq!(config.layers[0].path, dir.path().join("lc.tif"));
    }
}
