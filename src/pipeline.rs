//! Plan, then evaluate.
//!
//! [`Plan::new`] turns a validated configuration into the period list and
//! template grid without touching any imagery. [`Plan::evaluate`] is the
//! single entry point that reads captures and writes outputs.

use crate::config::{ImageSpec, LayerSpec, PipelineConfig, TableSpec};
use crate::error::{PipelineError, Result};
use crate::export::{export_image, write_table};
use crate::extract::{extract_series, SampleRow};
use crate::focal::{aggregate, aggregate_many, class_indicators, extract_classes, KernelSpec};
use crate::io::read_geotiff;
use crate::period::{generate_periods, Period};
use crate::points::{load_points, Point};
use crate::raster::{Grid, PropertyValue, Raster};
use crate::resample::resample_nearest;
use crate::series::build_series;
use crate::source::ImageSource;
use log::info;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

/// Files written by one evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outputs {
    pub tables: Vec<PathBuf>,
    pub images: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    config: PipelineConfig,
    periods: Vec<Period>,
    template: Grid,
    output_dir: PathBuf,
}

impl Plan {
    pub fn new(config: PipelineConfig, output_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let periods = generate_periods(config.start, config.end, config.interval)?;
        let template = Grid::from_bounds(&config.aoi, config.scale, config.crs.clone())?;
        Ok(Self {
            config,
            periods,
            template,
            output_dir: output_dir.into(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    pub fn template(&self) -> &Grid {
        &self.template
    }

    /// Human-readable summary of what [`Plan::evaluate`] would do
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let first = self.periods.first().map(Period::label).unwrap_or_default();
        let last = self.periods.last().map(Period::label).unwrap_or_default();
        let _ = writeln!(
            out,
            "{} periods every {} ({} .. {})",
            self.periods.len(),
            self.config.interval,
            first,
            last
        );
        let _ = writeln!(
            out,
            "Template grid: {}x{} @ {} in {}",
            self.template.width,
            self.template.height,
            self.config.scale,
            self.template.crs
        );
        for series in &self.config.series {
            let _ = writeln!(
                out,
                "Series {}: {} reducer, {} masks, indices {:?}",
                series.name,
                series.reducer.name(),
                series.masks.len(),
                series.indices.iter().map(|i| i.name()).collect::<Vec<_>>()
            );
        }
        for layer in &self.config.layers {
            let _ = writeln!(out, "Layer {}: {}", layer.name, layer.path.display());
        }
        for table in &self.config.tables {
            let _ = writeln!(
                out,
                "Table {} <- {} (radii {:?})",
                table.name,
                table.source,
                table.kernels.iter().map(KernelSpec::radius_label).collect::<Vec<_>>()
            );
        }
        for image in &self.config.images {
            let scale = image
                .export
                .scale
                .map_or_else(|| "native".to_string(), |s| s.to_string());
            let _ = writeln!(out, "Image {} <- {} (scale {})", image.name, image.source, scale);
        }
        out
    }

    /// Points named by the configuration, or none
    pub fn load_points(&self) -> Result<Vec<Point>> {
        match &self.config.points {
            Some(points) => load_points(&points.path, &points.columns),
            None => Ok(Vec::new()),
        }
    }

    pub fn evaluate(&self, source: &dyn ImageSource, points: &[Point]) -> Result<Outputs> {
        info!("Evaluating plan into {}", self.output_dir.display());
        let mut sources: BTreeMap<String, Vec<Raster>> = BTreeMap::new();
        for spec in &self.config.series {
            let series = build_series(source, &self.periods, &self.config.aoi, &self.template, spec)?;
            sources.insert(spec.name.clone(), series);
        }
        for layer in &self.config.layers {
            sources.insert(layer.name.clone(), vec![self.load_layer(layer)?]);
        }

        let mut outputs = Outputs::default();
        for table in &self.config.tables {
            let rasters = lookup(&sources, &table.source)?;
            outputs.tables.extend(self.table_outputs(table, rasters, points)?);
        }
        for image in &self.config.images {
            let rasters = lookup(&sources, &image.source)?;
            outputs.images.extend(self.image_outputs(image, rasters)?);
        }
        info!(
            "Wrote {} tables and {} images",
            outputs.tables.len(),
            outputs.images.len()
        );
        Ok(outputs)
    }

    fn load_layer(&self, layer: &LayerSpec) -> Result<Raster> {
        let raster = read_geotiff(&layer.path, &self.config.crs)?;
        let mut raster = match &layer.fractions {
            None => raster,
            Some(fractions) => {
                let classes: Vec<(i32, String)> = if fractions.classes.is_empty() {
                    extract_classes(raster.band(&fractions.band)?, fractions.nodata)
                        .into_iter()
                        .map(|v| (v, format!("class_{}", v)))
                        .collect()
                } else {
                    fractions
                        .classes
                        .iter()
                        .map(|c| (c.value, c.name.clone()))
                        .collect()
                };
                info!("Layer {}: {} classes", layer.name, classes.len());
                class_indicators(&raster, &fractions.band, &classes, fractions.nodata)?
            }
        };
        raster.set_property("source", layer.name.clone());
        Ok(raster)
    }

    fn table_outputs(&self, table: &TableSpec, rasters: &[Raster], points: &[Point]) -> Result<Vec<PathBuf>> {
        let sample = |rasters: &[Raster]| extract_series(rasters, points, &table.sampling);
        let mut written = Vec::new();

        if table.kernels.is_empty() {
            let path = self.output_dir.join(format!("{}.csv", table.name));
            write_table(&sample(rasters)?, &table.columns, &path)?;
            written.push(path);
            return Ok(written);
        }

        // Long format: one block of rows per kernel radius
        let mut union: Vec<SampleRow> = Vec::new();
        for kernel in &table.kernels {
            let focal = rasters
                .iter()
                .map(|raster| aggregate(raster, kernel, self.config.tile_scale))
                .collect::<Result<Vec<_>>>()?;
            let rows = sample(&focal)?;
            if table.per_kernel {
                let path = self
                    .output_dir
                    .join(format!("{}{}.csv", table.name, kernel.band_name("")));
                write_table(&rows, &table.columns, &path)?;
                written.push(path);
            } else {
                union.extend(rows);
            }
        }
        if !table.per_kernel {
            let path = self.output_dir.join(format!("{}.csv", table.name));
            write_table(&union, &table.columns, &path)?;
            written.push(path);
        }
        Ok(written)
    }

    fn image_outputs(&self, image: &ImageSpec, rasters: &[Raster]) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(rasters.len());
        for (index, raster) in rasters.iter().enumerate() {
            let grid = image.export.target_grid(raster)?;
            let output = if image.kernels.is_empty() {
                resample_nearest(raster, &grid)?
            } else {
                aggregate_many(raster, &image.kernels, &grid, self.config.tile_scale)?
            };
            let stem = match output.property("date") {
                Some(PropertyValue::Text(date)) => format!("{}_{}", image.name, date),
                _ if rasters.len() > 1 => format!("{}_{}", image.name, index),
                _ => image.name.clone(),
            };
            let path = self.output_dir.join(format!("{}.tif", stem));
            export_image(&output, &image.export, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

fn lookup<'a>(sources: &'a BTreeMap<String, Vec<Raster>>, name: &str) -> Result<&'a [Raster]> {
    sources
        .get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| PipelineError::UnknownSource(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::TableSelector;
    use crate::raster::Band;
    use crate::source::{Capture, MemorySource};
    use chrono::NaiveDate;
    use ndarray::Array2;
    use std::fs;

    // 40 m x 40 m AOI at 10 m; three 1-month periods with no captures in February
    const CONFIG: &str = r#"{
        "start": "2020-01-01",
        "end": "2020-03-01",
        "interval": {"count": 1, "unit": "months"},
        "aoi": {"min_x": 0, "min_y": 0, "max_x": 40, "max_y": 40},
        "scale": 10,
        "points": {"path": "sites.csv"},
        "series": [{"name": "s2", "indices": ["NDVI"], "select": ["NDVI"],
                    "band_map": {"red": "B4", "nir": "B8"}}],
        "tables": [
            {"name": "ndvi", "source": "s2",
             "kernels": [{"radius": 10}, {"radius": 20}],
             "columns": {"mode": "include", "columns": ["id", "date", "radius", "NDVI_10", "NDVI_20"]}},
            {"name": "raw", "source": "s2", "columns": {"mode": "all"}}
        ]
    }"#;

    fn capture(month: u32, nir: f32) -> Capture {
        let grid = Grid::new(4, 4, [0.0, 10.0, 0.0, 40.0, 0.0, -10.0], "EPSG:3348").unwrap();
        let raster = Raster::with_bands(
            grid,
            vec![
                Band::new("B4", Array2::from_elem((4, 4), 0.1)),
                Band::new("B8", Array2::from_elem((4, 4), nir)),
            ],
        )
        .unwrap();
        Capture {
            id: format!("scene-{}", month),
            collection: "S2".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2020, month, 5)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            cloud_percentage: None,
            raster,
        }
    }

    fn plan(dir: &std::path::Path) -> Plan {
        let config: PipelineConfig = serde_json::from_str(CONFIG).unwrap();
        Plan::new(config, dir.join("out")).unwrap()
    }

    fn points() -> Vec<Point> {
        vec![Point::new("site-1", 15.0, 15.0), Point::new("site-2", 35.0, 35.0)]
    }

    fn read(path: &std::path::Path) -> Vec<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn test_plan_without_imagery() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path());
        assert_eq!(plan.periods().len(), 3);
        assert_eq!(plan.template().shape(), (4, 4));
        let summary = plan.describe();
        assert!(summary.starts_with("3 periods"));
        assert!(summary.contains("Table ndvi <- s2"));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_plan_rejects_invalid_config() {
        let mut config: PipelineConfig = serde_json::from_str(CONFIG).unwrap();
        config.scale = 0.0;
        assert!(matches!(Plan::new(config, "out"), Err(PipelineError::InvalidScale(_))));
    }

    #[test]
    fn test_evaluate_long_table() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path());
        let source = MemorySource::new(vec![capture(1, 0.3), capture(3, 0.5)]);
        let outputs = plan.evaluate(&source, &points()).unwrap();
        assert_eq!(outputs.tables.len(), 2);

        let records = read(&outputs.tables[0]);
        assert_eq!(records[0], vec!["id", "date", "radius", "NDVI_10", "NDVI_20"]);
        // 2 points x 3 periods x 2 radii
        assert_eq!(records.len() - 1, 12);

        let january = &records[1];
        assert_eq!(january[0], "site-1");
        assert_eq!(january[1], "2020-01-01");
        assert_eq!(january[2], "10");
        let ndvi: f64 = january[3].parse().unwrap();
        assert!((ndvi - 0.5).abs() < 1e-6);
        assert_eq!(january[4], "");

        // February has no captures: rows kept, values empty, label present
        let february: Vec<&Vec<String>> = records.iter().filter(|r| r[1] == "2020-02-01").collect();
        assert_eq!(february.len(), 4);
        assert!(february.iter().all(|r| r[3].is_empty() && r[4].is_empty()));
    }

    #[test]
    fn test_evaluate_all_columns_and_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path());
        let source = MemorySource::new(vec![capture(1, 0.3)]);
        let first = plan.evaluate(&source, &points()).unwrap();
        let before = fs::read_to_string(&first.tables[1]).unwrap();
        let second = plan.evaluate(&source, &points()).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&second.tables[1]).unwrap(), before);

        let records = read(&second.tables[1]);
        assert_eq!(
            records[0],
            vec!["id", "date", "image_count", "month", "source", "system:time_start", "year", "NDVI"]
        );
        assert_eq!(records.len() - 1, 6);
    }

    #[test]
    fn test_default_columns_keep_period_label() {
        let dir = tempfile::tempdir().unwrap();
        let json = CONFIG.replace(r#""source": "s2", "columns": {"mode": "all"}"#, r#""source": "s2""#);
        let config: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.tables[1].columns, TableSelector::default());
        let plan = Plan::new(config, dir.path().join("out")).unwrap();
        let source = MemorySource::new(vec![capture(1, 0.3), capture(3, 0.5)]);
        let outputs = plan.evaluate(&source, &points()).unwrap();

        let records = read(&outputs.tables[1]);
        assert_eq!(records[0], vec!["id", "date", "image_count", "source", "NDVI"]);
        let site_dates: Vec<&str> = records[1..]
            .iter()
            .filter(|r| r[0] == "site-1")
            .map(|r| r[1].as_str())
            .collect();
        assert_eq!(site_dates, vec!["2020-01-01", "2020-02-01", "2020-03-01"]);
    }
}
