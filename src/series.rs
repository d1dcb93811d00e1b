//! Periodic composites from a stream of raw captures.
//!
//! Each period is built independently: query the source, mask and scale every
//! capture, derive index bands, then reduce the stack pixel by pixel. Band
//! names and arithmetic are the same for every period, and an empty period
//! still produces a (fully masked) composite carrying its period tags.

use crate::error::{PipelineError, Result};
use crate::indices::{add_indices, add_ndrs, check_inputs, BandMap, SpectralIndex};
use crate::mask::PixelMask;
use crate::period::Period;
use crate::raster::{Band, BoundingBox, Grid, Raster};
use crate::reducer::Reducer;
use crate::resample::resample_nearest;
use crate::source::{Capture, ImageSource, QualityFilter};
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Recipe for one raster series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSpec {
    pub name: String,
    #[serde(default)]
    pub filter: QualityFilter,
    #[serde(default)]
    pub masks: Vec<PixelMask>,
    /// Multiplier applied to the mapped reflectance bands (e.g. 0.0001)
    #[serde(default)]
    pub scale_factor: Option<f32>,
    #[serde(default)]
    pub band_map: BandMap,
    #[serde(default)]
    pub indices: Vec<SpectralIndex>,
    /// Bands kept in the composite; empty keeps every band
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default = "default_composite_reducer")]
    pub reducer: Reducer,
    /// Adds `NDRS` and `NDRS_stressed` from the composite `DRS` band
    #[serde(default)]
    pub ndrs_threshold: Option<f32>,
    /// Prepended to every output band name (e.g. `s2_`)
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_composite_reducer() -> Reducer {
    Reducer::Median
}

impl SeriesSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: QualityFilter::default(),
            masks: Vec::new(),
            scale_factor: None,
            band_map: BandMap::default(),
            indices: Vec::new(),
            select: Vec::new(),
            reducer: default_composite_reducer(),
            ndrs_threshold: None,
            prefix: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        for mask in &self.masks {
            mask.validate()?;
        }
        if !self.indices.is_empty() {
            // Role coverage only; band presence is checked per capture
            check_inputs(&self.indices, &self.band_map, &self.band_map.band_names())?;
        }
        if self.ndrs_threshold.is_some() && !self.indices.contains(&SpectralIndex::Drs) {
            return Err(PipelineError::InvalidConfig(format!(
                "series '{}': NDRS needs the DRS index",
                self.name
            )));
        }
        let drs = SpectralIndex::Drs.name();
        if self.ndrs_threshold.is_some() && !self.select.is_empty() && !self.select.iter().any(|b| b == drs) {
            return Err(PipelineError::InvalidConfig(format!(
                "series '{}': NDRS reads the {} band, which select drops",
                self.name, drs
            )));
        }
        if let Some(factor) = self.scale_factor {
            if !factor.is_finite() || factor == 0.0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "series '{}': invalid scale factor {}",
                    self.name, factor
                )));
            }
        }
        Ok(())
    }

    /// Output band names when they are known without looking at any capture
    pub fn declared_bands(&self) -> Option<Vec<String>> {
        if self.select.is_empty() {
            return None;
        }
        let mut names = self.select.clone();
        if self.ndrs_threshold.is_some() {
            names.push("NDRS".to_string());
            names.push("NDRS_stressed".to_string());
        }
        Some(names.iter().map(|n| self.output_name(n)).collect())
    }

    fn output_name(&self, band: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, band),
            None => band.to_string(),
        }
    }

    /// Mask, scale, derive indices and select bands on one capture
    fn prepare(&self, capture: Capture) -> Result<Raster> {
        let mut raster = capture.raster;
        for mask in &self.masks {
            mask.apply(&mut raster)?;
        }
        if let Some(factor) = self.scale_factor {
            for name in self.band_map.band_names() {
                if raster.has_band(&name) {
                    raster.band_mut(&name)?.mapv_inplace(|v| v * factor);
                }
            }
        }
        add_indices(&mut raster, &self.indices, &self.band_map)?;
        if self.select.is_empty() {
            Ok(raster)
        } else {
            raster.select(&self.select)
        }
    }

    /// Source label stored on every composite
    fn source_label(&self) -> String {
        self.filter.collection.clone().unwrap_or_else(|| self.name.clone())
    }
}

/// Build one composite per period, in period order.
///
/// Captures are resampled onto `template` before reduction and the
/// composite is clipped to `aoi`.
pub fn build_series(
    source: &dyn ImageSource,
    periods: &[Period],
    aoi: &BoundingBox,
    template: &Grid,
    spec: &SeriesSpec,
) -> Result<Vec<Raster>> {
    spec.validate()?;
    info!("Building series '{}' over {} periods", spec.name, periods.len());

    let composites = periods
        .par_iter()
        .map(|period| composite_period(source, period, aoi, template, spec))
        .collect::<Result<Vec<Option<Raster>>>>()?;

    // Band names of empty periods follow the populated ones
    let band_names = spec.declared_bands().or_else(|| {
        composites
            .iter()
            .flatten()
            .next()
            .map(Raster::band_names)
    });
    let band_names = band_names.unwrap_or_else(|| {
        warn!("Series '{}' has no captures in any period", spec.name);
        Vec::new()
    });

    periods
        .iter()
        .zip(composites)
        .map(|(period, composite)| {
            let mut composite = match composite {
                Some(raster) => raster,
                None => {
                    warn!("Series '{}': no captures for period {}", spec.name, period.label());
                    let mut empty = Raster::masked(template.clone(), &band_names)?;
                    tag_period(&mut empty, period, spec, 0);
                    empty
                }
            };
            composite.clip(aoi);
            Ok(composite)
        })
        .collect()
}

fn composite_period(
    source: &dyn ImageSource,
    period: &Period,
    aoi: &BoundingBox,
    template: &Grid,
    spec: &SeriesSpec,
) -> Result<Option<Raster>> {
    let captures = source.query(&period.range(), aoi, &spec.filter)?;
    debug!(
        "Series '{}' period {}: {} captures",
        spec.name,
        period.label(),
        captures.len()
    );
    if captures.is_empty() {
        return Ok(None);
    }

    let image_count = captures.len();
    let mut stack = Vec::with_capacity(image_count);
    for capture in captures {
        let prepared = spec.prepare(capture)?;
        stack.push(resample_nearest(&prepared, template)?);
    }

    let mut composite = reduce_stack(&stack, template, spec.reducer)?;
    if let Some(threshold) = spec.ndrs_threshold {
        add_ndrs(&mut composite, SpectralIndex::Drs.name(), threshold)?;
    }
    if spec.prefix.is_some() {
        composite = composite.rename_bands(|name| spec.output_name(name))?;
    }
    tag_period(&mut composite, period, spec, image_count);
    Ok(Some(composite))
}

/// Per-pixel temporal reduction over captures sharing `grid`
fn reduce_stack(stack: &[Raster], grid: &Grid, reducer: Reducer) -> Result<Raster> {
    let names = stack.first().map(Raster::band_names).unwrap_or_default();
    let (height, width) = grid.shape();
    let mut bands = Vec::with_capacity(names.len());
    for name in names {
        let layers = stack
            .iter()
            .map(|raster| raster.band(&name))
            .collect::<Result<Vec<&Array2<f32>>>>()?;
        let values: Vec<f32> = (0..height * width)
            .into_par_iter()
            .map_init(Vec::new, |buf, i| {
                let idx = (i / width, i % width);
                buf.clear();
                buf.extend(layers.iter().map(|layer| layer[idx]).filter(|v| !v.is_nan()));
                reducer.reduce(buf)
            })
            .collect();
        bands.push(Band::new(name, Array2::from_shape_vec((height, width), values)?));
    }
    Raster::with_bands(grid.clone(), bands)
}

fn tag_period(raster: &mut Raster, period: &Period, spec: &SeriesSpec, image_count: usize) {
    let time_start = period
        .start
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().timestamp_millis())
        .unwrap_or_default();
    raster.set_property("date", period.label());
    raster.set_property("year", period.year() as i64);
    raster.set_property("month", period.month() as i64);
    raster.set_property("source", spec.source_label());
    raster.set_property("image_count", image_count as i64);
    raster.set_property("system:time_start", time_start);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::{generate_periods, Interval};
    use crate::raster::PropertyValue;
    use crate::source::MemorySource;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;
    use ndarray::arr2;

    fn template() -> Grid {
        Grid::new(2, 2, [0.0, 10.0, 0.0, 20.0, 0.0, -10.0], "EPSG:3348").unwrap()
    }

    fn aoi() -> BoundingBox {
        BoundingBox::new(0.0, 0.0, 20.0, 20.0)
    }

    fn capture(month: u32, red: f32, nir: f32, qa: f32) -> Capture {
        let raster = Raster::with_bands(
            template(),
            vec![
                Band::new("B4", Array2::from_elem((2, 2), red)),
                Band::new("B8", Array2::from_elem((2, 2), nir)),
                Band::new("QA60", arr2(&[[0.0, 0.0], [0.0, qa]])),
            ],
        )
        .unwrap();
        Capture {
            id: format!("cap-{}-{}", month, red),
            collection: "S2".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2020, month, 10)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            cloud_percentage: Some(5.0),
            raster,
        }
    }

    fn spec() -> SeriesSpec {
        SeriesSpec {
            masks: vec![PixelMask::sentinel2_clouds()],
            scale_factor: Some(0.0001),
            band_map: BandMap::sentinel2(),
            indices: vec![SpectralIndex::Ndvi],
            select: vec!["B4".to_string(), "NDVI".to_string()],
            prefix: Some("s2_".to_string()),
            ..SeriesSpec::new("sentinel2")
        }
    }

    fn periods() -> Vec<Period> {
        generate_periods(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(),
            Interval::months(1),
        )
        .unwrap()
    }

    fn source() -> MemorySource {
        MemorySource::new(vec![
            capture(1, 1000.0, 3000.0, 0.0),
            capture(1, 2000.0, 4000.0, 1024.0),
            capture(1, 3000.0, 5000.0, 0.0),
            capture(3, 1000.0, 1000.0, 0.0),
        ])
    }

    #[test]
    fn test_median_composite_with_masking() {
        let series = build_series(&source(), &periods(), &aoi(), &template(), &spec()).unwrap();
        assert_eq!(series.len(), 3);
        let january = &series[0];
        assert_eq!(january.band_names(), vec!["s2_B4", "s2_NDVI"]);
        let red = january.band("s2_B4").unwrap();
        assert_relative_eq!(red[[0, 0]], 0.2, epsilon = 1e-6);
        // Cloudy capture masked in the bottom-right cell: median of 0.1 and 0.3
        assert_relative_eq!(red[[1, 1]], 0.2, epsilon = 1e-6);
        assert_eq!(january.property("image_count"), Some(&PropertyValue::Integer(3)));
        assert_eq!(january.property("source"), Some(&PropertyValue::Text("sentinel2".into())));
    }

    #[test]
    fn test_empty_period_is_masked_but_tagged() {
        let series = build_series(&source(), &periods(), &aoi(), &template(), &spec()).unwrap();
        let february = &series[1];
        assert!(february.is_fully_masked());
        assert_eq!(february.band_names(), series[0].band_names());
        assert_eq!(february.property("date"), Some(&PropertyValue::Text("2020-02-01".into())));
        assert_eq!(february.property("month"), Some(&PropertyValue::Integer(2)));
        assert_eq!(february.property("image_count"), Some(&PropertyValue::Integer(0)));
    }

    #[test]
    fn test_band_names_from_captures_without_select() {
        let spec = SeriesSpec {
            select: Vec::new(),
            ..spec()
        };
        let series = build_series(&source(), &periods(), &aoi(), &template(), &spec).unwrap();
        assert_eq!(series[1].band_names(), vec!["s2_B4", "s2_B8", "s2_QA60", "s2_NDVI"]);
        assert_eq!(series[1].band_names(), series[2].band_names());
    }

    #[test]
    fn test_rebuilding_is_idempotent() {
        let first = build_series(&source(), &periods(), &aoi(), &template(), &spec()).unwrap();
        let second = build_series(&source(), &periods(), &aoi(), &template(), &spec()).unwrap();
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.band_names(), b.band_names());
            for name in a.band_names() {
                let (x, y) = (a.band(&name).unwrap(), b.band(&name).unwrap());
                assert!(x.iter().zip(y.iter()).all(|(p, q)| p == q || (p.is_nan() && q.is_nan())));
            }
        }
    }

    #[test]
    fn test_clip_to_aoi() {
        let aoi = BoundingBox::new(0.0, 10.0, 10.0, 20.0);
        let series = build_series(&source(), &periods(), &aoi, &template(), &spec()).unwrap();
        let red = series[0].band("s2_B4").unwrap();
        assert!(!red[[0, 0]].is_nan());
        assert!(red[[1, 1]].is_nan());
    }

    #[test]
    fn test_ndrs_requires_drs() {
        let spec = SeriesSpec {
            ndrs_threshold: Some(0.5),
            ..spec()
        };
        assert!(matches!(spec.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_ndrs_needs_drs_in_selection() {
        let mut spec = SeriesSpec {
            indices: vec![SpectralIndex::Ndvi, SpectralIndex::Drs],
            select: vec!["NDVI".to_string()],
            ndrs_threshold: Some(0.5),
            ..spec()
        };
        assert!(matches!(spec.validate(), Err(PipelineError::InvalidConfig(msg)) if msg.contains("DRS")));

        spec.select.push("DRS".to_string());
        assert!(spec.validate().is_ok());
        spec.select.clear();
        assert!(spec.validate().is_ok());
    }
}
