//! Spectral vegetation and moisture-stress indices.
//!
//! Each index is a fixed per-pixel formula over reflectance bands. Sensor
//! band names are resolved through a [`BandMap`], so the same index list
//! works for Sentinel-2 and Landsat composites.

use crate::error::{PipelineError, Result};
use crate::raster::{Band, Raster};
use log::debug;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpectralIndex {
    /// (NIR - Red) / (NIR + Red)
    Ndvi,
    /// Gao's water index: (NIR - SWIR1) / (NIR + SWIR1)
    Ndwi,
    /// Disease stress water index: (NIR + Green) / (SWIR1 + Red)
    Dswi,
    /// (NIR - Green) / (NIR + Green)
    Gndvi,
    /// Normalized burn ratio: (NIR - SWIR2) / (NIR + SWIR2)
    Nbr,
    /// (NIR - RE1) / (NIR + RE1)
    Ndre1,
    /// (NIR - RE2) / (NIR + RE2)
    Ndre2,
    /// (NIR - RE3) / (NIR + RE3)
    Ndre3,
    /// Ratio drought index: SWIR2 / NIR
    Rdi,
    /// Distance red-SWIR: sqrt(Red^2 + SWIR2^2)
    Drs,
    /// 2.5 (NIR - Red) / (NIR + 6 Red - 7.5 Blue + 1)
    Evi,
    /// Chlorophyll red-edge: RE3 / RE1 - 1
    Cre,
    /// Leaf area index from EVI: 3.618 EVI - 0.118
    Lai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandRole {
    Blue,
    Green,
    Red,
    RedEdge1,
    RedEdge2,
    RedEdge3,
    Nir,
    Swir1,
    Swir2,
}

/// Sensor band names for each reflectance role
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandMap {
    pub blue: Option<String>,
    pub green: Option<String>,
    pub red: Option<String>,
    pub red_edge1: Option<String>,
    pub red_edge2: Option<String>,
    pub red_edge3: Option<String>,
    pub nir: Option<String>,
    pub swir1: Option<String>,
    pub swir2: Option<String>,
}

impl BandMap {
    pub fn sentinel2() -> Self {
        Self {
            blue: Some("B2".into()),
            green: Some("B3".into()),
            red: Some("B4".into()),
            red_edge1: Some("B5".into()),
            red_edge2: Some("B6".into()),
            red_edge3: Some("B7".into()),
            nir: Some("B8".into()),
            swir1: Some("B11".into()),
            swir2: Some("B12".into()),
        }
    }

    /// Landsat 8/9 collection 2 surface reflectance (no red-edge bands)
    pub fn landsat() -> Self {
        Self {
            blue: Some("SR_B2".into()),
            green: Some("SR_B3".into()),
            red: Some("SR_B4".into()),
            red_edge1: None,
            red_edge2: None,
            red_edge3: None,
            nir: Some("SR_B5".into()),
            swir1: Some("SR_B6".into()),
            swir2: Some("SR_B7".into()),
        }
    }

    pub fn get(&self, role: BandRole) -> Option<&str> {
        let name = match role {
            BandRole::Blue => &self.blue,
            BandRole::Green => &self.green,
            BandRole::Red => &self.red,
            BandRole::RedEdge1 => &self.red_edge1,
            BandRole::RedEdge2 => &self.red_edge2,
            BandRole::RedEdge3 => &self.red_edge3,
            BandRole::Nir => &self.nir,
            BandRole::Swir1 => &self.swir1,
            BandRole::Swir2 => &self.swir2,
        };
        name.as_deref()
    }

    /// Every mapped sensor band name
    pub fn band_names(&self) -> Vec<String> {
        ALL_ROLES
            .iter()
            .filter_map(|&role| self.get(role).map(str::to_string))
            .collect()
    }
}

const ALL_ROLES: [BandRole; 9] = [
    BandRole::Blue,
    BandRole::Green,
    BandRole::Red,
    BandRole::RedEdge1,
    BandRole::RedEdge2,
    BandRole::RedEdge3,
    BandRole::Nir,
    BandRole::Swir1,
    BandRole::Swir2,
];

/// Reflectance of one pixel; unmapped roles hold `NaN`
#[derive(Debug, Clone, Copy)]
struct Pixel {
    blue: f32,
    green: f32,
    red: f32,
    re1: f32,
    re2: f32,
    re3: f32,
    nir: f32,
    swir1: f32,
    swir2: f32,
}

fn normalized_difference(a: f32, b: f32) -> f32 {
    let sum = a + b;
    if sum.abs() < 1e-10 {
        return f32::NAN;
    }
    (a - b) / sum
}

fn ratio(a: f32, b: f32) -> f32 {
    if b.abs() < 1e-10 {
        return f32::NAN;
    }
    a / b
}

impl SpectralIndex {
    pub fn name(&self) -> &'static str {
        match self {
            SpectralIndex::Ndvi => "NDVI",
            SpectralIndex::Ndwi => "NDWI",
            SpectralIndex::Dswi => "DSWI",
            SpectralIndex::Gndvi => "GNDVI",
            SpectralIndex::Nbr => "NBR",
            SpectralIndex::Ndre1 => "NDRE1",
            SpectralIndex::Ndre2 => "NDRE2",
            SpectralIndex::Ndre3 => "NDRE3",
            SpectralIndex::Rdi => "RDI",
            SpectralIndex::Drs => "DRS",
            SpectralIndex::Evi => "EVI",
            SpectralIndex::Cre => "CRE",
            SpectralIndex::Lai => "LAI",
        }
    }

    pub fn required_roles(&self) -> &'static [BandRole] {
        use BandRole::*;
        match self {
            SpectralIndex::Ndvi => &[Nir, Red],
            SpectralIndex::Ndwi => &[Nir, Swir1],
            SpectralIndex::Dswi => &[Nir, Green, Swir1, Red],
            SpectralIndex::Gndvi => &[Nir, Green],
            SpectralIndex::Nbr => &[Nir, Swir2],
            SpectralIndex::Ndre1 => &[Nir, RedEdge1],
            SpectralIndex::Ndre2 => &[Nir, RedEdge2],
            SpectralIndex::Ndre3 => &[Nir, RedEdge3],
            SpectralIndex::Rdi => &[Swir2, Nir],
            SpectralIndex::Drs => &[Red, Swir2],
            SpectralIndex::Evi | SpectralIndex::Lai => &[Nir, Red, Blue],
            SpectralIndex::Cre => &[RedEdge3, RedEdge1],
        }
    }

    fn evaluate(&self, p: &Pixel) -> f32 {
        match self {
            SpectralIndex::Ndvi => normalized_difference(p.nir, p.red),
            SpectralIndex::Ndwi => normalized_difference(p.nir, p.swir1),
            SpectralIndex::Dswi => ratio(p.nir + p.green, p.swir1 + p.red),
            SpectralIndex::Gndvi => normalized_difference(p.nir, p.green),
            SpectralIndex::Nbr => normalized_difference(p.nir, p.swir2),
            SpectralIndex::Ndre1 => normalized_difference(p.nir, p.re1),
            SpectralIndex::Ndre2 => normalized_difference(p.nir, p.re2),
            SpectralIndex::Ndre3 => normalized_difference(p.nir, p.re3),
            SpectralIndex::Rdi => ratio(p.swir2, p.nir),
            SpectralIndex::Drs => (p.red * p.red + p.swir2 * p.swir2).sqrt(),
            SpectralIndex::Evi => evi(p),
            SpectralIndex::Cre => ratio(p.re3, p.re1) - 1.0,
            SpectralIndex::Lai => 3.618 * evi(p) - 0.118,
        }
    }
}

fn evi(p: &Pixel) -> f32 {
    2.5 * ratio(p.nir - p.red, p.nir + 6.0 * p.red - 7.5 * p.blue + 1.0)
}

/// Check that every role needed by `indices` is mapped and present in `bands`
pub fn check_inputs(indices: &[SpectralIndex], band_map: &BandMap, bands: &[String]) -> Result<()> {
    for index in indices {
        for &role in index.required_roles() {
            let name = band_map.get(role).ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "{} needs a {:?} band but the band map has none",
                    index.name(),
                    role
                ))
            })?;
            if !bands.iter().any(|b| b == name) {
                return Err(PipelineError::MissingBand(name.to_string()));
            }
        }
    }
    Ok(())
}

fn role_array<'a>(raster: &'a Raster, band_map: &BandMap, role: BandRole, fallback: &'a Array2<f32>) -> Result<&'a Array2<f32>> {
    match band_map.get(role) {
        Some(name) if raster.has_band(name) => raster.band(name),
        _ => Ok(fallback),
    }
}

/// Append one band per index, named after the index (e.g. `NDVI`)
pub fn add_indices(raster: &mut Raster, indices: &[SpectralIndex], band_map: &BandMap) -> Result<()> {
    if indices.is_empty() {
        return Ok(());
    }
    check_inputs(indices, band_map, &raster.band_names())?;

    let missing = Array2::from_elem(raster.grid.shape(), f32::NAN);
    let mut computed = Vec::with_capacity(indices.len());
    {
        let shared: &Raster = raster;
        let missing = &missing;
        let get = |role| role_array(shared, band_map, role, missing);
        let (blue, green, red) = (get(BandRole::Blue)?, get(BandRole::Green)?, get(BandRole::Red)?);
        let (re1, re2, re3) = (
            get(BandRole::RedEdge1)?,
            get(BandRole::RedEdge2)?,
            get(BandRole::RedEdge3)?,
        );
        let (nir, swir1, swir2) = (get(BandRole::Nir)?, get(BandRole::Swir1)?, get(BandRole::Swir2)?);

        for index in indices {
            debug!("Computing {}", index.name());
            let mut out = Array2::from_elem(raster.grid.shape(), f32::NAN);
            Zip::indexed(&mut out).for_each(|idx, value| {
                let pixel = Pixel {
                    blue: blue[idx],
                    green: green[idx],
                    red: red[idx],
                    re1: re1[idx],
                    re2: re2[idx],
                    re3: re3[idx],
                    nir: nir[idx],
                    swir1: swir1[idx],
                    swir2: swir2[idx],
                };
                *value = index.evaluate(&pixel);
            });
            computed.push(Band::new(index.name(), out));
        }
    }

    for band in computed {
        raster.push_band(band)?;
    }
    Ok(())
}

/// Normalized DRS over the valid range of the composite, plus a binary
/// `NDRS_stressed` band (1 where NDRS exceeds `threshold`)
pub fn add_ndrs(raster: &mut Raster, drs_band: &str, threshold: f32) -> Result<()> {
    let drs = raster.band(drs_band)?;
    let (min, max) = drs
        .iter()
        .filter(|v| !v.is_nan())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let range = max - min;
    let valid_range = range.is_finite() && range > 0.0;
    let ndrs = drs.mapv(|v| {
        if v.is_nan() || !valid_range {
            f32::NAN
        } else {
            (v - min) / range
        }
    });
    let stressed = ndrs.mapv(|v| {
        if v.is_nan() {
            f32::NAN
        } else if v > threshold {
            1.0
        } else {
            0.0
        }
    });

    raster.push_band(Band::new("NDRS", ndrs))?;
    raster.push_band(Band::new("NDRS_stressed", stressed))?;
    Ok(())
}
