use crate::error::{PipelineError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Axis-aligned region in the pipeline CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.max_x <= self.min_x || self.max_y <= self.min_y {
            return Err(PipelineError::InvalidConfig(format!(
                "degenerate bounding box {:?}",
                self
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }
}

/// Pixel grid: size, north-up geotransform and CRS identifier
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    /// GDAL ordering: [origin_x, pixel_width, 0, origin_y, 0, -pixel_height]
    pub geotransform: [f64; 6],
    pub crs: String,
}

impl Grid {
    pub fn new(width: usize, height: usize, geotransform: [f64; 6], crs: impl Into<String>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidDimensions(width, height));
        }
        if geotransform[1] <= 0.0 {
            return Err(PipelineError::InvalidPixelSize(geotransform[1]));
        }
        if geotransform[5] >= 0.0 {
            return Err(PipelineError::InvalidPixelSize(geotransform[5]));
        }
        Ok(Self {
            width,
            height,
            geotransform,
            crs: crs.into(),
        })
    }

    /// Grid covering `bounds` with square pixels of `scale` units
    pub fn from_bounds(bounds: &BoundingBox, scale: f64, crs: impl Into<String>) -> Result<Self> {
        if scale <= 0.0 || !scale.is_finite() {
            return Err(PipelineError::InvalidScale(scale));
        }
        bounds.validate()?;
        let width = (bounds.width() / scale).ceil() as usize;
        let height = (bounds.height() / scale).ceil() as usize;
        Self::new(
            width,
            height,
            [bounds.min_x, scale, 0.0, bounds.max_y, 0.0, -scale],
            crs,
        )
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_width(&self) -> f64 {
        self.geotransform[1].abs()
    }

    pub fn pixel_height(&self) -> f64 {
        self.geotransform[5].abs()
    }

    pub fn bounds(&self) -> BoundingBox {
        let min_x = self.geotransform[0];
        let max_y = self.geotransform[3];
        BoundingBox::new(
            min_x,
            max_y - self.height as f64 * self.pixel_height(),
            min_x + self.width as f64 * self.pixel_width(),
            max_y,
        )
    }

    /// Map coordinates of the centre of cell (row, col)
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.geotransform[0] + (col as f64 + 0.5) * self.pixel_width();
        let y = self.geotransform[3] - (row as f64 + 0.5) * self.pixel_height();
        (x, y)
    }

    /// Cell containing the map coordinate, if inside the grid
    pub fn cell_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.geotransform[0]) / self.pixel_width()).floor();
        let row = ((self.geotransform[3] - y) / self.pixel_height()).floor();
        if col < 0.0 || row < 0.0 || !col.is_finite() || !row.is_finite() {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        if row >= self.height || col >= self.width {
            return None;
        }
        Some((row, col))
    }
}

/// Property attached to a raster and copied onto sample rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Integer(v) => write!(f, "{}", v),
            PropertyValue::Number(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub name: String,
    pub data: Array2<f32>,
}

impl Band {
    pub fn new(name: impl Into<String>, data: Array2<f32>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Multiband float raster. Masked cells hold `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub grid: Grid,
    bands: Vec<Band>,
    pub properties: Properties,
}

impl Raster {
    pub fn new(grid: Grid) -> Self {
        Self {
            grid,
            bands: Vec::new(),
            properties: Properties::new(),
        }
    }

    pub fn with_bands(grid: Grid, bands: Vec<Band>) -> Result<Self> {
        let mut raster = Self::new(grid);
        for band in bands {
            raster.push_band(band)?;
        }
        Ok(raster)
    }

    /// Raster on `grid` with every listed band fully masked
    pub fn masked(grid: Grid, band_names: &[String]) -> Result<Self> {
        let shape = grid.shape();
        let bands = band_names
            .iter()
            .map(|name| Band::new(name.clone(), Array2::from_elem(shape, f32::NAN)))
            .collect();
        Self::with_bands(grid, bands)
    }

    pub fn push_band(&mut self, band: Band) -> Result<()> {
        if band.data.dim() != self.grid.shape() {
            return Err(PipelineError::BandShape {
                name: band.name,
                expected: self.grid.shape(),
                actual: band.data.dim(),
            });
        }
        if self.has_band(&band.name) {
            return Err(PipelineError::DuplicateBand(band.name));
        }
        self.bands.push(band);
        Ok(())
    }

    /// Stack all bands of `other` onto this raster (grids must match)
    pub fn add_bands(&mut self, other: Raster) -> Result<()> {
        if other.grid.crs != self.grid.crs {
            return Err(PipelineError::CrsMismatch {
                expected: self.grid.crs.clone(),
                found: other.grid.crs,
            });
        }
        for band in other.bands {
            self.push_band(band)?;
        }
        Ok(())
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.iter().map(|b| b.name.clone()).collect()
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.iter().any(|b| b.name == name)
    }

    pub fn band(&self, name: &str) -> Result<&Array2<f32>> {
        self.bands
            .iter()
            .find(|b| b.name == name)
            .map(|b| &b.data)
            .ok_or_else(|| PipelineError::MissingBand(name.to_string()))
    }

    pub fn band_mut(&mut self, name: &str) -> Result<&mut Array2<f32>> {
        self.bands
            .iter_mut()
            .find(|b| b.name == name)
            .map(|b| &mut b.data)
            .ok_or_else(|| PipelineError::MissingBand(name.to_string()))
    }

    /// Keep only `names`, in the given order
    pub fn select(&self, names: &[String]) -> Result<Raster> {
        let mut bands = Vec::with_capacity(names.len());
        for name in names {
            bands.push(Band::new(name.clone(), self.band(name)?.clone()));
        }
        let mut selected = Raster::with_bands(self.grid.clone(), bands)?;
        selected.properties = self.properties.clone();
        Ok(selected)
    }

    /// Rename every band; fails if two bands end up with the same name
    pub fn rename_bands<F>(mut self, rename: F) -> Result<Raster>
    where
        F: Fn(&str) -> String,
    {
        let bands = std::mem::take(&mut self.bands);
        for mut band in bands {
            band.name = rename(&band.name);
            self.push_band(band)?;
        }
        Ok(self)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Mask every cell whose centre lies outside `region`
    pub fn clip(&mut self, region: &BoundingBox) {
        let grid = self.grid.clone();
        for band in &mut self.bands {
            for ((row, col), value) in band.data.indexed_iter_mut() {
                let (x, y) = grid.cell_center(row, col);
                if !region.contains(x, y) {
                    *value = f32::NAN;
                }
            }
        }
    }

    /// True when no band holds a single valid cell
    pub fn is_fully_masked(&self) -> bool {
        self.bands
            .iter()
            .all(|b| b.data.iter().all(|v| v.is_nan()))
    }
}
