use crate::chunking::{tile_size_for, TileGrid, TileWindow};
use crate::crs::{calculate_radius_in_cells, detect_radius_mode, RadiusMode};
use crate::error::{PipelineError, Result};
use crate::raster::{Band, Grid, Raster};
use crate::reducer::Reducer;
use crate::resample::resample_nearest;
use log::{debug, info, warn};
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelShape {
    #[default]
    Circle,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelUnits {
    #[default]
    Meters,
    Pixels,
}

/// Neighborhood definition: shape, radius, units and the statistic to apply
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    #[serde(default)]
    pub shape: KernelShape,
    pub radius: f64,
    #[serde(default)]
    pub units: KernelUnits,
    #[serde(default)]
    pub reducer: Reducer,
}

impl KernelSpec {
    pub fn circle(radius: f64) -> Self {
        Self {
            shape: KernelShape::Circle,
            radius,
            units: KernelUnits::Meters,
            reducer: Reducer::Mean,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(PipelineError::InvalidRadius(self.radius));
        }
        if self.reducer == Reducer::First {
            return Err(PipelineError::InvalidConfig(
                "'first' is not a neighborhood reducer".to_string(),
            ));
        }
        Ok(())
    }

    /// `150` for whole radii, `2.5` otherwise
    pub fn radius_label(&self) -> String {
        if self.radius.fract() == 0.0 {
            format!("{}", self.radius as i64)
        } else {
            format!("{}", self.radius)
        }
    }

    /// Output name for `band`: `{band}_{radius}` for the mean, which is the
    /// conventional focal statistic, `{band}_{reducer}_{radius}` otherwise
    pub fn band_name(&self, band: &str) -> String {
        match self.reducer {
            Reducer::Mean => format!("{}_{}", band, self.radius_label()),
            other => format!("{}_{}_{}", band, other.name(), self.radius_label()),
        }
    }

    /// Window offsets for a pixel grid with the given cell size
    fn offsets(&self, crs: &str, pixel_size: f64) -> Result<Vec<(isize, isize)>> {
        let mode = detect_radius_mode(crs, self.units == KernelUnits::Pixels)?;
        let cells = calculate_radius_in_cells(self.radius, pixel_size, mode) as isize;
        let radius_in_cells = match mode {
            RadiusMode::Meters => self.radius / pixel_size,
            RadiusMode::Cells => self.radius,
        };

        let mut offsets = Vec::new();
        for dr in -cells..=cells {
            for dc in -cells..=cells {
                let inside = match self.shape {
                    KernelShape::Square => true,
                    KernelShape::Circle => {
                        ((dr * dr + dc * dc) as f64).sqrt() <= radius_in_cells + 1e-9
                    }
                };
                if inside {
                    offsets.push((dr, dc));
                }
            }
        }
        Ok(offsets)
    }
}

/// Apply `kernel` to every band of `raster`.
///
/// Masked cells are excluded from each window; a window without any valid
/// cell is masked in the output. Output bands are renamed with
/// [`KernelSpec::band_name`] and the raster gains a `radius` property.
pub fn aggregate(raster: &Raster, kernel: &KernelSpec, tile_scale: u32) -> Result<Raster> {
    kernel.validate()?;

    let grid = &raster.grid;
    if (grid.pixel_width() - grid.pixel_height()).abs() > 1e-9 {
        warn!(
            "Non-square pixels detected ({:.6} x {:.6}), using width for calculations",
            grid.pixel_width(),
            grid.pixel_height()
        );
    }

    let offsets = kernel.offsets(&grid.crs, grid.pixel_width())?;
    let padding = offsets.iter().map(|&(dr, _)| dr.unsigned_abs()).max().unwrap_or(0);
    let tiles = TileGrid::new(grid.height, grid.width, tile_size_for(tile_scale), padding)?;

    info!(
        "Focal {} over {} bands (radius {} {:?}, {} cells in window, {} tiles)",
        kernel.reducer.name(),
        raster.bands().len(),
        kernel.radius,
        kernel.units,
        offsets.len(),
        tiles.len()
    );

    let mut bands = Vec::with_capacity(raster.bands().len());
    for band in raster.bands() {
        debug!("Processing band {}", band.name);
        let data = focal_band(&band.data, &offsets, kernel.reducer, &tiles)?;
        bands.push(Band::new(kernel.band_name(&band.name), data));
    }

    let mut output = Raster::with_bands(grid.clone(), bands)?;
    output.properties = raster.properties.clone();
    output.set_property("radius", kernel.radius);
    Ok(output)
}

/// Apply every kernel in turn, resample each output onto `target` and stack
/// the results into one multiband raster.
pub fn aggregate_many(
    raster: &Raster,
    kernels: &[KernelSpec],
    target: &Grid,
    tile_scale: u32,
) -> Result<Raster> {
    let outputs = kernels
        .iter()
        .map(|kernel| aggregate(raster, kernel, tile_scale))
        .collect::<Result<Vec<_>>>()?;
    combine(outputs, target)
}

/// Band-stack rasters after resampling them onto one common grid.
///
/// Properties of the first raster win; a repeated band name is an error.
pub fn combine(rasters: Vec<Raster>, target: &Grid) -> Result<Raster> {
    let mut seen = BTreeSet::new();
    for name in rasters.iter().flat_map(|r| r.band_names()) {
        if !seen.insert(name.clone()) {
            return Err(PipelineError::DuplicateBand(name));
        }
    }

    let mut combined = Raster::new(target.clone());
    for raster in rasters {
        let resampled = resample_nearest(&raster, target)?;
        for (key, value) in &resampled.properties {
            combined
                .properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        combined.add_bands(resampled)?;
    }
    combined.properties.remove("radius");
    Ok(combined)
}

fn focal_band(
    data: &Array2<f32>,
    offsets: &[(isize, isize)],
    reducer: Reducer,
    tiles: &TileGrid,
) -> Result<Array2<f32>> {
    let results: Vec<(TileWindow, Array2<f32>)> = tiles
        .windows()
        .into_par_iter()
        .map(|window| {
            let padded = data.slice(s![
                window.read_row_start..window.read_row_end,
                window.read_col_start..window.read_col_end
            ]);
            let out = focal_tile(padded, &window, offsets, reducer);
            (window, out)
        })
        .collect();

    let mut output = Array2::from_elem(data.dim(), f32::NAN);
    for (window, tile) in results {
        output
            .slice_mut(s![window.row_start..window.row_end, window.col_start..window.col_end])
            .assign(&tile);
    }
    Ok(output)
}

/// Reduce the windows centred on each output cell of one tile
fn focal_tile(
    padded: ArrayView2<f32>,
    window: &TileWindow,
    offsets: &[(isize, isize)],
    reducer: Reducer,
) -> Array2<f32> {
    let (nrows, ncols) = padded.dim();
    let row_offset = window.row_start - window.read_row_start;
    let col_offset = window.col_start - window.read_col_start;
    let mut values = Vec::with_capacity(offsets.len());

    Array2::from_shape_fn((window.rows(), window.cols()), |(r, c)| {
        let center_row = (r + row_offset) as isize;
        let center_col = (c + col_offset) as isize;
        values.clear();
        for &(dr, dc) in offsets {
            let row = center_row + dr;
            let col = center_col + dc;
            if row < 0 || col < 0 || row >= nrows as isize || col >= ncols as isize {
                continue;
            }
            let value = padded[[row as usize, col as usize]];
            // Skip masked cells
            if !value.is_nan() {
                values.push(value);
            }
        }
        reducer.reduce(&mut values)
    })
}

/// Indicator bands (1 inside the class, 0 elsewhere, masked on nodata) for
/// each `(value, name)` class of a categorical band. A focal mean of these
/// bands gives the fraction of each class around every cell.
pub fn class_indicators(
    raster: &Raster,
    band: &str,
    classes: &[(i32, String)],
    nodata: Option<i32>,
) -> Result<Raster> {
    let data = raster.band(band)?;
    let bands = classes
        .par_iter()
        .map(|(class_value, name)| {
            debug!("Building indicator for class {} ({})", class_value, name);
            let indicator = data.mapv(|v| {
                if v.is_nan() || nodata.is_some_and(|nd| v as i32 == nd) {
                    f32::NAN
                } else if v as i32 == *class_value {
                    1.0
                } else {
                    0.0
                }
            });
            Band::new(name.clone(), indicator)
        })
        .collect();

    let mut output = Raster::with_bands(raster.grid.clone(), bands)?;
    output.properties = raster.properties.clone();
    Ok(output)
}

/// Extract unique classes from a categorical band, excluding nodata
pub fn extract_classes(data: &Array2<f32>, nodata: Option<i32>) -> Vec<i32> {
    let classes: BTreeSet<i32> = data
        .iter()
        .filter(|v| !v.is_nan())
        .map(|&v| v as i32)
        .filter(|&v| nodata != Some(v))
        .collect();
    classes.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    fn grid(width: usize, height: usize, pixel: f64) -> Grid {
        Grid::new(
            width,
            height,
            [0.0, pixel, 0.0, height as f64 * pixel, 0.0, -pixel],
            "EPSG:3348",
        )
        .unwrap()
    }

    fn square_mean(radius_cells: f64) -> KernelSpec {
        KernelSpec {
            shape: KernelShape::Square,
            radius: radius_cells,
            units: KernelUnits::Pixels,
            reducer: Reducer::Mean,
        }
    }

    #[test]
    fn test_mean_of_uniform_is_uniform() {
        let raster = Raster::with_bands(grid(3, 3, 30.0), vec![Band::new("A", Array2::from_elem((3, 3), 2.0))]).unwrap();
        let out = aggregate(&raster, &square_mean(1.0), 1).unwrap();
        assert!(out.band("A_1").unwrap().iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_masked_cells_excluded_from_denominator() {
        let data = arr2(&[[1.0, 2.0, f32::NAN], [2.0, 1.0, 2.0], [1.0, 2.0, 1.0]]);
        let raster = Raster::with_bands(grid(3, 3, 30.0), vec![Band::new("A", data)]).unwrap();
        let out = aggregate(&raster, &square_mean(1.0), 1).unwrap();
        // 8 valid cells summing to 12
        assert_relative_eq!(out.band("A_1").unwrap()[[1, 1]], 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_fully_masked_window_stays_masked() {
        let data = Array2::from_elem((3, 3), f32::NAN);
        let raster = Raster::with_bands(grid(3, 3, 30.0), vec![Band::new("A", data)]).unwrap();
        let out = aggregate(&raster, &square_mean(1.0), 1).unwrap();
        assert!(out.is_fully_masked());
    }

    #[test]
    fn test_edges_use_partial_windows() {
        let data = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
        let raster = Raster::with_bands(grid(3, 3, 30.0), vec![Band::new("A", data)]).unwrap();
        let out = aggregate(&raster, &square_mean(1.0), 1).unwrap();
        // (1 + 2 + 4 + 5) / 4
        assert_relative_eq!(out.band("A_1").unwrap()[[0, 0]], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_tiling_matches_single_tile() {
        let data = Array2::from_shape_fn((40, 37), |(r, c)| ((r * 7 + c * 3) % 11) as f32);
        let raster = Raster::with_bands(grid(37, 40, 10.0), vec![Band::new("A", data)]).unwrap();
        let kernel = KernelSpec::circle(30.0);
        let single = aggregate(&raster, &kernel, 1).unwrap();
        // tile_scale 64 gives 16-cell tiles
        let tiled = aggregate(&raster, &kernel, 64).unwrap();
        assert_eq!(single.band("A_30").unwrap(), tiled.band("A_30").unwrap());
    }

    #[test]
    fn test_circle_in_meters_excludes_corners() {
        let kernel = KernelSpec::circle(20.0);
        let offsets = kernel.offsets("EPSG:3348", 10.0).unwrap();
        assert!(offsets.contains(&(2, 0)));
        assert!(offsets.contains(&(1, 1)));
        assert!(!offsets.contains(&(2, 2)));
        assert_eq!(offsets.len(), 13);
    }

    #[test]
    fn test_band_names_encode_reducer_and_radius() {
        let mut kernel = KernelSpec::circle(150.0);
        assert_eq!(kernel.band_name("NDVI"), "NDVI_150");
        kernel.reducer = Reducer::StdDev;
        assert_eq!(kernel.band_name("NDVI"), "NDVI_stddev_150");
        kernel.radius = 2.5;
        assert_eq!(kernel.band_name("NDVI"), "NDVI_stddev_2.5");
    }

    #[test]
    fn test_two_radii_combine_to_four_bands() {
        let target = grid(10, 10, 30.0);
        let bands = vec![
            Band::new("A", Array2::from_elem((10, 10), 1.0)),
            Band::new("B", Array2::from_elem((10, 10), 2.0)),
        ];
        let raster = Raster::with_bands(target.clone(), bands).unwrap();
        let kernels = [KernelSpec::circle(150.0), KernelSpec::circle(565.0)];
        let combined = aggregate_many(&raster, &kernels, &target, 1).unwrap();
        assert_eq!(combined.band_names(), vec!["A_150", "B_150", "A_565", "B_565"]);
        assert_eq!(combined.grid, target);
    }

    #[test]
    fn test_combine_resamples_to_target() {
        let coarse = Raster::with_bands(grid(2, 2, 20.0), vec![Band::new("A_40", Array2::from_elem((2, 2), 1.0))]).unwrap();
        let fine = Raster::with_bands(grid(4, 4, 10.0), vec![Band::new("A_10", Array2::from_elem((4, 4), 2.0))]).unwrap();
        let target = grid(4, 4, 10.0);
        let combined = combine(vec![fine, coarse], &target).unwrap();
        assert_eq!(combined.grid, target);
        assert_eq!(combined.band("A_40").unwrap().dim(), (4, 4));
        assert_eq!(combined.band("A_40").unwrap()[[3, 3]], 1.0);
    }

    #[test]
    fn test_combine_rejects_duplicates() {
        let g = grid(2, 2, 10.0);
        let a = Raster::with_bands(g.clone(), vec![Band::new("A_150", Array2::zeros((2, 2)))]).unwrap();
        let b = a.clone();
        assert!(matches!(combine(vec![a, b], &g), Err(PipelineError::DuplicateBand(_))));
    }

    #[test]
    fn test_class_fractions() {
        let data = arr2(&[[1.0, 2.0, -9999.0], [2.0, 1.0, 2.0], [1.0, 2.0, 1.0]]);
        let raster = Raster::with_bands(grid(3, 3, 30.0), vec![Band::new("lc", data)]).unwrap();
        let classes = vec![(1, "Coniferous".to_string()), (2, "Wetland".to_string())];
        let indicators = class_indicators(&raster, "lc", &classes, Some(-9999)).unwrap();
        let fractions = aggregate(&indicators, &square_mean(1.0), 1).unwrap();
        // 4 of 8 valid cells are class 1
        assert_relative_eq!(fractions.band("Coniferous_1").unwrap()[[1, 1]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(fractions.band("Wetland_1").unwrap()[[1, 1]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_extract_classes() {
        let data = arr2(&[[1.0, 2.0, 3.0], [2.0, 3.0, -9999.0], [1.0, f32::NAN, 2.0]]);
        assert_eq!(extract_classes(&data, Some(-9999)), vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_radius() {
        let raster = Raster::with_bands(grid(2, 2, 10.0), vec![Band::new("A", Array2::zeros((2, 2)))]).unwrap();
        let result = aggregate(&raster, &KernelSpec::circle(0.0), 1);
        assert!(matches!(result, Err(PipelineError::InvalidRadius(_))));
    }

    #[test]
    fn test_map_radius_needs_metric_crs() {
        let feet = Grid::new(4, 4, [0.0, 10.0, 0.0, 40.0, 0.0, -10.0], "EPSG:2263").unwrap();
        let raster = Raster::with_bands(feet, vec![Band::new("A", Array2::zeros((4, 4)))]).unwrap();
        let result = aggregate(&raster, &KernelSpec::circle(565.0), 1);
        assert!(matches!(result, Err(PipelineError::CrsError(_))));
        assert!(aggregate(&raster, &square_mean(1.0), 1).is_ok());
    }
}
