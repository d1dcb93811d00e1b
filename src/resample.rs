//! Nearest-neighbour resampling between grids that share a CRS.

use crate::crs::ensure_same_crs;
use crate::error::Result;
use crate::raster::{Band, Grid, Raster};
use log::debug;
use ndarray::Array2;
use rayon::prelude::*;

/// Sample every band of `raster` at the cell centres of `target`.
/// Target cells falling outside the source grid are masked.
pub fn resample_nearest(raster: &Raster, target: &Grid) -> Result<Raster> {
    ensure_same_crs(&target.crs, &raster.grid.crs)?;

    if raster.grid == *target {
        return Ok(raster.clone());
    }

    debug!(
        "Resampling {}x{} @ {:.3} onto {}x{} @ {:.3}",
        raster.grid.width,
        raster.grid.height,
        raster.grid.pixel_width(),
        target.width,
        target.height,
        target.pixel_width()
    );

    // Source cell for each target cell, computed once for all bands
    let lookup: Vec<Option<(usize, usize)>> = (0..target.height)
        .into_par_iter()
        .flat_map_iter(|row| {
            (0..target.width).map(move |col| {
                let (x, y) = target.cell_center(row, col);
                raster.grid.cell_at(x, y)
            })
        })
        .collect();

    let mut bands = Vec::with_capacity(raster.bands().len());
    for band in raster.bands() {
        let values: Vec<f32> = lookup
            .par_iter()
            .map(|cell| cell.map_or(f32::NAN, |(r, c)| band.data[[r, c]]))
            .collect();
        let data = Array2::from_shape_vec(target.shape(), values)?;
        bands.push(Band::new(band.name.clone(), data));
    }

    let mut resampled = Raster::with_bands(target.clone(), bands)?;
    resampled.properties = raster.properties.clone();
    Ok(resampled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn source() -> Raster {
        let grid = Grid::new(2, 2, [0.0, 10.0, 0.0, 20.0, 0.0, -10.0], "EPSG:3348").unwrap();
        Raster::with_bands(grid, vec![Band::new("A", arr2(&[[1.0, 2.0], [3.0, 4.0]]))]).unwrap()
    }

    #[test]
    fn test_upsample_repeats_cells() {
        let target = Grid::new(4, 4, [0.0, 5.0, 0.0, 20.0, 0.0, -5.0], "EPSG:3348").unwrap();
        let out = resample_nearest(&source(), &target).unwrap();
        let a = out.band("A").unwrap();
        assert_eq!(a[[0, 0]], 1.0);
        assert_eq!(a[[1, 1]], 1.0);
        assert_eq!(a[[0, 3]], 2.0);
        assert_eq!(a[[3, 0]], 3.0);
        assert_eq!(a[[3, 3]], 4.0);
    }

    #[test]
    fn test_outside_source_is_masked() {
        let target = Grid::new(3, 1, [0.0, 10.0, 0.0, 10.0, 0.0, -10.0], "EPSG:3348").unwrap();
        let out = resample_nearest(&source(), &target).unwrap();
        let a = out.band("A").unwrap();
        assert_eq!(a[[0, 0]], 3.0);
        assert_eq!(a[[0, 1]], 4.0);
        assert!(a[[0, 2]].is_nan());
    }

    #[test]
    fn test_crs_mismatch_fails() {
        let target = Grid::new(2, 2, [0.0, 10.0, 0.0, 20.0, 0.0, -10.0], "EPSG:4326").unwrap();
        assert!(resample_nearest(&source(), &target).is_err());
    }
}
