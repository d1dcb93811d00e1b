use crate::error::{PipelineError, Result};
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RadiusMode {
    /// Radius is a map distance, converted with the pixel size
    Meters,
    /// Radius already counts cells
    Cells,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinearUnit {
    Meters,
    Degrees,
    Unknown,
}

/// Parse `EPSG:nnnn` (case-insensitive) into its numeric code
pub fn parse_epsg(crs: &str) -> Result<u32> {
    let trimmed = crs.trim();
    let code = trimmed
        .get(..5)
        .filter(|prefix| prefix.eq_ignore_ascii_case("EPSG:"))
        .map(|_| &trimmed[5..])
        .ok_or_else(|| PipelineError::CrsError(format!("expected EPSG:<code>, got '{}'", crs)))?;
    code.parse::<u32>()
        .map_err(|_| PipelineError::CrsError(format!("invalid EPSG code in '{}'", crs)))
}

/// Linear unit of the CRS, resolved through GDAL when it is available
#[cfg(feature = "gdal")]
pub fn linear_unit(crs: &str) -> LinearUnit {
    use gdal::spatial_ref::SpatialRef;

    let code = match parse_epsg(crs) {
        Ok(code) => code,
        Err(e) => {
            warn!("{}", e);
            return LinearUnit::Unknown;
        }
    };
    let spatial_ref = match SpatialRef::from_epsg(code) {
        Ok(sr) => sr,
        Err(e) => {
            warn!("Failed to resolve EPSG:{}: {}", code, e);
            return LinearUnit::Unknown;
        }
    };
    if spatial_ref.is_geographic() {
        LinearUnit::Degrees
    } else if spatial_ref.is_projected() && (spatial_ref.linear_units() - 1.0).abs() < 0.01 {
        LinearUnit::Meters
    } else {
        LinearUnit::Unknown
    }
}

/// Linear unit of the CRS, read from the proj4 definition bundled with
/// `crs-definitions`. Codes missing from the table are `Unknown`.
#[cfg(not(feature = "gdal"))]
pub fn linear_unit(crs: &str) -> LinearUnit {
    let code = match parse_epsg(crs) {
        Ok(code) => code,
        Err(e) => {
            warn!("{}", e);
            return LinearUnit::Unknown;
        }
    };
    let definition = u16::try_from(code).ok().and_then(crs_definitions::from_code);
    match definition {
        Some(def) => unit_from_proj4(def.proj4),
        None => {
            warn!("EPSG:{} is not in the bundled CRS table", code);
            LinearUnit::Unknown
        }
    }
}

#[cfg(not(feature = "gdal"))]
fn unit_from_proj4(proj4: &str) -> LinearUnit {
    let mut params = proj4.split_whitespace();
    if params.clone().any(|p| p == "+proj=longlat" || p == "+proj=latlong") {
        return LinearUnit::Degrees;
    }
    if params.any(|p| p == "+units=m") {
        LinearUnit::Meters
    } else {
        LinearUnit::Unknown
    }
}

/// Decide whether a radius is interpreted in meters or in cells.
///
/// Geographic CRSs fall back to cells. A CRS whose unit cannot be resolved
/// is an error unless the kernel is already in cells.
pub fn detect_radius_mode(crs: &str, force_cells: bool) -> Result<RadiusMode> {
    if force_cells {
        debug!("Radius mode: CELLS (kernel units are pixels)");
        return Ok(RadiusMode::Cells);
    }

    match linear_unit(crs) {
        LinearUnit::Meters => Ok(RadiusMode::Meters),
        LinearUnit::Degrees => {
            warn!("Geographic CRS {} detected (lat/lon), using radius as CELLS", crs);
            Ok(RadiusMode::Cells)
        }
        LinearUnit::Unknown => Err(PipelineError::CrsError(format!(
            "linear unit of '{}' is not meters; give the kernel radius in pixels",
            crs
        ))),
    }
}

/// Kernel radius as a whole number of cells (rounded up)
pub fn calculate_radius_in_cells(radius: f64, pixel_size: f64, mode: RadiusMode) -> usize {
    let cells = match mode {
        RadiusMode::Meters => (radius / pixel_size).ceil() as usize,
        RadiusMode::Cells => radius.ceil() as usize,
    };
    debug!("Radius {} ({:?}) spans {} cells at pixel size {:.3}", radius, mode, cells, pixel_size);
    cells
}

/// CRS identifiers are compared case-insensitively; no reprojection happens
pub fn ensure_same_crs(expected: &str, found: &str) -> Result<()> {
    if expected.trim().eq_ignore_ascii_case(found.trim()) {
        return Ok(());
    }
    Err(PipelineError::CrsMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_in_cells() {
        assert_eq!(calculate_radius_in_cells(565.0, 10.0, RadiusMode::Meters), 57);
        assert_eq!(calculate_radius_in_cells(150.0, 30.0, RadiusMode::Meters), 5);
        assert_eq!(calculate_radius_in_cells(2.5, 30.0, RadiusMode::Cells), 3);
    }

    #[test]
    fn test_pixel_units_override_crs() {
        assert_eq!(detect_radius_mode("EPSG:3348", true).unwrap(), RadiusMode::Cells);
        assert_eq!(detect_radius_mode("local", true).unwrap(), RadiusMode::Cells);
    }

    #[test]
    fn test_parse_epsg() {
        assert_eq!(parse_epsg("EPSG:3348").unwrap(), 3348);
        assert_eq!(parse_epsg("epsg:4326").unwrap(), 4326);
        assert!(parse_epsg("3348").is_err());
        assert!(parse_epsg("EPSG:abc").is_err());
    }

    #[test]
    fn test_same_crs() {
        assert!(ensure_same_crs("EPSG:3348", "epsg:3348").is_ok());
        assert!(ensure_same_crs("EPSG:3348", "EPSG:4326").is_err());
    }

    #[test]
    fn test_geographic_uses_cells() {
        assert_eq!(detect_radius_mode("EPSG:4326", false).unwrap(), RadiusMode::Cells);
        assert_eq!(detect_radius_mode("EPSG:4152", false).unwrap(), RadiusMode::Cells);
    }

    #[test]
    fn test_projected_metric_codes() {
        for crs in ["EPSG:3348", "EPSG:32633", "EPSG:3857", "EPSG:2056"] {
            assert_eq!(linear_unit(crs), LinearUnit::Meters, "{}", crs);
            assert_eq!(detect_radius_mode(crs, false).unwrap(), RadiusMode::Meters);
        }
    }

    #[test]
    fn test_non_metric_or_unresolved_crs_rejects_map_radius() {
        // NAD83 / New York Long Island in US survey feet
        assert_eq!(linear_unit("EPSG:2263"), LinearUnit::Unknown);
        for crs in ["EPSG:2263", "EPSG:999999", "local"] {
            assert!(matches!(detect_radius_mode(crs, false), Err(PipelineError::CrsError(_))));
        }
    }
}
