//! Pixel-level cleanup applied to each capture before compositing.

use crate::error::{PipelineError, Result};
use crate::raster::Raster;
use log::debug;
use ndarray::Zip;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PixelMask {
    /// Mask every band where any listed bit of the QA band is set
    QaBits { band: String, bits: Vec<u8> },
    /// Mask each listed band outside `[min, max]` (all bands when empty)
    ValidRange {
        #[serde(default)]
        bands: Vec<String>,
        min: f32,
        max: f32,
    },
}

impl PixelMask {
    /// Sentinel-2 QA60: opaque clouds (bit 10) and cirrus (bit 11)
    pub fn sentinel2_clouds() -> Self {
        PixelMask::QaBits {
            band: "QA60".to_string(),
            bits: vec![10, 11],
        }
    }

    /// Landsat collection 2 QA_PIXEL: dilated cloud, cloud, cloud shadow
    pub fn landsat_clouds() -> Self {
        PixelMask::QaBits {
            band: "QA_PIXEL".to_string(),
            bits: vec![1, 3, 4],
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            PixelMask::QaBits { bits, .. } if bits.iter().any(|&b| b >= 32) => Err(
                PipelineError::InvalidConfig(format!("QA bits must be below 32, got {:?}", bits)),
            ),
            PixelMask::ValidRange { min, max, .. } if min.is_nan() || max.is_nan() || min > max => Err(PipelineError::InvalidConfig(
                format!("valid range min {} exceeds max {}", min, max),
            )),
            _ => Ok(()),
        }
    }

    pub fn apply(&self, raster: &mut Raster) -> Result<()> {
        match self {
            PixelMask::QaBits { band, bits } => apply_qa_bits(raster, band, bits),
            PixelMask::ValidRange { bands, min, max } => apply_valid_range(raster, bands, *min, *max),
        }
    }
}

fn apply_qa_bits(raster: &mut Raster, qa_band: &str, bits: &[u8]) -> Result<()> {
    let flags: u32 = bits.iter().fold(0, |acc, &b| acc | (1u32 << b));
    let qa = raster.band(qa_band)?.clone();
    let masked = qa
        .iter()
        .filter(|v| !v.is_nan() && (**v as u32) & flags != 0)
        .count();
    debug!("QA mask on {}: {} cells flagged", qa_band, masked);

    for name in raster.band_names() {
        if name == qa_band {
            continue;
        }
        let data = raster.band_mut(&name)?;
        Zip::from(data).and(&qa).for_each(|value, &q| {
            if !q.is_nan() && (q as u32) & flags != 0 {
                *value = f32::NAN;
            }
        });
    }
    Ok(())
}

fn apply_valid_range(raster: &mut Raster, bands: &[String], min: f32, max: f32) -> Result<()> {
    let targets = if bands.is_empty() {
        raster.band_names()
    } else {
        bands.to_vec()
    };
    for name in targets {
        raster.band_mut(&name)?.mapv_inplace(|v| if v < min || v > max { f32::NAN } else { v });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Band, Grid};
    use ndarray::arr2;

    fn raster() -> Raster {
        let grid = Grid::new(3, 1, [0.0, 10.0, 0.0, 10.0, 0.0, -10.0], "EPSG:3348").unwrap();
        Raster::with_bands(
            grid,
            vec![
                Band::new("B4", arr2(&[[0.1, 0.2, 0.3]])),
                Band::new("QA60", arr2(&[[0.0, 1024.0, 2048.0 + 1.0]])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_qa_bits_mask_clouds() {
        let mut r = raster();
        PixelMask::sentinel2_clouds().apply(&mut r).unwrap();
        let b4 = r.band("B4").unwrap();
        assert_eq!(b4[[0, 0]], 0.1);
        assert!(b4[[0, 1]].is_nan());
        assert!(b4[[0, 2]].is_nan());
        // QA band itself is left untouched
        assert_eq!(r.band("QA60").unwrap()[[0, 1]], 1024.0);
    }

    #[test]
    fn test_missing_qa_band() {
        let mut r = raster();
        let result = PixelMask::landsat_clouds().apply(&mut r);
        assert!(matches!(result, Err(PipelineError::MissingBand(_))));
    }

    #[test]
    fn test_valid_range() {
        let mut r = raster();
        let mask = PixelMask::ValidRange {
            bands: vec!["B4".to_string()],
            min: 0.15,
            max: 1.0,
        };
        mask.apply(&mut r).unwrap();
        let b4 = r.band("B4").unwrap();
        assert!(b4[[0, 0]].is_nan());
        assert_eq!(b4[[0, 2]], 0.3);
    }

    #[test]
    fn test_validate() {
        let bad = PixelMask::QaBits {
            band: "QA".into(),
            bits: vec![40],
        };
        assert!(bad.validate().is_err());
        assert!(PixelMask::sentinel2_clouds().validate().is_ok());
    }

    #[test]
    fn test_parse_tagged() {
        let mask: PixelMask =
            serde_json::from_str(r#"{"type": "qa_bits", "band": "QA60", "bits": [10, 11]}"#).unwrap();
        assert_eq!(mask, PixelMask::sentinel2_clouds());
    }
}
