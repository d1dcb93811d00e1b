use crate::crs::parse_epsg;
use crate::error::{PipelineError, Result};
use crate::raster::{Band, Grid, Raster};
use log::{debug, info};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

#[cfg(not(feature = "gdal"))]
use crate::crs::{linear_unit, LinearUnit};
#[cfg(not(feature = "gdal"))]
use log::warn;
#[cfg(not(feature = "gdal"))]
use std::io::{BufWriter, Write};
#[cfg(not(feature = "gdal"))]
use tiff::encoder::{colortype::Gray32Float, TiffEncoder};

// GeoTIFF tags
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_METADATA: u16 = 42112;
const GDAL_NODATA: u16 = 42113;

// GeoKeys
#[cfg(not(feature = "gdal"))]
const GT_MODEL_TYPE: u32 = 1024;
const GEOGRAPHIC_TYPE: u32 = 2048;
const PROJECTED_CS_TYPE: u32 = 3072;

/// Read a (multi-page or multi-sample) GeoTIFF into a raster.
///
/// Each page contributes its samples as bands. A single-sample page is named
/// from its ImageDescription; samples of a multi-sample page take the band
/// descriptions GDAL stores in its metadata tag. Anything else is `band_{n}`.
/// The CRS comes from the GeoKey directory, falling back to `default_crs`.
pub fn read_geotiff(path: &Path, default_crs: &str) -> Result<Raster> {
    debug!("Opening raster: {}", path.display());
    let file = File::open(path)?;
    decode_geotiff(BufReader::new(file), default_crs)
}

fn decode_geotiff<R: Read + Seek>(reader: R, default_crs: &str) -> Result<Raster> {
    let mut decoder = Decoder::new(reader)?;
    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidDimensions(width, height));
    }

    let geotransform = read_geotransform(&mut decoder)?;
    let crs = read_epsg(&mut decoder)
        .map(|code| format!("EPSG:{}", code))
        .unwrap_or_else(|| default_crs.to_string());
    let nodata = decoder
        .get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_NODATA))
        .ok()
        .and_then(|s| clean_ascii(&s).parse::<f32>().ok());

    let grid = Grid::new(width, height, geotransform, crs)?;
    let mut raster = Raster::new(grid);
    let mut page = 0usize;

    loop {
        let (page_width, page_height) = decoder.dimensions()?;
        if page_width as usize != width || page_height as usize != height {
            return Err(PipelineError::InvalidDimensions(page_width as usize, page_height as usize));
        }
        let description = decoder.get_tag_ascii_string(Tag::ImageDescription).ok();
        let sample_names = decoder
            .get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_METADATA))
            .map(|xml| band_descriptions(&xml))
            .unwrap_or_default();
        let values = decoding_to_f32(decoder.read_image()?)?;
        let samples = values.len() / (width * height);
        if samples == 0 || samples * width * height != values.len() {
            return Err(PipelineError::InvalidDimensions(width, height));
        }

        for sample in 0..samples {
            let data: Vec<f32> = values
                .iter()
                .skip(sample)
                .step_by(samples)
                .map(|&v| match nodata {
                    Some(nd) if v == nd => f32::NAN,
                    _ => v,
                })
                .collect();
            let name = match (description.as_deref().map(clean_ascii), samples) {
                (Some(d), 1) if !d.is_empty() => d.to_string(),
                _ => sample_names
                    .get(&sample)
                    .cloned()
                    .unwrap_or_else(|| format!("band_{}", raster.bands().len() + 1)),
            };
            let array = Array2::from_shape_vec((height, width), data)?;
            raster.push_band(Band::new(name, array))?;
        }

        page += 1;
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    debug!(
        "Read {} bands from {} pages ({}x{}, {})",
        raster.bands().len(),
        page,
        width,
        height,
        raster.grid.crs
    );
    Ok(raster)
}

/// ASCII tag values may carry NUL terminators and padding
fn clean_ascii(value: &str) -> &str {
    value.trim_matches(|c: char| c == '\0' || c.is_whitespace())
}

/// Band descriptions from a GDAL_METADATA document, keyed by sample index:
/// `<Item name="DESCRIPTION" sample="0" role="description">NDVI</Item>`
fn band_descriptions(xml: &str) -> BTreeMap<usize, String> {
    let mut names = BTreeMap::new();
    for item in xml.split("<Item ").skip(1) {
        let Some((attributes, rest)) = item.split_once('>') else {
            continue;
        };
        if !attributes.contains(r#"role="description""#) {
            continue;
        }
        let sample = attributes
            .split_once(r#"sample=""#)
            .and_then(|(_, tail)| tail.split_once('"'))
            .and_then(|(index, _)| index.parse::<usize>().ok());
        let value = rest.split_once("</Item>").map(|(value, _)| unescape_xml(value.trim()));
        if let (Some(sample), Some(value)) = (sample, value) {
            if !value.is_empty() {
                names.insert(sample, value);
            }
        }
    }
    names
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn decoding_to_f32(result: DecodingResult) -> Result<Vec<f32>> {
    let values = match result {
        DecodingResult::U8(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::F32(buf) => buf,
        DecodingResult::F64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(PipelineError::InvalidConfig(
                "unsupported TIFF sample format".to_string(),
            ))
        }
    };
    Ok(values)
}

fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<[f64; 6]> {
    let scale = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE));
    let tiepoint = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT));
    match (scale, tiepoint) {
        (Ok(scale), Ok(tiepoint)) if scale.len() >= 2 && tiepoint.len() >= 6 => {
            // tiepoint: [I, J, K, X, Y, Z]
            let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
            let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
            Ok([origin_x, scale[0], 0.0, origin_y, 0.0, -scale[1]])
        }
        _ => Err(PipelineError::CrsError(
            "GeoTIFF lacks ModelPixelScale/ModelTiepoint tags".to_string(),
        )),
    }
}

fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<u32> {
    let keys = decoder.get_tag_u32_vec(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY)).ok()?;
    // Header of 4 shorts, then entries of (key, location, count, value)
    keys.get(4..)?
        .chunks_exact(4)
        .find(|entry| {
            (entry[0] == PROJECTED_CS_TYPE || entry[0] == GEOGRAPHIC_TYPE) && entry[1] == 0
        })
        .map(|entry| entry[3])
}

#[cfg(not(feature = "gdal"))]
fn geokeys(crs: &str) -> Vec<u16> {
    let code = match parse_epsg(crs) {
        Ok(code) if code <= u16::MAX as u32 => code as u16,
        _ => {
            warn!("CRS '{}' cannot be written as a GeoKey; writing georeferencing only", crs);
            return vec![1, 1, 0, 1, 1025, 0, 1, 1];
        }
    };
    let (model, key) = match linear_unit(crs) {
        LinearUnit::Degrees => (2u16, GEOGRAPHIC_TYPE as u16),
        _ => (1u16, PROJECTED_CS_TYPE as u16),
    };
    vec![
        1, 1, 0, 3, // Version 1.1.0, 3 keys
        GT_MODEL_TYPE as u16, 0, 1, model,
        1025, 0, 1, 1, // GTRasterTypeGeoKey = RasterPixelIsArea
        key, 0, 1, code,
    ]
}

/// Write a raster as a float32 GeoTIFF, one page per band
#[cfg(not(feature = "gdal"))]
pub fn write_geotiff(raster: &Raster, path: &Path) -> Result<()> {
    info!("Creating output raster: {}", path.display());
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    encode_geotiff(raster, &mut writer)?;
    writer.flush()?;
    info!("Successfully wrote {} bands to output", raster.bands().len());
    Ok(())
}

#[cfg(not(feature = "gdal"))]
fn encode_geotiff<W: Write + Seek>(raster: &Raster, writer: W) -> Result<()> {
    let mut encoder = TiffEncoder::new(writer)?;
    let grid = &raster.grid;
    let scale = [grid.pixel_width(), grid.pixel_height(), 0.0];
    let tiepoint = [0.0, 0.0, 0.0, grid.geotransform[0], grid.geotransform[3], 0.0];
    let keys = geokeys(&grid.crs);

    for band in raster.bands() {
        debug!("Writing band {}", band.name);
        let data: Vec<f32> = band.data.iter().copied().collect();
        let mut image = encoder.new_image::<Gray32Float>(grid.width as u32, grid.height as u32)?;
        image.encoder().write_tag(Tag::ImageDescription, band.name.as_str())?;
        image.encoder().write_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE), &scale[..])?;
        image.encoder().write_tag(Tag::from_u16_exhaustive(MODEL_TIEPOINT), &tiepoint[..])?;
        image.encoder().write_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY), &keys[..])?;
        image.encoder().write_tag(Tag::from_u16_exhaustive(GDAL_NODATA), "nan")?;
        image.write_data(&data)?;
    }
    Ok(())
}

/// Write a raster as a multiband float32 GeoTIFF through GDAL
#[cfg(feature = "gdal")]
pub fn write_geotiff(raster: &Raster, path: &Path) -> Result<()> {
    use gdal::spatial_ref::SpatialRef;
    use gdal::{DriverManager, Metadata};

    info!("Creating output raster: {}", path.display());
    let grid = &raster.grid;
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset =
        driver.create_with_band_type::<f32, _>(path, grid.width, grid.height, raster.bands().len())?;

    dataset.set_geo_transform(&grid.geotransform)?;
    let srs = SpatialRef::from_epsg(parse_epsg(&grid.crs)?)?;
    dataset.set_projection(&srs.to_wkt()?)?;

    for (i, band) in raster.bands().iter().enumerate() {
        let band_index = i + 1;
        debug!("Writing band {} ({})", band_index, band.name);
        let mut raster_band = dataset.rasterband(band_index)?;
        let values: Vec<f32> = band.data.iter().copied().collect();
        let mut buffer = gdal::raster::Buffer::new((grid.width, grid.height), values);
        raster_band.write((0, 0), (grid.width, grid.height), &mut buffer)?;
        raster_band.set_description(&band.name)?;
        raster_band.set_no_data_value(Some(f64::NAN))?;
    }

    info!("Successfully wrote {} bands to output", raster.bands().len());
    Ok(())
}
