use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid date range: end {end} precedes start {start}")]
    InvalidDateRange { start: String, end: String },

    #[error("Invalid interval: {0} (count must be positive)")]
    InvalidInterval(String),

    #[error("Invalid radius: {0} (must be positive)")]
    InvalidRadius(f64),

    #[error("Invalid scale: {0} (must be positive)")]
    InvalidScale(f64),

    #[error("Raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("Pixel size is non-positive: {0}")]
    InvalidPixelSize(f64),

    #[error("Invalid chunk size: {0} (must be positive)")]
    InvalidChunkSize(usize),

    #[error("Duplicate band name: {0}")]
    DuplicateBand(String),

    #[error("Band not found: {0}")]
    MissingBand(String),

    #[error("Band {name} has shape {actual:?}, grid expects {expected:?}")]
    BandShape {
        name: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("CRS mismatch: expected {expected}, found {found}")]
    CrsMismatch { expected: String, found: String },

    #[error("CRS error: {0}")]
    CrsError(String),

    #[error("Unknown column in selector list: {0}")]
    UnknownColumn(String),

    #[error("Unknown series or layer: {0}")]
    UnknownSource(String),

    #[error("Invalid point table: {0}")]
    InvalidPoints(String),

    #[error("Export of {pixels} pixels exceeds max_pixels {max_pixels}; raise max_pixels or coarsen the scale")]
    TooManyPixels { pixels: u64, max_pixels: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
