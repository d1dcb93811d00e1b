// Library exports for embedding and testing

pub mod chunking;
pub mod cli;
pub mod config;
pub mod crs;
pub mod error;
pub mod export;
pub mod extract;
pub mod focal;
pub mod indices;
pub mod io;
pub mod mask;
pub mod period;
pub mod pipeline;
pub mod points;
pub mod raster;
pub mod reducer;
pub mod resample;
pub mod series;
pub mod source;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use export::{export_image, write_table, ImageExport, TableSelector};
pub use extract::{extract, extract_series, ExtractOptions, SampleRow};
pub use focal::{aggregate, aggregate_many, combine, KernelSpec};
pub use period::{generate_periods, Interval, Period, PeriodIter};
pub use pipeline::{Outputs, Plan};
pub use points::{load_points, Point};
pub use raster::{Band, BoundingBox, Grid, Raster};
pub use reducer::Reducer;
pub use series::{build_series, SeriesSpec};
pub use source::{Capture, CatalogSource, ImageSource, MemorySource, QualityFilter};
