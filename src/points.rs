use crate::error::{PipelineError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;

/// Survey location. Coordinates are in the pipeline CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub attributes: BTreeMap<String, String>,
}

impl Point {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            attributes: BTreeMap::new(),
        }
    }
}

/// Column names of the point table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointColumns {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_x")]
    pub x: String,
    #[serde(default = "default_y")]
    pub y: String,
}

fn default_id() -> String {
    "location".to_string()
}

fn default_x() -> String {
    "x".to_string()
}

fn default_y() -> String {
    "y".to_string()
}

impl Default for PointColumns {
    fn default() -> Self {
        Self {
            id: default_id(),
            x: default_x(),
            y: default_y(),
        }
    }
}

/// Load points from a CSV file; columns other than id/x/y become attributes
pub fn load_points(path: &Path, columns: &PointColumns) -> Result<Vec<Point>> {
    info!("Reading points: {}", path.display());
    let reader = csv::Reader::from_path(path)?;
    let points = parse_points(reader, columns)?;
    info!("Loaded {} points", points.len());
    Ok(points)
}

pub fn parse_points<R: Read>(mut reader: csv::Reader<R>, columns: &PointColumns) -> Result<Vec<Point>> {
    let headers = reader.headers()?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PipelineError::InvalidPoints(format!("missing column '{}'", name)))
    };
    let (id_col, x_col, y_col) = (position(&columns.id)?, position(&columns.x)?, position(&columns.y)?);

    let mut seen = HashSet::new();
    let mut points = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").trim();
        let coordinate = |i: usize| {
            field(i).parse::<f64>().map_err(|_| {
                PipelineError::InvalidPoints(format!(
                    "row {}: '{}' is not a coordinate",
                    line + 1,
                    field(i)
                ))
            })
        };

        let id = field(id_col).to_string();
        if id.is_empty() {
            return Err(PipelineError::InvalidPoints(format!("row {}: empty id", line + 1)));
        }
        if !seen.insert(id.clone()) {
            return Err(PipelineError::InvalidPoints(format!("duplicate id '{}'", id)));
        }

        let attributes = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| ![id_col, x_col, y_col].contains(i))
            .map(|(i, name)| (name.to_string(), field(i).to_string()))
            .collect();

        points.push(Point {
            id,
            x: coordinate(x_col)?,
            y: coordinate(y_col)?,
            attributes,
        });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Vec<Point>> {
        parse_points(csv::Reader::from_reader(text.as_bytes()), &PointColumns::default())
    }

    #[test]
    fn test_parse_points_with_attributes() {
        let points = parse("location,x,y,piwo_count\nA-1,100.5,200,3\nA-2,110,210,0\n").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].id, "A-1");
        assert_eq!(points[0].x, 100.5);
        assert_eq!(points[1].attributes.get("piwo_count").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = parse("location,x,y\nA,1,2\nA,3,4\n");
        assert!(matches!(result, Err(PipelineError::InvalidPoints(_))));
    }

    #[test]
    fn test_missing_column() {
        let result = parse("site,x,y\nA,1,2\n");
        assert!(matches!(result, Err(PipelineError::InvalidPoints(_))));
    }

    #[test]
    fn test_bad_coordinate() {
        let result = parse("location,x,y\nA,east,2\n");
        assert!(matches!(result, Err(PipelineError::InvalidPoints(_))));
    }
}
