use serde::{Deserialize, Serialize};

/// Statistic applied across a set of values: pixels in a window, captures in
/// a period, or cells inside a point buffer. Masked (`NaN`) values never
/// reach a reducer; an empty input reduces to `NaN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    First,
    #[default]
    Mean,
    Median,
    Min,
    Max,
    Sum,
    #[serde(rename = "stddev")]
    StdDev,
}

impl Reducer {
    pub fn name(&self) -> &'static str {
        match self {
            Reducer::First => "first",
            Reducer::Mean => "mean",
            Reducer::Median => "median",
            Reducer::Min => "min",
            Reducer::Max => "max",
            Reducer::Sum => "sum",
            Reducer::StdDev => "stddev",
        }
    }

    /// Reduce the valid values in `values`. May reorder the slice.
    pub fn reduce(&self, values: &mut [f32]) -> f32 {
        if values.is_empty() {
            return f32::NAN;
        }
        match self {
            Reducer::First => values[0],
            Reducer::Mean => (sum(values) / values.len() as f64) as f32,
            Reducer::Median => {
                values.sort_unstable_by(|a, b| a.total_cmp(b));
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    ((values[mid - 1] as f64 + values[mid] as f64) / 2.0) as f32
                } else {
                    values[mid]
                }
            }
            Reducer::Min => values.iter().copied().fold(f32::INFINITY, f32::min),
            Reducer::Max => values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            Reducer::Sum => sum(values) as f32,
            Reducer::StdDev => {
                let n = values.len() as f64;
                let mean = sum(values) / n;
                let var = values
                    .iter()
                    .map(|&v| (v as f64 - mean).powi(2))
                    .sum::<f64>()
                    / n;
                var.sqrt() as f32
            }
        }
    }
}

fn sum(values: &[f32]) -> f64 {
    values.iter().map(|&v| v as f64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(Reducer::Median.reduce(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(Reducer::Median.reduce(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn test_basic_statistics() {
        let values = [2.0f32, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(Reducer::Mean.reduce(&mut values.clone()), 5.0);
        assert_eq!(Reducer::Min.reduce(&mut values.clone()), 2.0);
        assert_eq!(Reducer::Max.reduce(&mut values.clone()), 9.0);
        assert_eq!(Reducer::Sum.reduce(&mut values.clone()), 40.0);
        assert_eq!(Reducer::StdDev.reduce(&mut values.clone()), 2.0);
        assert_eq!(Reducer::First.reduce(&mut values.clone()), 2.0);
    }

    #[test]
    fn test_empty_is_nan() {
        assert!(Reducer::Mean.reduce(&mut []).is_nan());
        assert!(Reducer::Median.reduce(&mut []).is_nan());
    }

    #[test]
    fn test_parse_names() {
        let r: Reducer = serde_json::from_str("\"median\"").unwrap();
        assert_eq!(r, Reducer::Median);
        let r: Reducer = serde_json::from_str("\"stddev\"").unwrap();
        assert_eq!(r, Reducer::StdDev);
    }
}
