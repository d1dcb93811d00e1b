//! Date-window generation for periodic composites.
//!
//! Period starts are computed as `start + k * interval` from the original
//! start date, so month-end clamping never accumulates across periods.

use crate::error::{PipelineError, Result};
use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Days,
    Weeks,
    Months,
    Years,
}

/// Interval length as a count of calendar units (e.g. 4 months)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub count: u32,
    pub unit: IntervalUnit,
}

impl Interval {
    pub fn new(count: u32, unit: IntervalUnit) -> Self {
        Self { count, unit }
    }

    pub fn months(count: u32) -> Self {
        Self::new(count, IntervalUnit::Months)
    }

    pub fn years(count: u32) -> Self {
        Self::new(count, IntervalUnit::Years)
    }

    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(PipelineError::InvalidInterval(self.to_string()));
        }
        Ok(())
    }

    /// Advance `date` by `steps` whole intervals
    pub fn advance(&self, date: NaiveDate, steps: u32) -> Option<NaiveDate> {
        let n = self.count.checked_mul(steps)?;
        match self.unit {
            IntervalUnit::Days => date.checked_add_days(Days::new(n as u64)),
            IntervalUnit::Weeks => date.checked_add_days(Days::new(n as u64 * 7)),
            IntervalUnit::Months => date.checked_add_months(Months::new(n)),
            IntervalUnit::Years => date.checked_add_months(Months::new(n.checked_mul(12)?)),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            IntervalUnit::Days => "days",
            IntervalUnit::Weeks => "weeks",
            IntervalUnit::Months => "months",
            IntervalUnit::Years => "years",
        };
        write!(f, "{} {}", self.count, unit)
    }
}

/// Half-open date range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: NaiveDateTime) -> bool {
        timestamp >= self.start.and_time(NaiveTime::MIN)
            && timestamp < self.end.and_time(NaiveTime::MIN)
    }
}

/// One compositing window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub index: usize,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub interval: Interval,
}

impl Period {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start, self.end)
    }

    pub fn year(&self) -> i32 {
        self.start.year()
    }

    pub fn month(&self) -> u32 {
        self.start.month()
    }

    /// `YYYY-MM-DD` of the period start, used as the join key in tables
    pub fn label(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }
}

/// Restartable iterator over period windows. Clone it to iterate again.
#[derive(Debug, Clone)]
pub struct PeriodIter {
    start: NaiveDate,
    end: NaiveDate,
    interval: Interval,
    next_index: u32,
    done: bool,
}

impl PeriodIter {
    pub fn new(start: NaiveDate, end: NaiveDate, interval: Interval) -> Result<Self> {
        if end < start {
            return Err(PipelineError::InvalidDateRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        interval.validate()?;
        Ok(Self {
            start,
            end,
            interval,
            next_index: 0,
            done: false,
        })
    }
}

impl Iterator for PeriodIter {
    type Item = Period;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let k = self.next_index;
        let period_start = self.interval.advance(self.start, k)?;
        // The first window reaching `end` is the last one
        if period_start >= self.end {
            self.done = true;
        }
        let period_end = self.interval.advance(self.start, k.checked_add(1)?)?;
        self.next_index += 1;
        Some(Period {
            index: k as usize,
            start: period_start,
            end: period_end,
            interval: self.interval,
        })
    }
}

/// Build every period from `start` up to and including the first window that
/// reaches `end`, so a span of `n` intervals (rounded up) yields `n + 1` periods
pub fn generate_periods(start: NaiveDate, end: NaiveDate, interval: Interval) -> Result<Vec<Period>> {
    let periods: Vec<Period> = PeriodIter::new(start, end, interval)?.collect();
    debug!(
        "Generated {} periods from {} to {} every {}",
        periods.len(),
        start,
        end,
        interval
    );
    Ok(periods)
}
