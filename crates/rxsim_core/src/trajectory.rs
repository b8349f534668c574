use crate::compiler::DelayValueProvider;
use serde::{Deserialize, Serialize};

/// Time samples of named columns, stored row by row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    identifiers: Vec<String>,
    times: Vec<f64>,
    rows: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn new(identifiers: Vec<String>) -> Self {
        Self {
            identifiers,
            times: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Appends a sample. A sample at the time of the last row replaces it.
    pub fn push(&mut self, time: f64, row: Vec<f64>) {
        debug_assert_eq!(row.len(), self.identifiers.len());
        if self.times.last() == Some(&time) {
            if let Some(last) = self.rows.last_mut() {
                *last = row;
            }
            return;
        }
        self.times.push(time);
        self.rows.push(row);
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn last_row(&self) -> Option<&[f64]> {
        self.rows.last().map(Vec::as_slice)
    }

    pub fn column_index(&self, identifier: &str) -> Option<usize> {
        self.identifiers.iter().position(|id| id == identifier)
    }

    /// Piecewise-linear interpolation of column `c`, held constant outside the
    /// sampled range.
    pub fn interpolate(&self, time: f64, c: usize) -> Option<f64> {
        let first = *self.times.first()?;
        let last = *self.times.last()?;
        if time <= first {
            return self.rows.first().map(|r| r[c]);
        }
        if time >= last {
            return self.rows.last().map(|r| r[c]);
        }
        let upper = self.times.partition_point(|t| *t <= time);
        let (t0, t1) = (self.times[upper - 1], self.times[upper]);
        let (y0, y1) = (self.rows[upper - 1][c], self.rows[upper][c]);
        if t1 == t0 {
            return Some(y1);
        }
        Some(y0 + (y1 - y0) * (time - t0) / (t1 - t0))
    }
}

impl DelayValueProvider for Trajectory {
    fn value_at(&self, time: f64, identifier: &str) -> f64 {
        self.column_index(identifier)
            .and_then(|c| self.interpolate(time, c))
            .unwrap_or(0.0)
    }
}
