//! Numeric matrix validation
//!
//! Turns untyped nested payloads into a rectangular matrix of finite `f64`
//! values. Empty, ragged and non-numeric input is rejected with the position
//! of the first offending element.

use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Longest accepted model identifier
pub const MAX_MODEL_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("input data cannot be empty")]
    Empty,

    #[error("input data must be a list of lists (2D array)")]
    NotAnArray,

    #[error("row {row} is not a list")]
    RowNotArray { row: usize },

    #[error("row {row} has no features")]
    EmptyRow { row: usize },

    #[error("ragged input: row {row} has {got} features, expected {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("element [{row}][{col}] is not a number")]
    NonNumeric { row: usize, col: usize },

    #[error("element [{row}][{col}] is not finite")]
    NonFinite { row: usize, col: usize },

    #[error("feature width mismatch: model expects {expected} features, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid model id '{0}'")]
    InvalidModelId(String),
}

/// Rectangular matrix of finite values, stored row-major
#[derive(Debug, Clone, PartialEq)]
pub struct NumericMatrix {
    values: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl NumericMatrix {
    /// Validate an arbitrary JSON structure
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let outer = value.as_array().ok_or(ValidationError::NotAnArray)?;
        if outer.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut values = Vec::new();
        let mut cols = 0;

        for (row, item) in outer.iter().enumerate() {
            let inner = item
                .as_array()
                .ok_or(ValidationError::RowNotArray { row })?;
            Self::check_width(row, inner.len(), &mut cols)?;

            for (col, element) in inner.iter().enumerate() {
                // Booleans and numeric strings are not coerced
                let v = match element {
                    Value::Number(n) => n.as_f64().ok_or(ValidationError::NonNumeric { row, col })?,
                    _ => return Err(ValidationError::NonNumeric { row, col }),
                };
                if !v.is_finite() {
                    return Err(ValidationError::NonFinite { row, col });
                }
                values.push(v);
            }
        }

        Ok(Self {
            values,
            rows: outer.len(),
            cols,
        })
    }

    /// Validate already-typed rows
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ValidationError> {
        if rows.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut values = Vec::with_capacity(rows.len() * rows[0].len());
        let mut cols = 0;

        for (row, inner) in rows.iter().enumerate() {
            Self::check_width(row, inner.len(), &mut cols)?;
            for (col, &v) in inner.iter().enumerate() {
                if !v.is_finite() {
                    return Err(ValidationError::NonFinite { row, col });
                }
                values.push(v);
            }
        }

        Ok(Self {
            values,
            rows: rows.len(),
            cols,
        })
    }

    fn check_width(row: usize, len: usize, cols: &mut usize) -> Result<(), ValidationError> {
        if row == 0 {
            if len == 0 {
                return Err(ValidationError::EmptyRow { row });
            }
            *cols = len;
        } else if len != *cols {
            return Err(ValidationError::Ragged {
                row,
                expected: *cols,
                got: len,
            });
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        &self.values[idx * self.cols..(idx + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.cols)
    }

    /// Require a specific feature width
    pub fn expect_cols(&self, expected: usize) -> Result<(), ValidationError> {
        if self.cols != expected {
            return Err(ValidationError::DimensionMismatch {
                expected,
                got: self.cols,
            });
        }
        Ok(())
    }
}

impl Serialize for NumericMatrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter_rows())
    }
}

/// Model ids name artifact files, so they are restricted to a safe alphabet
pub fn validate_model_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_MODEL_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidModelId(id.to_string()))
    }
}
