//! In-memory string table with typed column accessors, read and written as CSV.

use std::collections::HashSet;
use std::path::Path;

use crate::error::MlError;

/// One labeled row as the model sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub features: Vec<f32>,
    /// Target divided by the configured target scale.
    pub target: f64,
}

/// Ordered columns plus rows of raw cell text.
///
/// Cells keep their original text so rows written back out are unchanged
/// apart from added columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table, checking every row has one cell per column.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, MlError> {
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != columns.len())
        {
            return Err(MlError::dataset(format!(
                "row {i} has {} cells, expected {}",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn read_csv(path: &Path) -> Result<Self, MlError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| MlError::dataset(format!("Failed to open {}: {e}", path.display())))?;
        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        tracing::debug!(path = %path.display(), rows = rows.len(), "Loaded CSV");
        Self::from_rows(columns, rows)
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), MlError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn column_index(&self, name: &str) -> Result<usize, MlError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| MlError::dataset(format!("column '{name}' not found")))
    }

    pub fn column(&self, name: &str) -> Result<Vec<&str>, MlError> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    pub fn f64_column(&self, name: &str) -> Result<Vec<f64>, MlError> {
        let idx = self.column_index(name)?;
        self.rows
            .iter()
            .enumerate()
            .map(|(i, r)| parse_cell::<f64>(&r[idx], name, i))
            .collect()
    }

    pub fn usize_column(&self, name: &str) -> Result<Vec<usize>, MlError> {
        let idx = self.column_index(name)?;
        self.rows
            .iter()
            .enumerate()
            .map(|(i, r)| parse_cell::<usize>(&r[idx], name, i))
            .collect()
    }

    /// Add `name`, or overwrite it when it already exists.
    pub fn set_column(&mut self, name: &str, values: Vec<String>) -> Result<(), MlError> {
        if values.len() != self.rows.len() {
            return Err(MlError::invalid_input(format!(
                "column '{name}' has {} values for {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        match self.columns.iter().position(|c| c == name) {
            Some(idx) => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
        Ok(())
    }

    pub fn set_f64_column(&mut self, name: &str, values: &[f64]) -> Result<(), MlError> {
        self.set_column(name, values.iter().map(|v| v.to_string()).collect())
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    /// Concatenate tables that share the same columns.
    pub fn concat(tables: &[Table]) -> Result<Table, MlError> {
        let Some(first) = tables.first() else {
            return Ok(Table::default());
        };
        let mut out = Table::new(first.columns.clone());
        for t in tables {
            if t.columns != first.columns {
                return Err(MlError::invalid_input(
                    "cannot concatenate tables with different columns",
                ));
            }
            out.rows.extend(t.rows.iter().cloned());
        }
        Ok(out)
    }

    /// Identifier values, failing on duplicates.
    pub fn unique_ids(&self, id_column: &str) -> Result<Vec<String>, MlError> {
        let ids = self.column(id_column)?;
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(*id) {
                return Err(MlError::dataset(format!("duplicate {id_column} '{id}'")));
            }
        }
        Ok(ids.into_iter().map(str::to_string).collect())
    }

    /// Feature vectors for the given columns, one per row.
    pub fn features(&self, feature_columns: &[String]) -> Result<Vec<Vec<f32>>, MlError> {
        let indices = feature_columns
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>, _>>()?;
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                indices
                    .iter()
                    .zip(feature_columns)
                    .map(|(&idx, name)| parse_cell::<f32>(&row[idx], name, i))
                    .collect()
            })
            .collect()
    }

    /// Labeled samples with targets divided by `target_scale`.
    pub fn samples(
        &self,
        feature_columns: &[String],
        target_column: &str,
        target_scale: f64,
    ) -> Result<Vec<Sample>, MlError> {
        if target_scale == 0.0 || !target_scale.is_finite() {
            return Err(MlError::invalid_input(format!(
                "target_scale must be finite and non-zero, got {target_scale}"
            )));
        }
        let features = self.features(feature_columns)?;
        let targets = self.f64_column(target_column)?;
        Ok(features
            .into_iter()
            .zip(targets)
            .map(|(features, t)| Sample {
                features,
                target: t / target_scale,
            })
            .collect())
    }
}

fn parse_cell<T: std::str::FromStr>(cell: &str, column: &str, row: usize) -> Result<T, MlError> {
    cell.trim().parse::<T>().map_err(|_| {
        MlError::dataset(format!(
            "cannot parse '{cell}' in column '{column}' at row {row}"
        ))
    })
}
