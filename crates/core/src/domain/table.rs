// Table - partial result produced by Convert and stored as one output chunk

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub name: String,
    pub values: Vec<f64>,
}

impl TableRow {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Named rows (e.g. cells) over named numeric columns (e.g. genes, qc metrics)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub row_label: String,
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl Table {
    pub fn new(row_label: impl Into<String>, columns: Vec<String>, rows: Vec<TableRow>) -> Self {
        Self {
            row_label: row_label.into(),
            columns,
            rows,
        }
    }

    pub fn empty(row_label: impl Into<String>, columns: Vec<String>) -> Self {
        Self::new(row_label, columns, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Every row must carry one value per column
    pub fn validate(&self) -> Result<()> {
        for row in &self.rows {
            if row.values.len() != self.columns.len() {
                return Err(DomainError::SchemaMismatch(format!(
                    "row '{}' has {} values, expected {}",
                    row.name,
                    row.values.len(),
                    self.columns.len()
                )));
            }
        }
        Ok(())
    }

    pub fn same_schema(&self, other: &Table) -> bool {
        self.row_label == other.row_label && self.columns == other.columns
    }

    /// Append rows of another table with an identical schema
    pub fn append(&mut self, other: Table) -> Result<()> {
        if !self.same_schema(&other) {
            return Err(DomainError::SchemaMismatch(format!(
                "cannot append table with {} columns to table with {} columns",
                other.columns.len(),
                self.columns.len()
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    pub fn retain_rows<F>(mut self, mut keep: F) -> Table
    where
        F: FnMut(&[f64]) -> bool,
    {
        self.rows.retain(|row| keep(&row.values));
        self
    }

    pub fn to_chunk_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_chunk_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols() -> Vec<String> {
        vec!["g1".into(), "g2".into()]
    }

    #[test]
    fn test_append_requires_same_schema() {
        let mut a = Table::new("cell", cols(), vec![TableRow::new("c1", vec![1.0, 2.0])]);
        let b = Table::new("cell", cols(), vec![TableRow::new("c2", vec![3.0, 4.0])]);
        a.append(b).unwrap();
        assert_eq!(a.len(), 2);

        let other = Table::empty("cell", vec!["g1".into()]);
        assert!(matches!(
            a.append(other),
            Err(DomainError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_validate_row_width() {
        let table = Table::new("cell", cols(), vec![TableRow::new("c1", vec![1.0])]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_chunk_bytes_preserve_columns_of_empty_table() {
        let table = Table::empty("cell", cols());
        let decoded = Table::from_chunk_bytes(&table.to_chunk_bytes().unwrap()).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.columns, cols());
    }
}
