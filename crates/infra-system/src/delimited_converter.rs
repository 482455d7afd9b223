// Built-in converter for delimited expression matrices (tsv/csv)
//
// Header row: row label, then column names. Each data row: row name, then
// one numeric value per column.

use async_trait::async_trait;
use csv_async::{AsyncReaderBuilder, StringRecord};
use mergeflow_core::domain::{InputFile, MergeParams, Table, TableRow};
use mergeflow_core::port::{ConversionError, Converter};
use tracing::debug;

type ConvertResult<T> = std::result::Result<T, ConversionError>;

#[derive(Debug, Default, Clone, Copy)]
pub struct DelimitedConverter;

impl DelimitedConverter {
    pub fn new() -> Self {
        Self
    }

    fn delimiter(format: &str) -> Option<u8> {
        match format {
            "tsv" => Some(b'\t'),
            "csv" => Some(b','),
            _ => None,
        }
    }

    async fn read_file(path: &str, delimiter: u8) -> ConvertResult<Table> {
        let parse_err = |message: String| ConversionError::Parse {
            path: path.to_string(),
            message,
        };

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ConversionError::Read {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        let mut reader = AsyncReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .create_reader(file);

        let header = reader
            .headers()
            .await
            .map_err(|e| parse_err(e.to_string()))?
            .clone();
        let mut fields = header.iter();
        let row_label = match fields.next() {
            Some(label) if !label.trim().is_empty() => label.trim().to_string(),
            _ => return Err(parse_err("missing header row".to_string())),
        };
        let columns: Vec<String> = fields.map(|c| c.trim().to_string()).collect();

        let mut rows = Vec::new();
        let mut record = StringRecord::new();
        let mut line = 1;
        while reader
            .read_record(&mut record)
            .await
            .map_err(|e| parse_err(e.to_string()))?
        {
            line += 1;
            rows.push(parse_row(&record, columns.len(), line).map_err(parse_err)?);
        }

        Ok(Table::new(row_label, columns, rows))
    }
}

fn parse_row(record: &StringRecord, width: usize, line: usize) -> Result<TableRow, String> {
    let mut fields = record.iter();
    let name = fields
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| format!("line {}: missing row name", line))?;

    let values = fields
        .map(|raw| {
            raw.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| format!("line {}: '{}' is not a finite number", line, raw))
        })
        .collect::<Result<Vec<f64>, String>>()?;

    if values.len() != width {
        return Err(format!(
            "line {}: expected {} values, found {}",
            line,
            width,
            values.len()
        ));
    }
    Ok(TableRow::new(name, values))
}

#[async_trait]
impl Converter for DelimitedConverter {
    async fn convert(&self, inputs: &[InputFile], params: &MergeParams) -> ConvertResult<Table> {
        let delimiter = Self::delimiter(&params.format)
            .ok_or_else(|| ConversionError::UnsupportedFormat(params.format.clone()))?;

        let mut merged: Option<Table> = None;
        for input in inputs {
            let table = Self::read_file(&input.path, delimiter).await?;
            debug!(path = %input.path, rows = table.len(), "Input file read");

            match merged.as_mut() {
                None => merged = Some(table),
                Some(acc) => acc.append(table).map_err(|_| {
                    ConversionError::SchemaMismatch(format!(
                        "{} does not share the columns of {}",
                        input.path, inputs[0].path
                    ))
                })?,
            }
        }

        merged.ok_or_else(|| ConversionError::SchemaMismatch("unit has no inputs".to_string()))
    }

    fn supports_format(&self, format: &str) -> bool {
        Self::delimiter(format).is_some()
    }
}
