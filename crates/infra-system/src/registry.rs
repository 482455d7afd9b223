// Per-format converter dispatch

use crate::{DelimitedConverter, SubprocessConverter};
use async_trait::async_trait;
use mergeflow_core::domain::{InputFile, MergeParams, Table};
use mergeflow_core::port::{ConversionError, Converter};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Routes each conversion to the converter registered for `params.format`
#[derive(Default)]
pub struct ConverterRegistry {
    converters: BTreeMap<String, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `tsv` and `csv` readers
    pub fn with_builtin() -> Self {
        let delimited: Arc<dyn Converter> = Arc::new(DelimitedConverter::new());
        Self::new()
            .register("tsv", delimited.clone())
            .register("csv", delimited)
    }

    /// Register (or replace) the converter for a format
    pub fn register(mut self, format: impl Into<String>, converter: Arc<dyn Converter>) -> Self {
        self.converters.insert(format.into(), converter);
        self
    }

    /// Register one external converter for all the formats it declares
    pub fn register_subprocess(self, formats: &[String], converter: SubprocessConverter) -> Self {
        let converter: Arc<dyn Converter> = Arc::new(converter);
        formats
            .iter()
            .fold(self, |registry, format| registry.register(format.clone(), converter.clone()))
    }

    pub fn formats(&self) -> Vec<&str> {
        self.converters.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl Converter for ConverterRegistry {
    async fn convert(
        &self,
        inputs: &[InputFile],
        params: &MergeParams,
    ) -> Result<Table, ConversionError> {
        let converter = self
            .converters
            .get(&params.format)
            .ok_or_else(|| ConversionError::UnsupportedFormat(params.format.clone()))?;
        converter.convert(inputs, params).await
    }

    fn supports_format(&self, format: &str) -> bool {
        self.converters.contains_key(format)
    }
}
