// External converter process
// reason: tokio::process so a timed-out conversion kills its child on drop
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use mergeflow_core::domain::{InputFile, MergeParams, Table};
use mergeflow_core::port::{ConversionError, Converter};

/// Longest stderr excerpt carried in a `ProcessFailed` error
const STDERR_EXCERPT_BYTES: usize = 2048;

/// Runs `program args... <input paths...>` and parses a JSON `Table` from stdout.
///
/// The child sees only allowlisted environment variables from the daemon's
/// environment plus `MERGEFLOW_FORMAT`, and inherits nothing else.
pub struct SubprocessConverter {
    program: String,
    args: Vec<String>,
    formats: Vec<String>,
    env_allowlist: Vec<String>,
}

impl SubprocessConverter {
    /// # Arguments
    /// * `program` - Converter executable
    /// * `args` - Fixed arguments placed before the input paths
    /// * `formats` - Formats this converter accepts
    pub fn new(program: impl Into<String>, args: Vec<String>, formats: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            formats,
            env_allowlist: vec!["PATH".to_string(), "HOME".to_string()],
        }
    }

    pub fn with_env_allowlist(mut self, env_allowlist: Vec<String>) -> Self {
        self.env_allowlist = env_allowlist;
        self
    }

    fn filtered_env(&self) -> HashMap<String, String> {
        std::env::vars()
            .filter(|(k, _)| self.env_allowlist.contains(k))
            .collect()
    }
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_EXCERPT_BYTES {
        return trimmed.to_string();
    }
    let mut end = STDERR_EXCERPT_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[async_trait]
impl Converter for SubprocessConverter {
    async fn convert(
        &self,
        inputs: &[InputFile],
        params: &MergeParams,
    ) -> Result<Table, ConversionError> {
        if !self.supports_format(&params.format) {
            return Err(ConversionError::UnsupportedFormat(params.format.clone()));
        }

        info!(
            program = %self.program,
            format = %params.format,
            inputs = inputs.len(),
            "Starting external conversion"
        );

        let child = Command::new(&self.program)
            .args(&self.args)
            .args(inputs.iter().map(|f| f.path.as_str()))
            .env_clear()
            .envs(self.filtered_env())
            .env("MERGEFLOW_FORMAT", &params.format)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConversionError::SpawnFailed(format!("{}: {}", self.program, e)))?;

        // Dropping this future (convert timeout) drops the child and kills it
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ConversionError::SpawnFailed(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = excerpt(&output.stderr);
            warn!(
                program = %self.program,
                exit_code = ?output.status.code(),
                stderr = %stderr,
                "External conversion failed"
            );
            return Err(ConversionError::ProcessFailed {
                code: output.status.code(),
                stderr,
            });
        }

        let table: Table =
            serde_json::from_slice(&output.stdout).map_err(|e| ConversionError::Parse {
                path: self.program.clone(),
                message: format!("stdout is not a JSON table: {}", e),
            })?;
        table
            .validate()
            .map_err(|e| ConversionError::SchemaMismatch(e.to_string()))?;

        info!(program = %self.program, rows = table.len(), "External conversion completed");
        Ok(table)
    }

    fn supports_format(&self, format: &str) -> bool {
        self.formats.iter().any(|f| f == format)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn params(format: &str) -> MergeParams {
        MergeParams {
            format: format.to_string(),
            filter: None,
        }
    }

    fn sh(script: &str) -> SubprocessConverter {
        SubprocessConverter::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "converter".to_string()],
            vec!["h5ad".to_string()],
        )
    }

    #[tokio::test]
    async fn test_parses_table_from_stdout() {
        let converter = sh(
            r#"printf '{"row_label":"cell","columns":["CD4"],"rows":[{"name":"%s","values":[2.0]}]}' "$1""#,
        );
        let table = converter
            .convert(&[InputFile::new("c1")], &params("h5ad"))
            .await
            .unwrap();

        assert_eq!(table.columns, vec!["CD4"]);
        assert_eq!(table.rows[0].name, "c1");
    }

    #[tokio::test]
    async fn test_format_is_passed_in_env() {
        let converter = sh(
            r#"printf '{"row_label":"%s","columns":[],"rows":[]}' "$MERGEFLOW_FORMAT""#,
        );
        let table = converter.convert(&[], &params("h5ad")).await.unwrap();
        assert_eq!(table.row_label, "h5ad");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_process_failure() {
        let converter = sh("echo 'corrupt file' >&2; exit 3");
        let err = converter
            .convert(&[InputFile::new("x")], &params("h5ad"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ConversionError::ProcessFailed {
                code: Some(3),
                stderr: "corrupt file".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_garbage_stdout_and_spawn_failure() {
        let err = sh("echo nope")
            .convert(&[], &params("h5ad"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Parse { .. }));

        let missing = SubprocessConverter::new(
            "/nonexistent/converter",
            vec![],
            vec!["h5ad".to_string()],
        );
        let err = missing.convert(&[], &params("h5ad")).await.unwrap_err();
        assert!(matches!(err, ConversionError::SpawnFailed(_)));
    }

    #[test]
    fn test_stderr_excerpt_is_bounded() {
        let long = "x".repeat(STDERR_EXCERPT_BYTES * 2);
        assert_eq!(excerpt(long.as_bytes()).len(), STDERR_EXCERPT_BYTES + 3);
    }
}
