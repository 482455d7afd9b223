// Filesystem Output Store
// Layout: {root}/{destination}/{job_id}/chunks/{chunk_key}.json
//         {root}/{destination}/{job_id}/manifest.json
//         {root}/{destination}/{job_id}/_SUCCESS

use async_trait::async_trait;
use mergeflow_core::domain::{ChunkKey, OutputDestination, OutputManifest};
use mergeflow_core::error::{AppError, Result};
use mergeflow_core::port::OutputStore;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CHUNKS_DIR: &str = "chunks";
const CHUNK_EXT: &str = "json";
const MANIFEST_FILE: &str = "manifest.json";
const SUCCESS_MARKER: &str = "_SUCCESS";

pub struct FsOutputStore {
    root: PathBuf,
}

impl FsOutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, destination: &OutputDestination, job_id: &str) -> Result<PathBuf> {
        destination
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id.starts_with('.') {
            return Err(AppError::Validation(format!(
                "job id is not a valid path segment: {}",
                job_id
            )));
        }
        Ok(self.root.join(destination.as_str()).join(job_id))
    }

    fn chunk_path(&self, dir: &Path, chunk_key: &ChunkKey) -> PathBuf {
        dir.join(CHUNKS_DIR)
            .join(format!("{}.{}", chunk_key.as_str(), CHUNK_EXT))
    }
}

/// Write through a temp file and rename, so readers never see a partial chunk
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::Internal(format!("invalid output path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl OutputStore for FsOutputStore {
    async fn write_chunk(
        &self,
        destination: &OutputDestination,
        job_id: &str,
        chunk_key: &ChunkKey,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let dir = self.job_dir(destination, job_id)?;
        let path = self.chunk_path(&dir, chunk_key);
        write_atomic(&path, &bytes).await?;

        debug!(
            job_id = job_id,
            chunk_key = %chunk_key,
            bytes = bytes.len(),
            "Chunk written"
        );
        Ok(())
    }

    async fn read_chunk(
        &self,
        destination: &OutputDestination,
        job_id: &str,
        chunk_key: &ChunkKey,
    ) -> Result<Option<Vec<u8>>> {
        let dir = self.job_dir(destination, job_id)?;
        match tokio::fs::read(self.chunk_path(&dir, chunk_key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_chunks(
        &self,
        destination: &OutputDestination,
        job_id: &str,
    ) -> Result<Vec<ChunkKey>> {
        let dir = self.job_dir(destination, job_id)?.join(CHUNKS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXT) {
                continue;
            }
            // Temp files start with '.' and fail to parse
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| ChunkKey::parse(s).ok())
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn finalize(
        &self,
        destination: &OutputDestination,
        job_id: &str,
        manifest: &OutputManifest,
    ) -> Result<()> {
        let dir = self.job_dir(destination, job_id)?;
        let bytes = serde_json::to_vec_pretty(manifest)?;

        // Manifest first; the marker is what readers and is_finalized trust
        write_atomic(&dir.join(MANIFEST_FILE), &bytes).await?;
        write_atomic(&dir.join(SUCCESS_MARKER), b"").await?;

        info!(
            job_id = job_id,
            destination = %destination,
            chunks = manifest.chunks.len(),
            total_rows = manifest.total_rows,
            "Output finalized"
        );
        Ok(())
    }

    async fn is_finalized(&self, destination: &OutputDestination, job_id: &str) -> Result<bool> {
        let dir = self.job_dir(destination, job_id)?;
        Ok(tokio::fs::try_exists(dir.join(SUCCESS_MARKER)).await?)
    }

    async fn exists(&self, destination: &OutputDestination, job_id: &str) -> Result<bool> {
        if tokio::fs::try_exists(self.job_dir(destination, job_id)?.join(MANIFEST_FILE)).await? {
            return Ok(true);
        }
        Ok(!self.list_chunks(destination, job_id).await?.is_empty())
    }
}
