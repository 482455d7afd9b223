// Output Store Port (Interface)
// Chunked artifact storage under a destination prefix

use crate::domain::{ChunkKey, OutputDestination, OutputManifest};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Write (or overwrite) one chunk. Writes to different keys are independent.
    async fn write_chunk(
        &self,
        destination: &OutputDestination,
        job_id: &str,
        chunk_key: &ChunkKey,
        bytes: Vec<u8>,
    ) -> Result<()>;

    async fn read_chunk(
        &self,
        destination: &OutputDestination,
        job_id: &str,
        chunk_key: &ChunkKey,
    ) -> Result<Option<Vec<u8>>>;

    /// Chunk keys present for a job, in unit order
    async fn list_chunks(
        &self,
        destination: &OutputDestination,
        job_id: &str,
    ) -> Result<Vec<ChunkKey>>;

    /// Write the consolidated manifest and mark the artifact complete
    async fn finalize(
        &self,
        destination: &OutputDestination,
        job_id: &str,
        manifest: &OutputManifest,
    ) -> Result<()>;

    async fn is_finalized(&self, destination: &OutputDestination, job_id: &str) -> Result<bool>;

    /// Any artifact (chunk or manifest) exists for the job
    async fn exists(&self, destination: &OutputDestination, job_id: &str) -> Result<bool>;
}

pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type ArtifactKey = (String, String);

    #[derive(Default)]
    struct Artifact {
        chunks: BTreeMap<ChunkKey, Vec<u8>>,
        manifest: Option<OutputManifest>,
    }

    /// Output store kept in memory; counts finalize calls for assertions
    #[derive(Default)]
    pub struct InMemoryOutputStore {
        artifacts: Mutex<HashMap<ArtifactKey, Artifact>>,
        finalize_calls: AtomicUsize,
        chunk_writes: AtomicUsize,
    }

    impl InMemoryOutputStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn finalize_calls(&self) -> usize {
            self.finalize_calls.load(Ordering::SeqCst)
        }

        pub fn chunk_writes(&self) -> usize {
            self.chunk_writes.load(Ordering::SeqCst)
        }

        pub fn manifest(&self, destination: &OutputDestination, job_id: &str) -> Option<OutputManifest> {
            self.lock()
                .get(&key(destination, job_id))
                .and_then(|a| a.manifest.clone())
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ArtifactKey, Artifact>> {
            self.artifacts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    fn key(destination: &OutputDestination, job_id: &str) -> ArtifactKey {
        (destination.as_str().to_string(), job_id.to_string())
    }

    #[async_trait]
    impl OutputStore for InMemoryOutputStore {
        async fn write_chunk(
            &self,
            destination: &OutputDestination,
            job_id: &str,
            chunk_key: &ChunkKey,
            bytes: Vec<u8>,
        ) -> Result<()> {
            self.chunk_writes.fetch_add(1, Ordering::SeqCst);
            self.lock()
                .entry(key(destination, job_id))
                .or_default()
                .chunks
                .insert(chunk_key.clone(), bytes);
            Ok(())
        }

        async fn read_chunk(
            &self,
            destination: &OutputDestination,
            job_id: &str,
            chunk_key: &ChunkKey,
        ) -> Result<Option<Vec<u8>>> {
            Ok(self
                .lock()
                .get(&key(destination, job_id))
                .and_then(|a| a.chunks.get(chunk_key).cloned()))
        }

        async fn list_chunks(
            &self,
            destination: &OutputDestination,
            job_id: &str,
        ) -> Result<Vec<ChunkKey>> {
            Ok(self
                .lock()
                .get(&key(destination, job_id))
                .map(|a| a.chunks.keys().cloned().collect())
                .unwrap_or_default())
        }

        async fn finalize(
            &self,
            destination: &OutputDestination,
            job_id: &str,
            manifest: &OutputManifest,
        ) -> Result<()> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            self.lock()
                .entry(key(destination, job_id))
                .or_default()
                .manifest = Some(manifest.clone());
            Ok(())
        }

        async fn is_finalized(&self, destination: &OutputDestination, job_id: &str) -> Result<bool> {
            Ok(self
                .lock()
                .get(&key(destination, job_id))
                .map_or(false, |a| a.manifest.is_some()))
        }

        async fn exists(&self, destination: &OutputDestination, job_id: &str) -> Result<bool> {
            Ok(self
                .lock()
                .get(&key(destination, job_id))
                .map_or(false, |a| a.manifest.is_some() || !a.chunks.is_empty()))
        }
    }
}
