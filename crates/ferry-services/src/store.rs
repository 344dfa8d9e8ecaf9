//! Manifest store — creates, loads, and persists per-file transfer manifests.
//!
//! One JSON document per manifest at `<manifest_dir>/<file_id>.json`. Every
//! save writes to a temp file in the same directory, syncs, and renames over
//! the target, so a partially written manifest is never observable. A
//! manifest is owned by at most one transfer task at a time; the cache's
//! per-entry guard is the per-file lock.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use ferry_core::digest::chunk_digest_hex;
use ferry_core::manifest::{Chunk, ChunkStatus, FileManifest, Priority, TransferProgress};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("manifest not found: {0}")]
    NotFound(String),

    #[error("chunk {chunk_id} not found in manifest {file_id}")]
    ChunkNotFound { file_id: String, chunk_id: u32 },

    #[error("corrupt manifest at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StoreError {
        let path = path.into();
        move |source| StoreError::Io { path, source }
    }
}

pub struct ManifestStore {
    dir: PathBuf,
    manifests: DashMap<String, FileManifest>,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;
        Ok(Self {
            dir,
            manifests: DashMap::new(),
        })
    }

    /// Register a file: read it once, computing the whole-file SHA-256 and
    /// every chunk's xxh64 in a single pass, then persist the chunk plan.
    pub fn create(
        &self,
        file_id: &str,
        path: &Path,
        file_size: u64,
        chunk_size: u32,
        priority: Priority,
    ) -> Result<FileManifest, StoreError> {
        use std::io::Read;

        let mut file = std::fs::File::open(path).map_err(StoreError::io(path))?;
        let mut file_hasher = Sha256::new();
        let mut chunk_hashes = Vec::new();
        let mut buf = vec![0u8; chunk_size as usize];
        loop {
            let mut filled = 0;
            // A chunk may arrive in several short reads.
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).map_err(StoreError::io(path))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            file_hasher.update(&buf[..filled]);
            chunk_hashes.push(chunk_digest_hex(&buf[..filled]));
            if filled < buf.len() {
                break;
            }
        }

        let manifest = FileManifest::plan(
            file_id,
            path,
            file_size,
            hex::encode(file_hasher.finalize()),
            chunk_hashes,
            chunk_size,
            priority,
        );
        self.save(&manifest)?;
        self.manifests.insert(file_id.to_string(), manifest.clone());
        tracing::info!(
            file_id,
            file_size,
            chunks = manifest.total_chunks,
            "manifest created"
        );
        Ok(manifest)
    }

    /// Load a manifest, from cache or disk. A missing file is NotFound; an
    /// unparseable file is Corrupt.
    pub fn load(&self, file_id: &str) -> Result<FileManifest, StoreError> {
        self.ensure_loaded(file_id)?;
        self.manifests
            .get(file_id)
            .map(|m| m.clone())
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))
    }

    fn ensure_loaded(&self, file_id: &str) -> Result<(), StoreError> {
        if self.manifests.contains_key(file_id) {
            return Ok(());
        }
        let path = self.manifest_path(file_id);
        if !path.exists() {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        let text = std::fs::read_to_string(&path).map_err(StoreError::io(&path))?;
        let manifest: FileManifest =
            serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?;
        self.manifests.insert(file_id.to_string(), manifest);
        Ok(())
    }

    /// Apply a mutation under the per-file lock and persist the result.
    fn mutate<R>(
        &self,
        file_id: &str,
        f: impl FnOnce(&mut FileManifest) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.ensure_loaded(file_id)?;
        let mut entry = self
            .manifests
            .get_mut(file_id)
            .ok_or_else(|| StoreError::NotFound(file_id.to_string()))?;
        let out = f(entry.value_mut())?;
        self.save(entry.value_mut())?;
        Ok(out)
    }

    /// Transition one chunk's status. IN_FLIGHT stamps `sent_at` and the
    /// assigned link (and resets the retry counter when resurrecting a
    /// FAILED chunk); ACKED stamps `acked_at` and accumulates
    /// `bytes_acked`; FAILED increments `retry_count`.
    ///
    /// Returns whether the chunk's status actually changed — an ACK for an
    /// already-acked chunk is a no-op and returns false, which is what lets
    /// callers count acks exactly once.
    pub fn update_chunk_status(
        &self,
        file_id: &str,
        chunk_id: u32,
        status: ChunkStatus,
        assigned_link: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.mutate(file_id, |manifest| {
            let chunk = manifest
                .chunks
                .get_mut(&chunk_id)
                .ok_or_else(|| StoreError::ChunkNotFound {
                    file_id: file_id.to_string(),
                    chunk_id,
                })?;

            let previous = chunk.status;
            match status {
                ChunkStatus::InFlight => {
                    if previous == ChunkStatus::Failed {
                        // Resurrected failed chunk gets a fresh attempt counter.
                        chunk.retry_count = 0;
                    }
                    chunk.status = ChunkStatus::InFlight;
                    chunk.sent_at = Some(Utc::now());
                    chunk.assigned_link = assigned_link.map(str::to_owned);
                }
                ChunkStatus::Acked => {
                    if previous == ChunkStatus::Acked {
                        return Ok(false);
                    }
                    chunk.status = ChunkStatus::Acked;
                    chunk.acked_at = Some(Utc::now());
                    manifest.bytes_acked += chunk.size as u64;
                }
                ChunkStatus::Failed => {
                    chunk.status = ChunkStatus::Failed;
                    chunk.retry_count += 1;
                }
                ChunkStatus::Pending => {
                    chunk.status = ChunkStatus::Pending;
                    chunk.sent_at = None;
                }
            }
            Ok(previous != status)
        })
    }

    /// Timeout-path retry accounting. Returns the new retry count.
    pub fn bump_retry(&self, file_id: &str, chunk_id: u32) -> Result<u32, StoreError> {
        self.mutate(file_id, |manifest| {
            let chunk = manifest
                .chunks
                .get_mut(&chunk_id)
                .ok_or_else(|| StoreError::ChunkNotFound {
                    file_id: file_id.to_string(),
                    chunk_id,
                })?;
            chunk.retry_count += 1;
            Ok(chunk.retry_count)
        })
    }

    /// Chunks awaiting (re)send: PENDING and FAILED, FAILED first.
    pub fn get_pending(
        &self,
        file_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Chunk>, StoreError> {
        Ok(self.load(file_id)?.pending_chunks(limit))
    }

    pub fn get_in_flight(&self, file_id: &str) -> Result<Vec<Chunk>, StoreError> {
        Ok(self.load(file_id)?.in_flight_chunks())
    }

    pub fn is_complete(&self, file_id: &str) -> Result<bool, StoreError> {
        Ok(self.load(file_id)?.is_complete())
    }

    pub fn get_progress(&self, file_id: &str) -> Result<TransferProgress, StoreError> {
        Ok(self.load(file_id)?.progress())
    }

    /// Stamp `completed_at` once every chunk is acked.
    pub fn mark_completed(&self, file_id: &str) -> Result<(), StoreError> {
        self.mutate(file_id, |manifest| {
            if manifest.completed_at.is_none() {
                manifest.completed_at = Some(Utc::now());
            }
            Ok(())
        })
    }

    pub fn set_priority(&self, file_id: &str, priority: Priority) -> Result<(), StoreError> {
        self.mutate(file_id, |manifest| {
            manifest.priority = priority;
            Ok(())
        })
    }

    /// Demote stale IN_FLIGHT chunks to PENDING. Called when a transfer
    /// (re)starts: chunks that were on the wire when the process died were
    /// never acked, so they must be sent again. Returns how many were reset.
    pub fn reset_in_flight(&self, file_id: &str) -> Result<usize, StoreError> {
        self.mutate(file_id, |manifest| {
            let mut reset = 0;
            for chunk in manifest.chunks.values_mut() {
                if chunk.status == ChunkStatus::InFlight {
                    chunk.status = ChunkStatus::Pending;
                    chunk.sent_at = None;
                    chunk.assigned_link = None;
                    reset += 1;
                }
            }
            Ok(reset)
        })
    }

    /// All known file ids: the in-memory cache plus any manifest documents
    /// already on disk from previous runs.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.manifests.iter().map(|e| e.key().clone()).collect();
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if !ids.iter().any(|id| id == stem) {
                            ids.push(stem.to_string());
                        }
                    }
                }
            }
        }
        ids.sort();
        ids
    }

    fn manifest_path(&self, file_id: &str) -> PathBuf {
        self.dir.join(format!("{file_id}.json"))
    }

    /// Atomic save: tmp file in the same directory, sync, rename.
    fn save(&self, manifest: &FileManifest) -> Result<(), StoreError> {
        let path = self.manifest_path(&manifest.file_id);
        let tmp = path.with_extension("json.tmp");

        let mut on_disk = manifest.clone();
        on_disk.updated_at = Utc::now();
        let text = serde_json::to_vec_pretty(&on_disk)?;

        {
            let mut file = std::fs::File::create(&tmp).map_err(StoreError::io(&tmp))?;
            file.write_all(&text).map_err(StoreError::io(&tmp))?;
            file.sync_all().map_err(StoreError::io(&tmp))?;
        }
        std::fs::rename(&tmp, &path).map_err(StoreError::io(&path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_store() -> (ManifestStore, PathBuf) {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir =
            std::env::temp_dir().join(format!("ferry-store-test-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        (ManifestStore::new(&dir).unwrap(), dir)
    }

    fn write_source(dir: &Path, len: usize) -> PathBuf {
        let path = dir.join("source.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        path
    }

    #[test]
    fn create_builds_a_dense_chunk_plan() {
        let (store, dir) = temp_store();
        let src = write_source(&dir, 65536 * 2 + 500);

        let m = store
            .create("f1", &src, 65536 * 2 + 500, 65536, Priority::Standard)
            .unwrap();
        assert_eq!(m.total_chunks, 3);
        assert_eq!(m.chunks[&2].size, 500);
        assert_eq!(m.file_hash.len(), 64);
        assert!(m.chunks.values().all(|c| c.hash.len() == 16));

        // Persisted and reloadable.
        let fresh = ManifestStore::new(&dir).unwrap();
        let back = fresh.load("f1").unwrap();
        assert_eq!(back.total_chunks, 3);
        assert_eq!(back.file_hash, m.file_hash);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_missing_is_not_found() {
        let (store, dir) = temp_store();
        assert!(matches!(
            store.load("nope").unwrap_err(),
            StoreError::NotFound(_)
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_garbage_is_corrupt() {
        let (store, dir) = temp_store();
        std::fs::write(dir.join("bad.json"), b"{not json").unwrap();
        assert!(matches!(
            store.load("bad").unwrap_err(),
            StoreError::Corrupt { .. }
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ack_is_counted_once() {
        let (store, dir) = temp_store();
        let src = write_source(&dir, 65536 * 2);
        store
            .create("f1", &src, 65536 * 2, 65536, Priority::Standard)
            .unwrap();

        store
            .update_chunk_status("f1", 0, ChunkStatus::InFlight, Some("eth0"))
            .unwrap();
        assert!(store
            .update_chunk_status("f1", 0, ChunkStatus::Acked, None)
            .unwrap());
        // Duplicate ACK changes nothing.
        assert!(!store
            .update_chunk_status("f1", 0, ChunkStatus::Acked, None)
            .unwrap());

        let m = store.load("f1").unwrap();
        assert_eq!(m.bytes_acked, 65536);
        let chunk = &m.chunks[&0];
        assert!(chunk.acked_at.unwrap() >= chunk.sent_at.unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_increments_retry_and_resurrection_resets_it() {
        let (store, dir) = temp_store();
        let src = write_source(&dir, 65536);
        store
            .create("f1", &src, 65536, 65536, Priority::Standard)
            .unwrap();

        store
            .update_chunk_status("f1", 0, ChunkStatus::InFlight, Some("eth0"))
            .unwrap();
        store.bump_retry("f1", 0).unwrap();
        store.bump_retry("f1", 0).unwrap();
        store
            .update_chunk_status("f1", 0, ChunkStatus::Failed, None)
            .unwrap();
        assert_eq!(store.load("f1").unwrap().chunks[&0].retry_count, 3);

        // Failed chunks come back first from get_pending…
        let pending = store.get_pending("f1", None).unwrap();
        assert_eq!(pending[0].status, ChunkStatus::Failed);

        // …and re-sending one starts a fresh attempt counter.
        store
            .update_chunk_status("f1", 0, ChunkStatus::InFlight, Some("eth0"))
            .unwrap();
        assert_eq!(store.load("f1").unwrap().chunks[&0].retry_count, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reset_in_flight_demotes_to_pending() {
        let (store, dir) = temp_store();
        let src = write_source(&dir, 65536 * 3);
        store
            .create("f1", &src, 65536 * 3, 65536, Priority::Standard)
            .unwrap();

        store
            .update_chunk_status("f1", 0, ChunkStatus::InFlight, Some("eth0"))
            .unwrap();
        store
            .update_chunk_status("f1", 1, ChunkStatus::Acked, None)
            .unwrap();

        assert_eq!(store.reset_in_flight("f1").unwrap(), 1);
        let m = store.load("f1").unwrap();
        assert_eq!(m.chunks[&0].status, ChunkStatus::Pending);
        assert!(m.chunks[&0].sent_at.is_none());
        // Acked chunks are never reverted.
        assert_eq!(m.chunks[&1].status, ChunkStatus::Acked);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let (store, dir) = temp_store();
        let src = write_source(&dir, 65536);
        store
            .create("f1", &src, 65536, 65536, Priority::High)
            .unwrap();
        store
            .update_chunk_status("f1", 0, ChunkStatus::InFlight, None)
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn list_includes_on_disk_manifests() {
        let (store, dir) = temp_store();
        let src = write_source(&dir, 65536);
        store
            .create("f1", &src, 65536, 65536, Priority::Standard)
            .unwrap();
        store
            .create("f2", &src, 65536, 65536, Priority::Standard)
            .unwrap();

        // A fresh store discovers both from disk.
        let fresh = ManifestStore::new(&dir).unwrap();
        assert_eq!(fresh.list(), vec!["f1".to_string(), "f2".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
