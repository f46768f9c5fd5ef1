//! Upload Assembler. Per-`uploadId` state machine: `idle → opening → receiving →
//! finalizing → done | failed | aborted`. Chunk sinks are plain files under
//! `<workDir>/uploads/<uploadId>.part`, written with `tokio::fs` to stay off the instance
//! worker's cooperative scheduling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Opening,
    Receiving,
    Finalizing,
    Done,
    Failed,
    Aborted,
}

struct PendingUpload {
    instance_id: String,
    owner: Uuid,
    state: UploadState,
    total_bytes: u64,
    chunk_size: u32,
    received: u64,
    expected_sha256: Option<String>,
    hasher: Sha256,
    sink_path: PathBuf,
    sink: Option<fs::File>,
    last_progress_sent_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct UploadOutcome {
    pub path: String,
    pub instance_id: String,
}

pub struct UploadProgress {
    pub owner: Uuid,
    pub received: u64,
    pub total: u64,
    /// `false` when suppressed by the 100 ms throttle.
    pub should_emit: bool,
}

/// Process-wide catalogue of in-flight uploads.
pub struct UploadAssembler {
    work_dir: PathBuf,
    max_upload_bytes: u64,
    max_chunk_bytes: u32,
    uploads: dashmap::DashMap<String, Arc<Mutex<PendingUpload>>>,
}

impl UploadAssembler {
    pub fn new(work_dir: PathBuf, max_upload_bytes: u64, max_chunk_bytes: u32) -> Self {
        Self {
            work_dir,
            max_upload_bytes,
            max_chunk_bytes,
            uploads: dashmap::DashMap::new(),
        }
    }

    /// `uploadBegin`: rejected if `totalBytes`/`chunkSize` exceed the configured limits.
    /// The parent instance's existence is checked by the caller (ws.rs), which has the
    /// Instance Store handle.
    pub async fn begin(
        &self,
        instance_id: &str,
        upload_id: &str,
        owner: Uuid,
        total_bytes: u64,
        chunk_size: u32,
        sha256: Option<String>,
    ) -> Result<()> {
        let mut state = UploadState::Opening;

        if total_bytes > self.max_upload_bytes || chunk_size > self.max_chunk_bytes || chunk_size == 0 {
            return Err(RuntimeError::SizeLimit);
        }

        let dir = self.work_dir.join("uploads");
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| RuntimeError::Internal(format!("failed to create upload dir: {e}")))?;
        let sink_path = dir.join(format!("{upload_id}.part"));
        let sink = fs::File::create(&sink_path)
            .await
            .map_err(|e| RuntimeError::Internal(format!("failed to create upload sink: {e}")))?;
        state = UploadState::Receiving;

        let pending = PendingUpload {
            instance_id: instance_id.to_string(),
            owner,
            state,
            total_bytes,
            chunk_size,
            received: 0,
            expected_sha256: sha256,
            hasher: Sha256::new(),
            sink_path,
            sink: Some(sink),
            last_progress_sent_ms: 0,
        };
        self.uploads.insert(upload_id.to_string(), Arc::new(Mutex::new(pending)));
        Ok(())
    }

    /// `uploadChunk`: accepted only if `seq == received / chunkSize`; anything else fails
    /// the upload with `BAD_SEQ`.
    pub async fn chunk(&self, upload_id: &str, seq: u64, bytes_base64: &str) -> Result<UploadProgress> {
        let entry = self.uploads.get(upload_id).map(|e| e.value().clone());
        let Some(entry) = entry else {
            return Err(RuntimeError::BadFrame(format!("unknown upload '{upload_id}'")));
        };
        let mut upload = entry.lock().await;

        if upload.state != UploadState::Receiving {
            return Err(RuntimeError::BadSeq);
        }

        let expected_seq = upload.received / upload.chunk_size as u64;
        if seq != expected_seq {
            upload.state = UploadState::Failed;
            drop(upload);
            self.delete_sink(&entry).await;
            return Err(RuntimeError::BadSeq);
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(bytes_base64)
            .map_err(|_| RuntimeError::BadFrame("invalid base64 chunk".into()))?;

        if upload.received + bytes.len() as u64 > upload.total_bytes {
            upload.state = UploadState::Failed;
            drop(upload);
            self.delete_sink(&entry).await;
            return Err(RuntimeError::SizeLimit);
        }

        upload
            .sink
            .as_mut()
            .expect("sink open while receiving")
            .write_all(&bytes)
            .await
            .map_err(|e| RuntimeError::Internal(format!("upload write failed: {e}")))?;
        upload.hasher.update(&bytes);
        upload.received += bytes.len() as u64;

        let now = now_ms();
        let should_emit = now - upload.last_progress_sent_ms >= 100;
        if should_emit {
            upload.last_progress_sent_ms = now;
        }

        Ok(UploadProgress {
            owner: upload.owner,
            received: upload.received,
            total: upload.total_bytes,
            should_emit,
        })
    }

    /// `uploadEnd`: `done` iff every byte arrived and the optional sha256 matches;
    /// otherwise `failed`.
    pub async fn end(&self, upload_id: &str) -> Result<UploadOutcome> {
        let entry = self.uploads.get(upload_id).map(|e| e.value().clone());
        let Some(entry) = entry else {
            return Err(RuntimeError::BadFrame(format!("unknown upload '{upload_id}'")));
        };
        let mut upload = entry.lock().await;

        if upload.state != UploadState::Receiving {
            return Err(RuntimeError::BadSeq);
        }
        upload.state = UploadState::Finalizing;

        if let Some(mut sink) = upload.sink.take() {
            let _ = sink.flush().await;
        }

        let size_ok = upload.received == upload.total_bytes;
        let hash_ok = match &upload.expected_sha256 {
            None => true,
            Some(expected) => {
                let digest = upload.hasher.clone().finalize();
                let actual = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
                &actual == expected
            }
        };

        if !size_ok {
            upload.state = UploadState::Failed;
            let instance_id = upload.instance_id.clone();
            drop(upload);
            self.delete_sink(&entry).await;
            self.uploads.remove(upload_id);
            let _ = instance_id;
            return Err(RuntimeError::SizeLimit);
        }
        if !hash_ok {
            upload.state = UploadState::Failed;
            drop(upload);
            self.delete_sink(&entry).await;
            self.uploads.remove(upload_id);
            return Err(RuntimeError::HashMismatch);
        }

        upload.state = UploadState::Done;
        let outcome = UploadOutcome {
            path: upload.sink_path.to_string_lossy().into_owned(),
            instance_id: upload.instance_id.clone(),
        };
        drop(upload);
        self.uploads.remove(upload_id);
        Ok(outcome)
    }

    /// Move every in-flight upload owned by `instance_id` to `aborted`
    /// and delete its sink.
    pub async fn abort_for_instance(&self, instance_id: &str) {
        let ids: Vec<String> = self
            .uploads
            .iter()
            .filter(|e| e.value().try_lock().map(|u| u.instance_id == instance_id).unwrap_or(false))
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.abort(&id).await;
        }
    }

    /// Same, keyed by the owning connection.
    pub async fn abort_for_connection(&self, connection_id: Uuid) {
        let ids: Vec<String> = self
            .uploads
            .iter()
            .filter(|e| e.value().try_lock().map(|u| u.owner == connection_id).unwrap_or(false))
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.abort(&id).await;
        }
    }

    pub async fn abort(&self, upload_id: &str) {
        if let Some((_, entry)) = self.uploads.remove(upload_id) {
            {
                let mut upload = entry.lock().await;
                upload.state = UploadState::Aborted;
                upload.sink = None;
            }
            self.delete_sink(&entry).await;
        }
    }

    async fn delete_sink(&self, entry: &Arc<Mutex<PendingUpload>>) {
        let path = entry.lock().await.sink_path.clone();
        let _ = fs::remove_file(path).await;
    }
}

/// Builds the `upload-progress` payload as JSON (protocol.rs owns the
/// typed shape; this keeps upload.rs decoupled from the wire module for
/// the pure state-machine unit tests below).
pub fn progress_json(upload_id: &str, received: u64, total: u64) -> Json {
    serde_json::json!({ "uploadId": upload_id, "received": received, "total": total })
}

pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("lcr-upload-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn happy_path_assembles_and_verifies_hash() {
        let assembler = UploadAssembler::new(tmp_dir(), 1024, 256);
        let data = b"abcd".repeat(64); // 256 bytes, one chunk
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(&data);
            hasher.finalize().iter().map(|b| format!("{b:02x}")).collect::<String>()
        };
        assembler
            .begin("inst-1", "up-1", Uuid::new_v4(), data.len() as u64, 256, Some(expected))
            .await
            .unwrap();
        let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
        let progress = assembler.chunk("up-1", 0, &b64).await.unwrap();
        assert_eq!(progress.received, 256);
        let outcome = assembler.end("up-1").await.unwrap();
        assert_eq!(outcome.instance_id, "inst-1");
        assert!(tokio::fs::metadata(&outcome.path).await.is_ok());
        tokio::fs::remove_file(&outcome.path).await.ok();
    }

    #[tokio::test]
    async fn out_of_order_chunk_fails_the_upload() {
        let assembler = UploadAssembler::new(tmp_dir(), 1024, 256);
        assembler
            .begin("inst-1", "up-2", Uuid::new_v4(), 1024, 256, None)
            .await
            .unwrap();
        let chunk = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 256]);
        assembler.chunk("up-2", 0, &chunk).await.unwrap();
        let result = assembler.chunk("up-2", 2, &chunk).await;
        assert!(matches!(result, Err(RuntimeError::BadSeq)));
        // Upload is dead; subsequent chunks are rejected too.
        assert!(assembler.chunk("up-2", 1, &chunk).await.is_err());
    }

    #[tokio::test]
    async fn size_limit_rejects_oversize_begin() {
        let assembler = UploadAssembler::new(tmp_dir(), 100, 256);
        let result = assembler.begin("inst-1", "up-3", Uuid::new_v4(), 1000, 256, None).await;
        assert!(matches!(result, Err(RuntimeError::SizeLimit)));
    }

    #[tokio::test]
    async fn hash_mismatch_fails_on_end() {
        let assembler = UploadAssembler::new(tmp_dir(), 1024, 256);
        assembler
            .begin("inst-1", "up-4", Uuid::new_v4(), 4, 256, Some("deadbeef".into()))
            .await
            .unwrap();
        let chunk = base64::engine::general_purpose::STANDARD.encode(b"abcd");
        assembler.chunk("up-4", 0, &chunk).await.unwrap();
        let result = assembler.end("up-4").await;
        assert!(matches!(result, Err(RuntimeError::HashMismatch)));
    }

    #[tokio::test]
    async fn abort_removes_sink() {
        let assembler = UploadAssembler::new(tmp_dir(), 1024, 256);
        let owner = Uuid::new_v4();
        assembler.begin("inst-1", "up-5", owner, 256, 256, None).await.unwrap();
        assembler.abort_for_connection(owner).await;
        assert!(assembler.chunk("up-5", 0, "").await.is_err());
    }
}
