//! Concrete job kinds. The actual model/voice backends are out of scope:
//! these workers simulate the network-chunk and filesystem-finalization
//! stages so the Job Manager's checkpoint, progress, and cancellation
//! contract has something real to exercise.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::GatewayError;
use crate::job::{checkpointed_sleep, JobHandle, JobWorker};

const CHUNK: Duration = Duration::from_millis(100);

/// Removes a job's output path (file or directory) if present, honoring
/// the "no partial artifacts remain" invariant.
async fn remove_artifacts(path: &PathBuf) {
    if tokio::fs::metadata(path).await.is_ok() {
        let _ = tokio::fs::remove_dir_all(path).await;
        let _ = tokio::fs::remove_file(path).await;
    }
}

pub struct DownloadModelWorker {
    pub model_id: String,
    pub output_dir: PathBuf,
    pub chunk_count: u32,
}

#[async_trait]
impl JobWorker for DownloadModelWorker {
    async fn run(&self, handle: Arc<JobHandle>) -> Result<(), GatewayError> {
        let out_path = self.output_dir.join(&self.model_id);
        tokio::fs::create_dir_all(&self.output_dir).await?;

        for i in 0..self.chunk_count {
            if handle.cancel_requested() {
                remove_artifacts(&out_path).await;
                return Err(GatewayError::Cancelled);
            }
            checkpointed_sleep(&handle, CHUNK, CHUNK).await?;
            let pct = (((i + 1) * 90) / self.chunk_count.max(1)) as u8;
            handle.set_progress(pct).await;
        }

        if handle.cancel_requested() {
            remove_artifacts(&out_path).await;
            return Err(GatewayError::Cancelled);
        }

        // filesystem finalization checkpoint
        let mut file = tokio::fs::File::create(&out_path).await?;
        file.write_all(format!("model:{}\n", self.model_id).as_bytes()).await?;
        handle.set_progress(100).await;
        info!(model_id = %self.model_id, "model download finalized");
        Ok(())
    }
}

pub struct DownloadVoiceWorker {
    pub voice_name: String,
    pub model_url: String,
    pub config_url: String,
    pub output_dir: PathBuf,
}

#[async_trait]
impl JobWorker for DownloadVoiceWorker {
    async fn run(&self, handle: Arc<JobHandle>) -> Result<(), GatewayError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let blob_path = self.output_dir.join(format!("{}.bin", self.voice_name));
        let sidecar_path = self.output_dir.join(format!("{}.json", self.voice_name));

        if self.model_url.trim().is_empty() || self.config_url.trim().is_empty() {
            return Err(GatewayError::InputInvalid(
                "voice download requires both model_url and config_url".into(),
            ));
        }

        // network-chunk checkpoint for the opaque blob
        checkpointed_sleep(&handle, CHUNK * 3, CHUNK).await?;
        handle.set_progress(40).await;
        if handle.cancel_requested() {
            remove_artifacts(&blob_path).await;
            return Err(GatewayError::Cancelled);
        }
        tokio::fs::write(&blob_path, b"voice-model-blob").await?;

        // network-chunk checkpoint for the JSON sidecar
        checkpointed_sleep(&handle, CHUNK * 2, CHUNK).await?;
        handle.set_progress(80).await;
        if handle.cancel_requested() {
            remove_artifacts(&blob_path).await;
            remove_artifacts(&sidecar_path).await;
            return Err(GatewayError::Cancelled);
        }

        // A voice model file is an opaque blob *plus* a JSON sidecar; both
        // must land together or neither should.
        let sidecar = serde_json::json!({"voice_name": self.voice_name, "source": self.model_url});
        tokio::fs::write(&sidecar_path, serde_json::to_vec(&sidecar)?).await?;

        handle.set_progress(100).await;
        Ok(())
    }
}

pub struct TrainVoiceWorker {
    pub voice_name: String,
    pub training_text: String,
    pub audio_bytes: Vec<u8>,
    pub output_dir: PathBuf,
}

#[async_trait]
impl JobWorker for TrainVoiceWorker {
    async fn run(&self, handle: Arc<JobHandle>) -> Result<(), GatewayError> {
        if self.audio_bytes.is_empty() || self.training_text.trim().is_empty() {
            return Err(GatewayError::InputInvalid(
                "voice training requires non-empty text and audio".into(),
            ));
        }
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let out_path = self.output_dir.join(format!("{}.voice", self.voice_name));

        // subprocess-stage checkpoints, simulated as staged sleeps
        for stage_pct in [20u8, 45, 70, 90] {
            if handle.cancel_requested() {
                remove_artifacts(&out_path).await;
                return Err(GatewayError::Cancelled);
            }
            checkpointed_sleep(&handle, CHUNK * 2, CHUNK).await?;
            handle.set_progress(stage_pct).await;
        }

        if handle.cancel_requested() {
            remove_artifacts(&out_path).await;
            return Err(GatewayError::Cancelled);
        }
        tokio::fs::write(&out_path, &self.audio_bytes).await?;
        handle.set_progress(100).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, JobManager};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn cancelled_download_leaves_no_artifacts() {
        let dir = std::env::temp_dir().join(format!("cogs-test-{}", uuid::Uuid::new_v4()));
        let manager = JobManager::new(200);
        let worker = Arc::new(DownloadModelWorker {
            model_id: "big-model".into(),
            output_dir: dir.clone(),
            chunk_count: 50,
        });
        let id = manager
            .submit(JobKind::DownloadModel, "big-model".into(), worker)
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(30)).await;
        manager.cancel(id, true).await.unwrap();

        for _ in 0..50 {
            let job = manager.status(id).await.unwrap();
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        let job = manager.status(id).await.unwrap();
        assert_eq!(job.status, crate::job::JobStatus::Cancelled);
        assert!(tokio::fs::metadata(dir.join("big-model")).await.is_err());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
