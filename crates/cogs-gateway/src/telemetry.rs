//! Usage logging and metrics. Append-only structured records per call,
//! rotated daily, with derived per-backend and per-model metrics.
//!
//! `querymt` logs exclusively through `tracing` and has no rotating
//! usage-log sink of its own; this adds one in the same idiom: a small
//! struct wrapping a `tokio::sync::Mutex`-guarded file handle, written with
//! `serde_json` one record per line (NDJSON).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::capability::Capability;
use crate::error::GatewayError;

/// Append-only telemetry record for a single backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCallRecord {
    pub timestamp: DateTime<Utc>,
    pub capability: Capability,
    pub backend_id: String,
    pub duration_ms: u128,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStats {
    pub run_count: u64,
    pub total_duration_ms: u128,
    pub avg_duration_ms: f64,
    pub last_duration_ms: u128,
    pub last_run_at: Option<DateTime<Utc>>,
    recent_durations_ms: std::collections::VecDeque<u128>,
}

const ROLLING_WINDOW: usize = 20;

impl ModelStats {
    fn record(&mut self, duration: Duration) {
        let ms = duration.as_millis();
        self.run_count += 1;
        self.total_duration_ms += ms;
        self.avg_duration_ms = self.total_duration_ms as f64 / self.run_count as f64;
        self.last_duration_ms = ms;
        self.last_run_at = Some(Utc::now());
        self.recent_durations_ms.push_back(ms);
        if self.recent_durations_ms.len() > ROLLING_WINDOW {
            self.recent_durations_ms.pop_front();
        }
    }

    pub fn rolling_avg_ms(&self) -> f64 {
        if self.recent_durations_ms.is_empty() {
            return 0.0;
        }
        let sum: u128 = self.recent_durations_ms.iter().sum();
        sum as f64 / self.recent_durations_ms.len() as f64
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendMetrics {
    pub total_calls: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    durations_ms: Vec<u128>,
}

impl BackendMetrics {
    fn record(&mut self, duration: Duration, ok: bool) {
        self.total_calls += 1;
        if ok {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.durations_ms.push(duration.as_millis());
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.successes as f64 / self.total_calls as f64
    }

    pub fn percentile(&self, p: f64) -> u128 {
        if self.durations_ms.is_empty() {
            return 0;
        }
        let mut sorted = self.durations_ms.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx]
    }
}

#[derive(Default)]
struct MetricsState {
    per_backend: HashMap<String, BackendMetrics>,
    per_model: HashMap<String, ModelStats>,
}

/// A day-rotated NDJSON sink plus in-memory derived metrics.
pub struct UsageLog {
    log_dir: Option<PathBuf>,
    file: Mutex<Option<(NaiveDate, tokio::fs::File)>>,
    state: RwLock<MetricsState>,
}

impl UsageLog {
    pub fn new(log_dir: PathBuf) -> Self {
        UsageLog {
            log_dir: Some(log_dir),
            file: Mutex::new(None),
            state: RwLock::new(MetricsState::default()),
        }
    }

    /// A sink with no backing file, for tests that only care about the
    /// derived in-memory metrics.
    pub fn in_memory() -> Self {
        UsageLog {
            log_dir: None,
            file: Mutex::new(None),
            state: RwLock::new(MetricsState::default()),
        }
    }

    pub async fn record_call(
        &self,
        capability: Capability,
        backend_id: &str,
        duration: Duration,
        ok: bool,
        err: Option<&GatewayError>,
    ) {
        let record = BackendCallRecord {
            timestamp: Utc::now(),
            capability,
            backend_id: backend_id.to_string(),
            duration_ms: duration.as_millis(),
            ok,
            error_class: err.map(|e| e.kind().to_string()),
        };

        {
            let mut state = self.state.write().await;
            state
                .per_backend
                .entry(backend_id.to_string())
                .or_default()
                .record(duration, ok);
        }

        if ok {
            info!(capability = %capability, backend = %backend_id, duration_ms = record.duration_ms, "backend call ok");
        } else {
            warn!(capability = %capability, backend = %backend_id, duration_ms = record.duration_ms, error_class = ?record.error_class, "backend call failed");
        }

        if let Err(e) = self.append(&record).await {
            warn!(error = %e, "failed to append usage log record");
        }
    }

    /// Model Stats are updated only for `generate_text`, keyed by the
    /// *requested model id*, not the adapter id.
    pub async fn record_model_run(&self, model_id: &str, duration: Duration) {
        let mut state = self.state.write().await;
        state
            .per_model
            .entry(model_id.to_string())
            .or_default()
            .record(duration);
    }

    pub async fn backend_metrics(&self) -> HashMap<String, BackendMetrics> {
        self.state.read().await.per_backend.clone()
    }

    pub async fn model_stats(&self) -> HashMap<String, ModelStats> {
        self.state.read().await.per_model.clone()
    }

    /// The model with the lowest rolling-average duration, surfaced as a
    /// "fastest model" hint.
    pub async fn fastest_model_hint(&self) -> Option<String> {
        let state = self.state.read().await;
        state
            .per_model
            .iter()
            .min_by(|a, b| a.1.rolling_avg_ms().partial_cmp(&b.1.rolling_avg_ms()).unwrap())
            .map(|(id, _)| id.clone())
    }

    async fn append(&self, record: &BackendCallRecord) -> Result<(), GatewayError> {
        let Some(log_dir) = &self.log_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(log_dir).await?;
        let today = record.timestamp.date_naive();
        let mut guard = self.file.lock().await;

        let needs_new_file = match &*guard {
            Some((date, _)) => *date != today,
            None => true,
        };

        if needs_new_file {
            let path = log_dir.join(format!("usage-{today}.log"));
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            *guard = Some((today, file));
        }

        if let Some((_, file)) = guard.as_mut() {
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
        }

        Ok(())
    }
}

pub type SharedUsageLog = Arc<UsageLog>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn model_stats_track_rolling_average() {
        let log = UsageLog::in_memory();
        log.record_model_run("m1", Duration::from_millis(100)).await;
        log.record_model_run("m1", Duration::from_millis(200)).await;
        let stats = log.model_stats().await;
        let m1 = stats.get("m1").unwrap();
        assert_eq!(m1.run_count, 2);
        assert_eq!(m1.last_duration_ms, 200);
        assert!((m1.avg_duration_ms - 150.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn backend_metrics_track_success_rate() {
        let log = UsageLog::in_memory();
        log.record_call(Capability::GenerateText, "b1", Duration::from_millis(10), true, None)
            .await;
        log.record_call(
            Capability::GenerateText,
            "b1",
            Duration::from_millis(10),
            false,
            Some(&GatewayError::BackendTimeout("x".into())),
        )
        .await;
        let metrics = log.backend_metrics().await;
        let b1 = metrics.get("b1").unwrap();
        assert_eq!(b1.total_calls, 2);
        assert!((b1.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(b1.consecutive_failures, 1);
    }
}
