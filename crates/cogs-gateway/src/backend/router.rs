//! Backend Router: given `(capability, request, options)`, picks
//! primary/fallback per policy and records which backend served the call.
//! Grounded in `querymt-service::build_provider` + `handle_chat`'s
//! try-the-configured-provider shape, generalized into an explicit
//! ordered-fallback loop with health-check cooldown, since `querymt-service`
//! itself has no automatic fallback (a client picks one provider per call).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::backend::adapter::{BackendAdapter, GenerateTextOutput, GenerateTextParams, SearchResult, SynthesizeParams};
use crate::backend::descriptor::{BackendDescriptor, SelectionPolicy};
use crate::capability::Capability;
use crate::error::GatewayError;
use crate::telemetry::UsageLog;

pub struct BackendRouter {
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
    descriptors: RwLock<HashMap<String, BackendDescriptor>>,
    policies: HashMap<Capability, SelectionPolicy>,
    usage_log: Arc<UsageLog>,
    health_cooldown: Duration,
    failure_threshold: u32,
}

impl BackendRouter {
    pub fn new(
        adapters: Vec<Arc<dyn BackendAdapter>>,
        descriptors: Vec<BackendDescriptor>,
        policies: HashMap<Capability, SelectionPolicy>,
        usage_log: Arc<UsageLog>,
        health_cooldown: Duration,
        failure_threshold: u32,
    ) -> Self {
        let adapters = adapters.into_iter().map(|a| (a.id().to_string(), a)).collect();
        let descriptors = descriptors.into_iter().map(|d| (d.id.clone(), d)).collect();
        BackendRouter {
            adapters,
            descriptors: RwLock::new(descriptors),
            policies,
            usage_log,
            health_cooldown,
            failure_threshold,
        }
    }

    /// Snapshot of every descriptor, for `GET /status`.
    pub async fn snapshot(&self) -> Vec<BackendDescriptor> {
        self.descriptors.read().await.values().cloned().collect()
    }

    /// Per-adapter model inventory, for `GET /models`.
    pub async fn list_models(&self) -> HashMap<String, Vec<String>> {
        let mut out = HashMap::new();
        for (id, adapter) in &self.adapters {
            match adapter.list_models().await {
                Ok(models) => {
                    out.insert(id.clone(), models);
                }
                Err(e) => {
                    warn!(backend = %id, error = %e, "failed to list models");
                }
            }
        }
        out
    }

    /// Whether `model` appears in any adapter's reported inventory. If no
    /// adapter can currently report an inventory at all (none reachable,
    /// or none expose one), there is nothing to validate against, so the
    /// id is treated as known rather than rejecting every request.
    pub async fn model_known(&self, model: &str) -> bool {
        let inventory = self.list_models().await;
        if inventory.values().all(|models| models.is_empty()) {
            return true;
        }
        inventory.values().any(|models| models.iter().any(|m| m == model))
    }

    /// Background health-probe loop: on an interval, re-check unavailable
    /// backends and flip them back to available on a successful probe.
    pub async fn run_health_checks(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let unavailable_ids: Vec<String> = {
                let guard = self.descriptors.read().await;
                guard
                    .values()
                    .filter(|d| !d.is_available)
                    .map(|d| d.id.clone())
                    .collect()
            };
            for id in unavailable_ids {
                let Some(adapter) = self.adapters.get(&id) else {
                    continue;
                };
                let probe_ok = adapter.health().await.is_ok();
                let mut guard = self.descriptors.write().await;
                if let Some(desc) = guard.get_mut(&id) {
                    desc.last_health_check = Some(Instant::now());
                    if probe_ok {
                        info!(backend = %id, "health check succeeded, marking available");
                        desc.is_available = true;
                        desc.consecutive_failures = 0;
                        desc.unavailable_since = None;
                    }
                }
            }
        }
    }

    fn policy(&self, capability: Capability) -> Result<&SelectionPolicy, GatewayError> {
        self.policies
            .get(&capability)
            .ok_or_else(|| GatewayError::Internal(format!("no policy configured for {capability}")))
    }

    async fn is_in_cooldown(&self, id: &str) -> bool {
        let guard = self.descriptors.read().await;
        match guard.get(id) {
            Some(d) if !d.is_available => d
                .unavailable_since
                .map(|since| since.elapsed() < self.health_cooldown)
                .unwrap_or(true),
            _ => false,
        }
    }

    async fn record_failure(&self, id: &str) {
        let mut guard = self.descriptors.write().await;
        if let Some(desc) = guard.get_mut(id) {
            desc.consecutive_failures += 1;
            if desc.consecutive_failures >= self.failure_threshold {
                if desc.is_available {
                    warn!(backend = %id, failures = desc.consecutive_failures, "marking backend unavailable");
                }
                desc.is_available = false;
                desc.unavailable_since = Some(Instant::now());
            }
        }
    }

    async fn record_success(&self, id: &str) {
        let mut guard = self.descriptors.write().await;
        if let Some(desc) = guard.get_mut(id) {
            desc.consecutive_failures = 0;
        }
    }

    /// Core fallback loop shared by every capability. Model-stats update is
    /// excluded here — it is keyed by the *requested model id*, not the
    /// adapter id, so `generate_text` records it itself once the loop
    /// returns, rather than threading the model id through this generic
    /// helper.
    async fn try_backends<T, F, Fut>(
        &self,
        capability: Capability,
        mut call: F,
    ) -> Result<(T, String), GatewayError>
    where
        F: FnMut(Arc<dyn BackendAdapter>) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let policy = self.policy(capability)?;
        if policy.order.is_empty() {
            return Err(GatewayError::Internal(format!(
                "no backends configured for {capability}"
            )));
        }

        let mut last_err: Option<GatewayError> = None;
        for (idx, backend_id) in policy.order.iter().enumerate() {
            let is_primary_attempt = idx == 0;

            if self.is_in_cooldown(backend_id).await {
                info!(backend = %backend_id, %capability, "skipping backend, still in health-check cooldown");
                last_err = Some(GatewayError::BackendUnavailable(format!(
                    "{backend_id} is in cooldown"
                )));
                if !policy.fallback_enabled {
                    break;
                }
                continue;
            }

            let Some(adapter) = self.adapters.get(backend_id).cloned() else {
                last_err = Some(GatewayError::Internal(format!(
                    "backend '{backend_id}' has no registered adapter"
                )));
                continue;
            };

            let started = Instant::now();
            let result = call(adapter).await;
            let duration = started.elapsed();
            let ok = result.is_ok();
            self.usage_log
                .record_call(capability, backend_id, duration, ok, result.as_ref().err())
                .await;

            match result {
                Ok(value) => {
                    self.record_success(backend_id).await;
                    return Ok((value, backend_id.clone()));
                }
                Err(err) => {
                    if err.is_fallback_eligible() {
                        self.record_failure(backend_id).await;
                        last_err = Some(err);
                        if !policy.fallback_enabled {
                            // strict mode fails immediately rather than trying
                            // alternates.
                            break;
                        }
                        let _ = is_primary_attempt;
                        continue;
                    }
                    // BackendRejected (bad request) never falls back: surfacing
                    // it masks a client error behind another backend's
                    // acceptance.
                    return Err(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            GatewayError::BackendUnavailable(format!("no backend available for {capability}"))
        }))
    }

    /// The single choke point every caller of `generate_text` traverses
    /// (`/chat`, `/llm`, the `/v1/chat/completions` shim, every research-
    /// workflow step), so Model Stats are recorded here, keyed by the
    /// *requested* model id, rather than by each caller individually.
    pub async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
        params: &GenerateTextParams,
    ) -> Result<(GenerateTextOutput, String), GatewayError> {
        let model_id = model.to_string();
        let prompt = prompt.to_string();
        let system = system.map(|s| s.to_string());
        let params = params.clone();
        let started = Instant::now();
        let result = self.try_backends(Capability::GenerateText, {
            let model_id = model_id.clone();
            move |adapter| {
                let model = model_id.clone();
                let prompt = prompt.clone();
                let system = system.clone();
                let params = params.clone();
                async move {
                    adapter.ensure_model_loaded(&model).await?;
                    adapter
                        .generate_text(&prompt, system.as_deref(), &model, &params)
                        .await
                }
            }
        })
        .await;

        if result.is_ok() {
            self.usage_log.record_model_run(&model_id, started.elapsed()).await;
        }

        result
    }

    pub async fn transcribe_audio(
        &self,
        audio_bytes: &[u8],
        format_hint: Option<&str>,
        model: Option<&str>,
    ) -> Result<(String, String), GatewayError> {
        let audio_bytes = audio_bytes.to_vec();
        let format_hint = format_hint.map(|s| s.to_string());
        let model = model.map(|s| s.to_string());
        self.try_backends(Capability::TranscribeAudio, move |adapter| {
            let audio_bytes = audio_bytes.clone();
            let format_hint = format_hint.clone();
            let model = model.clone();
            async move {
                adapter
                    .transcribe_audio(&audio_bytes, format_hint.as_deref(), model.as_deref())
                    .await
            }
        })
        .await
    }

    pub async fn synthesize_speech(
        &self,
        text: &str,
        voice_id: &str,
        params: &SynthesizeParams,
    ) -> Result<(Vec<u8>, String), GatewayError> {
        let text = text.to_string();
        let voice_id = voice_id.to_string();
        let params = params.clone();
        self.try_backends(Capability::SynthesizeSpeech, move |adapter| {
            let text = text.clone();
            let voice_id = voice_id.clone();
            let params = params.clone();
            async move { adapter.synthesize_speech(&text, &voice_id, &params).await }
        })
        .await
    }

    pub async fn search_web(
        &self,
        query: &str,
        max_results: usize,
        region: Option<&str>,
        safesearch: bool,
    ) -> Result<(Vec<SearchResult>, String), GatewayError> {
        let query = query.to_string();
        let region = region.map(|s| s.to_string());
        self.try_backends(Capability::SearchWeb, move |adapter| {
            let query = query.clone();
            let region = region.clone();
            async move {
                adapter
                    .search_web(&query, max_results, region.as_deref(), safesearch)
                    .await
            }
        })
        .await
    }

    pub async fn search_scholarly(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<(Vec<SearchResult>, String), GatewayError> {
        let query = query.to_string();
        self.try_backends(Capability::SearchScholarly, move |adapter| {
            let query = query.clone();
            async move { adapter.search_scholarly(&query, max_results).await }
        })
        .await
    }

    pub async fn generate_audio(
        &self,
        prompt: &str,
        duration: Duration,
        style: Option<&str>,
    ) -> Result<(Vec<u8>, String), GatewayError> {
        let prompt = prompt.to_string();
        let style = style.map(|s| s.to_string());
        self.try_backends(Capability::GenerateAudio, move |adapter| {
            let prompt = prompt.clone();
            let style = style.clone();
            async move { adapter.generate_audio(&prompt, duration, style.as_deref()).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::adapter::BackendAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyAdapter {
        id: String,
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl BackendAdapter for FlakyAdapter {
        fn id(&self) -> &str {
            &self.id
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::GenerateText]
        }
        async fn generate_text(
            &self,
            prompt: &str,
            _system: Option<&str>,
            _model: &str,
            _params: &GenerateTextParams,
        ) -> Result<GenerateTextOutput, GatewayError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(GatewayError::BackendUnavailable("down".into()));
            }
            Ok(GenerateTextOutput {
                text: format!("echo: {prompt}"),
            })
        }
    }

    struct RejectingAdapter;

    #[async_trait]
    impl BackendAdapter for RejectingAdapter {
        fn id(&self) -> &str {
            "rejector"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::GenerateText]
        }
        async fn generate_text(
            &self,
            _prompt: &str,
            _system: Option<&str>,
            _model: &str,
            _params: &GenerateTextParams,
        ) -> Result<GenerateTextOutput, GatewayError> {
            Err(GatewayError::BackendRejected("bad prompt".into()))
        }
    }

    fn policy_map(order: Vec<&str>, fallback_enabled: bool) -> HashMap<Capability, SelectionPolicy> {
        let mut m = HashMap::new();
        m.insert(
            Capability::GenerateText,
            SelectionPolicy::new(order.into_iter().map(String::from).collect(), fallback_enabled),
        );
        m
    }

    #[tokio::test]
    async fn falls_back_to_secondary_when_primary_unavailable() {
        let primary = Arc::new(FlakyAdapter {
            id: "primary".into(),
            fail_times: AtomicU32::new(10),
        });
        let secondary = Arc::new(FlakyAdapter {
            id: "secondary".into(),
            fail_times: AtomicU32::new(0),
        });
        let descriptors = vec![
            BackendDescriptor::new("primary", Capability::GenerateText, true, 1),
            BackendDescriptor::new("secondary", Capability::GenerateText, false, 1),
        ];
        let usage_log = Arc::new(UsageLog::in_memory());
        let router = BackendRouter::new(
            vec![primary, secondary],
            descriptors,
            policy_map(vec!["primary", "secondary"], true),
            usage_log,
            Duration::from_secs(30),
            3,
        );

        let (out, used) = router
            .generate_text("m1", "hi", None, &GenerateTextParams::default())
            .await
            .unwrap();
        assert_eq!(used, "secondary");
        assert_eq!(out.text, "echo: hi");
    }

    #[tokio::test]
    async fn strict_mode_does_not_fall_back() {
        let primary = Arc::new(FlakyAdapter {
            id: "primary".into(),
            fail_times: AtomicU32::new(10),
        });
        let secondary = Arc::new(FlakyAdapter {
            id: "secondary".into(),
            fail_times: AtomicU32::new(0),
        });
        let descriptors = vec![
            BackendDescriptor::new("primary", Capability::GenerateText, true, 1),
            BackendDescriptor::new("secondary", Capability::GenerateText, false, 1),
        ];
        let usage_log = Arc::new(UsageLog::in_memory());
        let router = BackendRouter::new(
            vec![primary, secondary],
            descriptors,
            policy_map(vec!["primary", "secondary"], false),
            usage_log,
            Duration::from_secs(30),
            3,
        );

        let err = router
            .generate_text("m1", "hi", None, &GenerateTextParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BackendUnavailable");
    }

    #[tokio::test]
    async fn rejected_request_never_falls_back() {
        let rejector = Arc::new(RejectingAdapter);
        let secondary = Arc::new(FlakyAdapter {
            id: "secondary".into(),
            fail_times: AtomicU32::new(0),
        });
        let descriptors = vec![
            BackendDescriptor::new("rejector", Capability::GenerateText, true, 1),
            BackendDescriptor::new("secondary", Capability::GenerateText, false, 1),
        ];
        let usage_log = Arc::new(UsageLog::in_memory());
        let router = BackendRouter::new(
            vec![rejector, secondary],
            descriptors,
            policy_map(vec!["rejector", "secondary"], true),
            usage_log,
            Duration::from_secs(30),
            3,
        );

        let err = router
            .generate_text("m1", "hi", None, &GenerateTextParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BackendRejected");
    }

    struct InventoryAdapter {
        models: Vec<String>,
    }

    #[async_trait]
    impl BackendAdapter for InventoryAdapter {
        fn id(&self) -> &str {
            "inventory"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::GenerateText]
        }
        async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
            Ok(self.models.clone())
        }
    }

    #[tokio::test]
    async fn model_known_checks_against_reported_inventory() {
        let adapter = Arc::new(InventoryAdapter {
            models: vec!["m-small".to_string()],
        });
        let descriptors = vec![BackendDescriptor::new("inventory", Capability::GenerateText, true, 1)];
        let router = BackendRouter::new(
            vec![adapter],
            descriptors,
            policy_map(vec!["inventory"], true),
            Arc::new(UsageLog::in_memory()),
            Duration::from_secs(30),
            3,
        );
        assert!(router.model_known("m-small").await);
        assert!(!router.model_known("m-nonexistent").await);
    }

    #[tokio::test]
    async fn model_known_is_lenient_when_no_inventory_is_reported() {
        let adapter = Arc::new(FlakyAdapter {
            id: "primary".into(),
            fail_times: AtomicU32::new(0),
        });
        let descriptors = vec![BackendDescriptor::new("primary", Capability::GenerateText, true, 1)];
        let router = BackendRouter::new(
            vec![adapter],
            descriptors,
            policy_map(vec!["primary"], true),
            Arc::new(UsageLog::in_memory()),
            Duration::from_secs(30),
            3,
        );
        assert!(router.model_known("anything").await);
    }
}
