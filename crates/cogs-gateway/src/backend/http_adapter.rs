//! Concrete HTTP-backed [`BackendAdapter`]. Talks to an Ollama-compatible
//! chat endpoint for text generation and list_models, grounded directly in
//! `roverseer_api.py::run_chat_completion`'s `POST {base}/api/chat` call
//! (`{model, messages, stream:false}` -> `{message:{content}}`) and
//! `get_model_tags`'s `GET {base}/api/tags` -> `{models:[{name}]}`.
//!
//! Speech/search capabilities are served by a small REST convention layered
//! on the same `base_url` (`POST /tts`, `POST /asr`, `POST /search`) since
//! the original's STT/TTS calls are local library calls, not HTTP ones, and
//! every backend here is modeled uniformly as a network service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::backend::adapter::{
    BackendAdapter, GenerateTextOutput, GenerateTextParams, SearchResult, SynthesizeParams,
};
use crate::capability::Capability;
use crate::error::GatewayError;

pub struct HttpAdapter {
    id: String,
    base_url: String,
    capabilities: Vec<Capability>,
    client: reqwest::Client,
    /// Serializes `ensure_model_loaded` so two concurrent requests for the
    /// same adapter don't both kick off a redundant load, while a call
    /// already in flight for a different model is never blocked by it.
    load_lock: Mutex<()>,
}

impl HttpAdapter {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        HttpAdapter {
            id: id.into(),
            base_url: base_url.into(),
            capabilities,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client builds with static config"),
            load_lock: Mutex::new(()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Maps an HTTP response's status into the adapter-layer error taxonomy
/// before `querymt`'s own `error_for_status` would collapse it into one
/// generic `reqwest::Error`. A 4xx (client-error) status means the backend
/// rejected the *request itself* — `BackendRejected`, never fallback-
/// eligible, per §4.B's "don't mask a client error behind another
/// backend's acceptance" rule. 408/429 are retry-worthy, not rejections.
/// 5xx means the backend itself is unhealthy — `BackendUnavailable`.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
        Err(GatewayError::BackendUnavailable(format!("{status}: {body}")))
    } else if status.is_client_error() {
        Err(GatewayError::BackendRejected(format!("{status}: {body}")))
    } else {
        Err(GatewayError::BackendProtocol(format!("{status}: {body}")))
    }
}

#[derive(Deserialize)]
struct OllamaChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatMessage,
}

#[derive(Deserialize)]
struct OllamaTagEntry {
    name: String,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaTagEntry>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[async_trait]
impl BackendAdapter for HttpAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn ensure_model_loaded(&self, model_id: &str) -> Result<(), GatewayError> {
        let _guard = self.load_lock.lock().await;
        let resp = self
            .client
            .post(self.url("/api/show"))
            .json(&json!({ "name": model_id }))
            .send()
            .await?;
        if resp.status().as_u16() == 409 {
            return Err(GatewayError::BackendBusy(format!(
                "{} busy loading {model_id}",
                self.id
            )));
        }
        check_status(resp).await?;
        Ok(())
    }

    async fn health(&self) -> Result<(), GatewayError> {
        self.client.get(self.url("/api/tags")).send().await?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        let resp = self.client.get(self.url("/api/tags")).send().await?;
        let resp = check_status(resp)
            .await?
            .json::<OllamaTagsResponse>()
            .await
            .map_err(|e| GatewayError::BackendProtocol(e.to_string()))?;
        Ok(resp.models.into_iter().map(|m| m.name).collect())
    }

    async fn generate_text(
        &self,
        prompt: &str,
        system: Option<&str>,
        model: &str,
        params: &GenerateTextParams,
    ) -> Result<GenerateTextOutput, GatewayError> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let resp = self
            .client
            .post(self.url("/api/chat"))
            .json(&json!({
                "model": model,
                "messages": messages,
                "stream": false,
                "options": {
                    "temperature": params.temperature,
                    "num_predict": params.max_tokens,
                },
            }))
            .send()
            .await?;
        let resp = check_status(resp)
            .await?
            .json::<OllamaChatResponse>()
            .await
            .map_err(|e| GatewayError::BackendProtocol(e.to_string()))?;

        Ok(GenerateTextOutput {
            text: resp.message.content,
        })
    }

    async fn transcribe_audio(
        &self,
        audio_bytes: &[u8],
        format_hint: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, GatewayError> {
        let part = reqwest::multipart::Part::bytes(audio_bytes.to_vec())
            .file_name(format!("audio.{}", format_hint.unwrap_or("wav")));
        let mut form = reqwest::multipart::Form::new().part("audio", part);
        if let Some(model) = model {
            form = form.text("model", model.to_string());
        }

        let resp = self.client.post(self.url("/asr")).multipart(form).send().await?;
        let resp = check_status(resp)
            .await?
            .json::<TranscriptionResponse>()
            .await
            .map_err(|e| GatewayError::BackendProtocol(e.to_string()))?;

        Ok(resp.text)
    }

    async fn synthesize_speech(
        &self,
        text: &str,
        voice_id: &str,
        params: &SynthesizeParams,
    ) -> Result<Vec<u8>, GatewayError> {
        let resp = self
            .client
            .post(self.url("/tts"))
            .json(&json!({
                "text": text,
                "voice": voice_id,
                "speed": params.speed,
                "format": params.format,
            }))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn search_web(
        &self,
        query: &str,
        max_results: usize,
        region: Option<&str>,
        safesearch: bool,
    ) -> Result<Vec<SearchResult>, GatewayError> {
        let resp = self
            .client
            .post(self.url("/search"))
            .json(&json!({
                "query": query,
                "max_results": max_results,
                "region": region,
                "safesearch": safesearch,
            }))
            .send()
            .await?;
        let resp = check_status(resp)
            .await?
            .json::<SearchResponse>()
            .await
            .map_err(|e| GatewayError::BackendProtocol(e.to_string()))?;
        Ok(resp.results)
    }

    async fn search_scholarly(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, GatewayError> {
        let resp = self
            .client
            .post(self.url("/search/scholarly"))
            .json(&json!({ "query": query, "max_results": max_results }))
            .send()
            .await?;
        let resp = check_status(resp)
            .await?
            .json::<SearchResponse>()
            .await
            .map_err(|e| GatewayError::BackendProtocol(e.to_string()))?;
        Ok(resp.results)
    }

    async fn generate_audio(
        &self,
        prompt: &str,
        duration: Duration,
        style: Option<&str>,
    ) -> Result<Vec<u8>, GatewayError> {
        let resp = self
            .client
            .post(self.url("/audio/generate"))
            .json(&json!({
                "prompt": prompt,
                "duration_secs": duration.as_secs(),
                "style": style,
            }))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Build one [`HttpAdapter`] per configured backend.
pub fn adapters_from_config(backends: &[crate::config::BackendConfig]) -> Vec<Arc<dyn BackendAdapter>> {
    backends
        .iter()
        .map(|b| {
            Arc::new(HttpAdapter::new(b.id.clone(), b.base_url.clone(), vec![b.capability]))
                as Arc<dyn BackendAdapter>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path_without_double_slash() {
        let adapter = HttpAdapter::new("a", "http://localhost:11434/", vec![Capability::GenerateText]);
        assert_eq!(adapter.url("/api/tags"), "http://localhost:11434/api/tags");
    }
}
