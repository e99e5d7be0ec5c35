//! Backend Adapters: a uniform call surface over each external inference
//! backend. Grounded in `querymt`'s `LLMProvider` supertrait,
//! which unifies chat/completion/embedding/stt/tts behind one object and
//! lets a provider that only implements a subset (e.g. `IzwiProvider`,
//! audio-only) return a `NotImplemented`-style error for the rest. The
//! gateway does the same: one `BackendAdapter` trait with a method per
//! capability, defaulted to an error so a concrete adapter only overrides
//! what it actually backs.
//!
//! Each adapter owns its model-load state and must not block an in-flight
//! call to load a different model (it may serialize loads internally, or
//! refuse with `BackendBusy`) — grounded in
//! `IzwiProvider::ensure_model_loaded`'s idempotent load-or-download
//! pattern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capability::Capability;
use crate::error::GatewayError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateTextParams {
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateTextOutput {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesizeParams {
    #[serde(default)]
    pub speed: Option<f32>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub uri: String,
    pub snippet: String,
    pub score: f32,
}

fn unsupported(capability: Capability, adapter_id: &str) -> GatewayError {
    GatewayError::Internal(format!(
        "adapter '{adapter_id}' does not implement capability '{capability}'"
    ))
}

/// A concrete backend, addressable by id, capable of some subset of
/// `Capability`. Methods default to an error so implementers only need to
/// override what they actually back.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Idempotent (re)load of `model_id`. Adapters with no loadable-model
    /// notion (e.g. a hosted search API) return `Ok(())`.
    async fn ensure_model_loaded(&self, _model_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Cheap liveness probe used by the router's periodic health check.
    async fn health(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Model ids this adapter currently knows how to serve, for `GET
    /// /models`. An adapter with no enumerable model set (e.g. a hosted
    /// search API) returns an empty list rather than erroring.
    async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        Ok(Vec::new())
    }

    async fn generate_text(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _model: &str,
        _params: &GenerateTextParams,
    ) -> Result<GenerateTextOutput, GatewayError> {
        Err(unsupported(Capability::GenerateText, self.id()))
    }

    async fn transcribe_audio(
        &self,
        _audio_bytes: &[u8],
        _format_hint: Option<&str>,
        _model: Option<&str>,
    ) -> Result<String, GatewayError> {
        Err(unsupported(Capability::TranscribeAudio, self.id()))
    }

    async fn synthesize_speech(
        &self,
        _text: &str,
        _voice_id: &str,
        _params: &SynthesizeParams,
    ) -> Result<Vec<u8>, GatewayError> {
        Err(unsupported(Capability::SynthesizeSpeech, self.id()))
    }

    async fn search_web(
        &self,
        _query: &str,
        _max_results: usize,
        _region: Option<&str>,
        _safesearch: bool,
    ) -> Result<Vec<SearchResult>, GatewayError> {
        Err(unsupported(Capability::SearchWeb, self.id()))
    }

    async fn search_scholarly(
        &self,
        _query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchResult>, GatewayError> {
        Err(unsupported(Capability::SearchScholarly, self.id()))
    }

    async fn generate_audio(
        &self,
        _prompt: &str,
        _duration: Duration,
        _style: Option<&str>,
    ) -> Result<Vec<u8>, GatewayError> {
        Err(unsupported(Capability::GenerateAudio, self.id()))
    }
}
