//! Pipeline Orchestrator: sequences the STT -> LLM -> TTS conversational
//! pipeline with per-stage progress signalling and interruptibility.
//!
//! Grounded in `querymt-service::handle_chat`'s single-request orchestration
//! (build a provider, call it, shape the response) generalized into an
//! explicit multi-stage state machine, since `handle_chat` is a single LLM
//! call rather than a composed STT->LLM->TTS turn.

pub mod history;
pub mod runner;
pub mod sanitize;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::backend::router::BackendRouter;
use crate::backend::{GenerateTextParams, SynthesizeParams};
use crate::error::GatewayError;
use crate::pipeline::history::SessionHistory;
use crate::telemetry::UsageLog;

/// `stage ∈ {receiving, stt, llm, tts, playing, done, failed, cancelled}`.
/// Transitions only move forward in this order, or directly to
/// `cancelled`/`failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Receiving,
    Stt,
    Llm,
    Tts,
    Playing,
    Done,
    Failed,
    Cancelled,
}

impl Stage {
    fn rank(self) -> u8 {
        match self {
            Stage::Receiving => 0,
            Stage::Stt => 1,
            Stage::Llm => 2,
            Stage::Tts => 3,
            Stage::Playing => 4,
            Stage::Done => 5,
            Stage::Failed => 6,
            Stage::Cancelled => 6,
        }
    }

    fn can_advance_to(self, next: Stage) -> bool {
        matches!(next, Stage::Failed | Stage::Cancelled) || next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageBackendUsed {
    pub stt: Option<String>,
    pub llm: Option<String>,
    pub tts: Option<String>,
}

/// `{session_id, started_at, stage, stage_started_at, transcript?, reply?,
/// audio_ref?, backend_used_per_stage, cancelled}`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSessionState {
    pub session_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub stage: Stage,
    pub stage_started_at: chrono::DateTime<chrono::Utc>,
    pub transcript: Option<String>,
    pub reply: Option<String>,
    pub audio_ref: Option<String>,
    pub backend_used: StageBackendUsed,
    pub cancelled: bool,
}

pub struct PipelineSession {
    state: RwLock<PipelineSessionState>,
    history: RwLock<SessionHistory>,
}

impl PipelineSession {
    fn new(session_id: String, history_len: usize) -> Self {
        let now = chrono::Utc::now();
        PipelineSession {
            state: RwLock::new(PipelineSessionState {
                session_id,
                started_at: now,
                stage: Stage::Receiving,
                stage_started_at: now,
                transcript: None,
                reply: None,
                audio_ref: None,
                backend_used: StageBackendUsed::default(),
                cancelled: false,
            }),
            history: RwLock::new(SessionHistory::new(history_len)),
        }
    }

    pub async fn snapshot(&self) -> PipelineSessionState {
        self.state.read().await.clone()
    }

    /// Request interruption. The owning task observes this at the next
    /// cooperative checkpoint and transitions to `cancelled`.
    pub async fn request_cancel(&self) {
        let mut state = self.state.write().await;
        state.cancelled = true;
    }

    async fn is_cancelled(&self) -> bool {
        self.state.read().await.cancelled
    }

    async fn transition(&self, next: Stage) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        if !state.stage.can_advance_to(next) {
            return Err(GatewayError::Internal(format!(
                "illegal pipeline transition {:?} -> {next:?}",
                state.stage
            )));
        }
        state.stage = next;
        state.stage_started_at = chrono::Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub session_id: String,
    pub text: Option<String>,
    pub audio: Option<Vec<u8>>,
    pub backend_used: StageBackendUsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Audio,
    Both,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub audio: Option<Vec<u8>>,
    pub text: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub system_prompt: Option<String>,
    pub session_id: Option<String>,
}

pub struct PipelineOrchestrator {
    router: Arc<BackendRouter>,
    usage_log: Arc<UsageLog>,
    sessions: RwLock<HashMap<String, Arc<PipelineSession>>>,
    history_len: usize,
    default_model: String,
    default_voice: String,
    min_transcript_chars: usize,
}

impl PipelineOrchestrator {
    pub fn new(
        router: Arc<BackendRouter>,
        usage_log: Arc<UsageLog>,
        history_len: usize,
        default_model: String,
        default_voice: String,
        min_transcript_chars: usize,
    ) -> Self {
        PipelineOrchestrator {
            router,
            usage_log,
            sessions: RwLock::new(HashMap::new()),
            history_len,
            default_model,
            default_voice,
            min_transcript_chars,
        }
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<PipelineSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Interrupt the active session: cancels any in-flight playback and
    /// transitions `stage -> cancelled`.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), GatewayError> {
        let session = self
            .session(session_id)
            .await
            .ok_or_else(|| GatewayError::Internal(format!("no active session {session_id}")))?;
        session.request_cancel().await;
        session.transition(Stage::Cancelled).await
    }

    pub async fn run_chat(
        &self,
        req: ChatRequest,
        format: OutputFormat,
    ) -> Result<PipelineResult, GatewayError> {
        let session_id = req.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(&session_id) {
                let existing_stage = existing.snapshot().await.stage;
                if !matches!(existing_stage, Stage::Done | Stage::Failed | Stage::Cancelled) {
                    return Err(GatewayError::InputInvalid(format!(
                        "session {session_id} already has an active pipeline"
                    )));
                }
            }
            sessions.insert(
                session_id.clone(),
                Arc::new(PipelineSession::new(session_id.clone(), self.history_len)),
            );
        }
        let session = self.session(&session_id).await.unwrap();

        let result = self.run_stages(&session, req, format).await;

        if session.is_cancelled().await {
            let _ = session.transition(Stage::Cancelled).await;
        }

        result
    }

    async fn run_stages(
        &self,
        session: &Arc<PipelineSession>,
        req: ChatRequest,
        format: OutputFormat,
    ) -> Result<PipelineResult, GatewayError> {
        let mut backend_used = StageBackendUsed::default();

        let transcript = if let Some(audio) = req.audio.as_ref() {
            session.transition(Stage::Stt).await?;
            if session.is_cancelled().await {
                return Err(GatewayError::Cancelled);
            }
            let (text, backend_id) = self.router.transcribe_audio(audio, None, req.model.as_deref()).await?;
            backend_used.stt = Some(backend_id);
            if text.trim().chars().count() < self.min_transcript_chars {
                session.transition(Stage::Failed).await?;
                return Err(GatewayError::InputEmpty("transcription produced no usable text".into()));
            }
            text
        } else {
            req.text.clone().ok_or_else(|| GatewayError::InputInvalid("no text or audio provided".into()))?
        };

        {
            let mut state = session.state.write().await;
            state.transcript = Some(transcript.clone());
        }

        session.transition(Stage::Llm).await?;
        if session.is_cancelled().await {
            return Err(GatewayError::Cancelled);
        }

        let prompt = self.build_prompt(session, &transcript).await;
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let (llm_out, llm_backend) = self
            .router
            .generate_text(&model, &prompt, req.system_prompt.as_deref(), &GenerateTextParams::default())
            .await?;
        backend_used.llm = Some(llm_backend);
        let reply = llm_out.text;

        {
            let mut hist = session.history.write().await;
            hist.push(transcript.clone(), reply.clone(), model.clone());
        }
        {
            let mut state = session.state.write().await;
            state.reply = Some(reply.clone());
        }

        let mut audio_bytes = None;
        if matches!(format, OutputFormat::Audio | OutputFormat::Both) {
            session.transition(Stage::Tts).await?;
            if session.is_cancelled().await {
                return Err(GatewayError::Cancelled);
            }
            let sanitized = sanitize::sanitize(&reply);
            let voice = req.voice.clone().unwrap_or_else(|| self.default_voice.clone());
            let (audio, tts_backend) = self
                .router
                .synthesize_speech(&sanitized, &voice, &SynthesizeParams::default())
                .await?;
            backend_used.tts = Some(tts_backend);
            audio_bytes = Some(audio);
        }

        session.transition(Stage::Done).await?;
        info!(session_id = %session.snapshot().await.session_id, "pipeline done");

        Ok(PipelineResult {
            session_id: session.snapshot().await.session_id,
            text: if matches!(format, OutputFormat::Text | OutputFormat::Both) {
                Some(reply)
            } else {
                None
            },
            audio: audio_bytes,
            backend_used,
        })
    }

    async fn build_prompt(&self, session: &Arc<PipelineSession>, transcript: &str) -> String {
        let hist = session.history.read().await;
        if hist.is_empty() {
            return transcript.to_string();
        }
        let mut prompt = String::new();
        for turn in hist.turns() {
            prompt.push_str(&format!("User: {}\nAssistant: {}\n", turn.user, turn.reply));
        }
        prompt.push_str(&format!("User: {transcript}\n"));
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::adapter::{BackendAdapter, GenerateTextOutput};
    use crate::backend::{BackendDescriptor, SelectionPolicy};
    use crate::capability::Capability;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct EchoLlm;

    #[async_trait]
    impl BackendAdapter for EchoLlm {
        fn id(&self) -> &str {
            "echo-llm"
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
            Ok(GenerateTextOutput {
                text: format!("you said: {prompt}"),
            })
        }
    }

    fn router() -> Arc<BackendRouter> {
        let mut policies = HashMap::new();
        policies.insert(
            Capability::GenerateText,
            SelectionPolicy::new(vec!["echo-llm".to_string()], true),
        );
        Arc::new(BackendRouter::new(
            vec![Arc::new(EchoLlm)],
            vec![BackendDescriptor::new("echo-llm", Capability::GenerateText, true, 1)],
            policies,
            Arc::new(UsageLog::in_memory()),
            Duration::from_secs(30),
            3,
        ))
    }

    #[tokio::test]
    async fn text_chat_returns_reply_and_backend_used() {
        let orchestrator = PipelineOrchestrator::new(
            router(),
            Arc::new(UsageLog::in_memory()),
            5,
            "m1".into(),
            "v1".into(),
            1,
        );
        let result = orchestrator
            .run_chat(
                ChatRequest {
                    text: Some("hello".into()),
                    ..Default::default()
                },
                OutputFormat::Text,
            )
            .await
            .unwrap();
        assert!(result.text.unwrap().contains("hello"));
        assert_eq!(result.backend_used.llm.as_deref(), Some("echo-llm"));
        assert!(result.backend_used.stt.is_none());
    }

    #[tokio::test]
    async fn rejects_reusing_an_active_session_id() {
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            router(),
            Arc::new(UsageLog::in_memory()),
            5,
            "m1".into(),
            "v1".into(),
            1,
        ));
        {
            let mut sessions = orchestrator.sessions.write().await;
            sessions.insert(
                "s1".to_string(),
                Arc::new(PipelineSession::new("s1".to_string(), 5)),
            );
        }
        let err = orchestrator
            .run_chat(
                ChatRequest {
                    text: Some("hi".into()),
                    session_id: Some("s1".into()),
                    ..Default::default()
                },
                OutputFormat::Text,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InputInvalid");
    }
}
