//! Shared helpers for validating an explicitly requested voice or model id
//! against what is actually known, so `/chat`, `/tts`, `/llm`, `/workflow/research`
//! and the compatibility shims can all reject an unknown one the same way.

use std::collections::HashSet;
use std::path::Path;

use cogs_gateway::GatewayError;

use crate::state::AppState;

/// A voice is a blob file (`<name>.bin`) plus a JSON sidecar
/// (`<name>.json`); only pairs with both present count as registered.
pub async fn known_voice_names(voice_dir: &Path) -> HashSet<String> {
    let mut names = HashSet::new();
    let Ok(mut entries) = tokio::fs::read_dir(voice_dir).await else {
        return names;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("bin") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let sidecar = voice_dir.join(format!("{stem}.json"));
        if tokio::fs::metadata(&sidecar).await.is_ok() {
            names.insert(stem.to_string());
        }
    }
    names
}

/// Rejects `voice` with `VoiceNotFound` only when the voice directory has
/// at least one registered voice and `voice` isn't among them. An empty
/// directory means nothing is registered yet, not that every id is invalid.
pub async fn validate_voice(state: &AppState, voice: &str) -> Result<(), GatewayError> {
    let known = known_voice_names(&state.config.voice_dir).await;
    if known.is_empty() || known.contains(voice) {
        Ok(())
    } else {
        Err(GatewayError::VoiceNotFound(voice.to_string()))
    }
}

/// Rejects `model` with `ModelNotFound` only when at least one backend
/// reports a non-empty model inventory and `model` isn't in it.
pub async fn validate_model(state: &AppState, model: &str) -> Result<(), GatewayError> {
    if state.router.model_known(model).await {
        Ok(())
    } else {
        Err(GatewayError::ModelNotFound(model.to_string()))
    }
}
