use serde::{Deserialize, Serialize};
use std::fmt;

/// What a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    GenerateText,
    TranscribeAudio,
    SynthesizeSpeech,
    SearchWeb,
    SearchScholarly,
    GenerateAudio,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::GenerateText => "generate_text",
            Capability::TranscribeAudio => "transcribe_audio",
            Capability::SynthesizeSpeech => "synthesize_speech",
            Capability::SearchWeb => "search_web",
            Capability::SearchScholarly => "search_scholarly",
            Capability::GenerateAudio => "generate_audio",
        }
    }

    pub const ALL: [Capability; 6] = [
        Capability::GenerateText,
        Capability::TranscribeAudio,
        Capability::SynthesizeSpeech,
        Capability::SearchWeb,
        Capability::SearchScholarly,
        Capability::GenerateAudio,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
