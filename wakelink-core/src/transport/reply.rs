//! Parsing of the service's upload response.
//!
//! The body is expected to be a JSON object with optional `stt_text`,
//! `ai_reply` and `tts_saved` fields. Anything else (truncated JSON, plain
//! text, an empty body) degrades to an empty reply rather than an error.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReply {
    /// Transcript of the uploaded utterance.
    #[serde(default)]
    pub stt_text: Option<String>,
    /// Assistant reply text. JSON escapes (`\n`, `\uXXXX`) are decoded.
    #[serde(default)]
    pub ai_reply: Option<String>,
    /// Synthesised audio for the reply is available for download.
    #[serde(default)]
    pub tts_saved: Option<bool>,
}

impl ServiceReply {
    pub fn parse(body: &str) -> Self {
        let trimmed = body.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if trimmed.is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Self>(trimmed) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, len = trimmed.len(), "unparseable service reply");
                Self::default()
            }
        }
    }

    pub fn tts_available(&self) -> bool {
        self.tts_saved.unwrap_or(false)
    }

    /// Non-empty lines of the reply text.
    pub fn reply_lines(&self) -> impl Iterator<Item = &str> {
        self.ai_reply
            .as_deref()
            .unwrap_or_default()
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
    }
}
