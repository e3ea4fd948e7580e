//! Client wire protocol: JSON envelopes `{"type": ..., "payload": {...}}`.

use crate::affect::{EmotionLabel, EmotionState, Intensity};
use crate::live::gemini::INPUT_AUDIO_MIME;
use serde::{Deserialize, Serialize};

fn default_input_mime() -> String {
    INPUT_AUDIO_MIME.to_string()
}

/// Frames the client may send. `auth` must come first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        device_id: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        character_id: Option<String>,
    },
    Audio {
        /// Base64 PCM
        data: String,
        #[serde(default = "default_input_mime")]
        mime_type: String,
    },
    Text {
        text: String,
    },
    Control {
        action: ControlAction,
    },
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    EndSession,
    #[serde(other)]
    Unknown,
}

/// Emotion fields stamped onto every spoken or written AI output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionStamp {
    pub emotion: EmotionLabel,
    pub valence: f64,
    pub arousal: f64,
    pub intensity: Intensity,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl From<&EmotionState> for EmotionStamp {
    fn from(state: &EmotionState) -> Self {
        Self {
            emotion: state.label,
            valence: round3(state.valence),
            arousal: round3(state.arousal),
            intensity: state.intensity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusAction {
    Searching,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalTool {
    RecallMemory,
    SearchWeb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    CharacterNotFound,
    Timeout,
    UpstreamDisconnected,
    Internal,
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk {
        user_id: String,
        session_id: String,
    },
    Audio {
        data: String,
        mime_type: String,
        #[serde(flatten)]
        stamp: EmotionStamp,
    },
    Text {
        text: String,
        #[serde(flatten)]
        stamp: EmotionStamp,
    },
    Interrupted {},
    TurnComplete {},
    Status {
        action: StatusAction,
        tool: RetrievalTool,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // every variant is a plain struct of strings, numbers and enums
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","payload":{"code":"INTERNAL","message":"encode failed"}}"#.to_string()
        })
    }
}
