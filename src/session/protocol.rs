//! Wire protocol of the voice channel.
//!
//! Every text frame is a JSON object `{"type": ..., "payload": {...}}`.
//! Binary frames carry audio and are not described here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Voice settings for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub voice: String,
    pub speed: f32,
    pub language: String,
    pub allow_interruptions: bool,
    pub save_transcripts: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            speed: 1.0,
            language: "en".to_string(),
            allow_interruptions: true,
            save_transcripts: true,
        }
    }
}

/// Partial change to [`VoiceSettings`]; only set fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_interruptions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_transcripts: Option<bool>,
}

impl VoiceSettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge the set fields into `settings`.
    pub fn apply_to(&self, settings: &mut VoiceSettings) {
        if let Some(voice) = &self.voice {
            settings.voice = voice.clone();
        }
        if let Some(speed) = self.speed {
            settings.speed = speed;
        }
        if let Some(language) = &self.language {
            settings.language = language.clone();
        }
        if let Some(allow) = self.allow_interruptions {
            settings.allow_interruptions = allow;
        }
        if let Some(save) = self.save_transcripts {
            settings.save_transcripts = save;
        }
    }
}

/// Payload of `voice_start`, sent on every channel open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceStartPayload {
    pub bot_id: String,
    /// Conversation to continue; `null` starts a new one.
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Model id per role, e.g. `{"llm": "...", "tts": "..."}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_configs: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_settings: Option<VoiceSettings>,
}

/// Control messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    VoiceStart(VoiceStartPayload),
    EndTurn {},
    Interrupt {},
    Mute {},
    Unmute {},
    ConfigUpdate(VoiceSettingsUpdate),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionReady {
    pub session_id: Option<String>,
    pub chat_id: Option<String>,
}

/// Recognized user speech (or the bot's text, depending on `role`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Transcript {
    pub text: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolActivity {
    #[serde(alias = "tool")]
    pub name: String,
    pub input: Option<Value>,
    pub result: Option<Value>,
}

/// Announces synthesized speech; binary frames follow.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AudioStart {
    /// Rate of the PCM that follows, if it differs from the default.
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TurnComplete {
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerError {
    pub message: String,
    pub code: Option<String>,
}

impl Default for ServerError {
    fn default() -> Self {
        Self {
            message: "unknown server error".to_string(),
            code: None,
        }
    }
}

/// Control messages received from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Envelope")]
pub enum ServerEvent {
    SessionReady(SessionReady),
    Transcribing,
    Transcript(Transcript),
    Thinking,
    ToolStart(ToolActivity),
    ToolEnd(ToolActivity),
    AudioStart(AudioStart),
    AudioEnd,
    TurnComplete(TurnComplete),
    Error(ServerError),
    /// A type this client does not know; passed through untouched.
    Unknown { kind: String, payload: Value },
}

impl ServerEvent {
    /// The wire `type` of the event.
    pub fn kind(&self) -> &str {
        match self {
            ServerEvent::SessionReady(_) => "session_ready",
            ServerEvent::Transcribing => "transcribing",
            ServerEvent::Transcript(_) => "transcript",
            ServerEvent::Thinking => "thinking",
            ServerEvent::ToolStart(_) => "tool_start",
            ServerEvent::ToolEnd(_) => "tool_end",
            ServerEvent::AudioStart(_) => "audio_start",
            ServerEvent::AudioEnd => "audio_end",
            ServerEvent::TurnComplete(_) => "turn_complete",
            ServerEvent::Error(_) => "error",
            ServerEvent::Unknown { kind, .. } => kind,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl TryFrom<Envelope> for ServerEvent {
    type Error = serde_json::Error;

    fn try_from(envelope: Envelope) -> Result<Self, serde_json::Error> {
        fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
            match value {
                Value::Null => serde_json::from_value(Value::Object(Map::new())),
                other => serde_json::from_value(other),
            }
        }

        Ok(match envelope.kind.as_str() {
            "session_ready" => ServerEvent::SessionReady(payload(envelope.payload)?),
            "transcribing" => ServerEvent::Transcribing,
            "transcript" => ServerEvent::Transcript(payload(envelope.payload)?),
            "thinking" => ServerEvent::Thinking,
            "tool_start" => ServerEvent::ToolStart(payload(envelope.payload)?),
            "tool_end" => ServerEvent::ToolEnd(payload(envelope.payload)?),
            "audio_start" => ServerEvent::AudioStart(payload(envelope.payload)?),
            "audio_end" => ServerEvent::AudioEnd,
            "turn_complete" => ServerEvent::TurnComplete(payload(envelope.payload)?),
            "error" => ServerEvent::Error(payload(envelope.payload)?),
            _ => ServerEvent::Unknown {
                kind: envelope.kind,
                payload: envelope.payload,
            },
        })
    }
}
