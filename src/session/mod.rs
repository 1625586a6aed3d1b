//! Protocol session: wire messages, conversation state and the client that
//! drives them.

pub mod client;
pub mod protocol;
pub mod state;

pub use client::{ConnectParams, VoiceClient, VoiceClientConfig, VoiceSession};
pub use protocol::{
    AudioStart, ClientMessage, ServerError, ServerEvent, SessionReady, ToolActivity, Transcript,
    TurnComplete, VoiceSettings, VoiceSettingsUpdate, VoiceStartPayload,
};
pub use state::VoiceState;
