//! Conversation state as seen by the client.

use crate::session::protocol::ServerEvent;
use std::fmt;

/// Where the conversation is.
///
/// `Disconnected` is the start and terminal state; `Error` can be entered from
/// any state and is left again by the next server event that implies a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceState {
    Disconnected,
    Connecting,
    /// Session ready, waiting for the user.
    Idle,
    /// The server is receiving the user's speech.
    Listening,
    /// The bot is working on a reply.
    Thinking,
    /// The bot's reply is playing.
    Speaking,
    Error,
}

impl VoiceState {
    /// State implied by a server event, or `None` if the event leaves it unchanged.
    ///
    /// Events are never rejected for arriving out of order.
    pub fn after(event: &ServerEvent) -> Option<VoiceState> {
        match event {
            ServerEvent::SessionReady(_) | ServerEvent::TurnComplete(_) => Some(VoiceState::Idle),
            ServerEvent::Transcribing => Some(VoiceState::Listening),
            ServerEvent::Transcript(_)
            | ServerEvent::Thinking
            | ServerEvent::ToolStart(_)
            | ServerEvent::ToolEnd(_) => Some(VoiceState::Thinking),
            ServerEvent::AudioStart(_) => Some(VoiceState::Speaking),
            ServerEvent::Error(_) => Some(VoiceState::Error),
            ServerEvent::AudioEnd | ServerEvent::Unknown { .. } => None,
        }
    }

    /// The session is established and exchanging turns.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            VoiceState::Idle | VoiceState::Listening | VoiceState::Thinking | VoiceState::Speaking
        )
    }
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VoiceState::Disconnected => "disconnected",
            VoiceState::Connecting => "connecting",
            VoiceState::Idle => "idle",
            VoiceState::Listening => "listening",
            VoiceState::Thinking => "thinking",
            VoiceState::Speaking => "speaking",
            VoiceState::Error => "error",
        };
        f.write_str(label)
    }
}
