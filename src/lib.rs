//! voicelink - Real-time voice channel client for conversational bots
//!
//! Streams the microphone to a voice endpoint over a duplex channel, plays
//! the bot's synthesized speech back gaplessly and detects the end of the
//! user's turn locally.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod channel;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod session;
pub mod sync;

// Composition root - needs devices and the CLI
#[cfg(all(feature = "cpal-audio", feature = "cli"))]
pub mod app;

// Capability seams (host audio and transport)
pub use audio::output::{AudioOutput, VirtualOutput};
pub use audio::pipeline::{FrameSink, SourceFactory};
pub use audio::recorder::{AudioSource, MockAudioSource};
pub use channel::{Connector, CredentialProvider, EnvCredentials, StaticCredentials};

// Components
pub use audio::pipeline::{CapturePipeline, PipelineConfig};
pub use audio::playback::PlaybackScheduler;
pub use audio::vad::{VadConfig, VadMonitor, VoiceActivityDetector};
pub use channel::{ChannelConfig, ChannelManager, ConnectionState, DisconnectInfo};

// Session
pub use session::{
    ClientMessage, ConnectParams, ServerEvent, VoiceClient, VoiceClientConfig, VoiceSession,
    VoiceSettings, VoiceSettingsUpdate, VoiceState,
};

// Error handling
pub use error::{Result, SharedError, VoiceLinkError};

// Events
pub use events::{Registry, Subscription};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
