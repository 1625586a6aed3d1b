//! Default configuration constants for voicelink.
//!
//! Shared by the config types and the components that fall back to them
//! when constructed without a config.

use std::time::Duration;

/// Microphone capture sample rate in Hz.
///
/// 16kHz mono is what the voice endpoint expects for recognition.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Sample rate of synthesized speech sent by the server, in Hz.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Duration of one outbound capture frame in milliseconds.
pub const FRAME_DURATION_MS: u32 = 100;

/// Voice Activity Detection (VAD) threshold.
///
/// RMS level (0.0 to 1.0) above which the user is considered to be speaking.
pub const VAD_THRESHOLD: f32 = 0.02;

/// Silence hold-off in milliseconds before the user's turn is considered over.
///
/// 1500ms allows for natural pauses in speech without cutting the user off.
pub const SILENCE_DURATION_MS: u32 = 1500;

/// Interval between VAD samples of the analysis tap, in milliseconds.
pub const VAD_TICK_MS: u64 = 100;

/// Number of most recent samples the analysis tap retains.
pub const ANALYSIS_WINDOW: usize = 2048;

/// Maximum automatic reconnect attempts after an unintentional close.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base reconnect delay; attempt `k` waits `base * 2^(k-1)`.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Server origin used when none is configured.
pub const DEFAULT_ORIGIN: &str = "http://localhost:8000";

/// Path of the voice endpoint, appended to the origin.
pub const VOICE_ENDPOINT_PATH: &str = "/api/v1/voice/ws";

/// Query parameter carrying the bearer credential during the handshake.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Environment variable read for the bearer token by default.
pub const TOKEN_ENV_VAR: &str = "VOICELINK_TOKEN";

/// Number of samples in one capture frame at the given rate.
pub fn frame_samples(sample_rate: u32) -> usize {
    (sample_rate as usize * FRAME_DURATION_MS as usize) / 1000
}
