use crate::audio::encoder::Codec;
use crate::audio::pipeline::PipelineConfig;
use crate::audio::recorder::CaptureConstraints;
use crate::audio::vad::VadConfig;
use crate::channel::{ChannelConfig, EnvCredentials, ReconnectPolicy};
use crate::defaults;
use crate::error::VoiceLinkError;
use crate::session::{VoiceClientConfig, VoiceSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
    pub reconnect: ReconnectConfig,
    pub voice: VoiceSettings,
}

/// Voice server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub origin: String,
    pub endpoint_path: String,
    /// Environment variable holding the bearer token.
    pub token_env: String,
    /// Bot to talk to when none is given on the command line.
    pub bot_id: Option<String>,
}

/// Microphone capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub codec: Codec,
    pub vad_threshold: f32,
    pub silence_duration_ms: u32,
    /// Send `end_turn` automatically when the VAD detects silence.
    pub auto_end_turn: bool,
}

/// Speaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub device: Option<String>,
    /// Rate of the speech the server sends.
    pub sample_rate: u32,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            origin: defaults::DEFAULT_ORIGIN.to_string(),
            endpoint_path: defaults::VOICE_ENDPOINT_PATH.to_string(),
            token_env: defaults::TOKEN_ENV_VAR.to_string(),
            bot_id: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            codec: Codec::default(),
            vad_threshold: defaults::VAD_THRESHOLD,
            silence_duration_ms: defaults::SILENCE_DURATION_MS,
            auto_end_turn: true,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::PLAYBACK_SAMPLE_RATE,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
            base_delay_ms: defaults::RECONNECT_BASE_DELAY.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields will use default values.
    ///
    /// # Errors
    /// - `VoiceLinkError::ConfigFileNotFound` if the file does not exist
    /// - `VoiceLinkError::Config` for invalid TOML
    /// - `VoiceLinkError::ConfigInvalidValue` for out-of-range values
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VoiceLinkError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
            Err(e) => return Err(VoiceLinkError::Io(e).into()),
        };
        let config: Config = toml::from_str(&contents).map_err(VoiceLinkError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file falls back to defaults; invalid files are errors.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if matches!(
                    e.downcast_ref::<VoiceLinkError>(),
                    Some(VoiceLinkError::ConfigFileNotFound { .. })
                ) =>
            {
                tracing::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOICELINK_ORIGIN → server.origin
    /// - VOICELINK_TOKEN_ENV → server.token_env
    /// - VOICELINK_AUDIO_DEVICE → audio.device
    /// - VOICELINK_VOICE → voice.voice
    /// - VOICELINK_LANGUAGE → voice.language
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(origin) = non_empty_env("VOICELINK_ORIGIN") {
            self.server.origin = origin;
        }

        if let Some(token_env) = non_empty_env("VOICELINK_TOKEN_ENV") {
            self.server.token_env = token_env;
        }

        if let Some(device) = non_empty_env("VOICELINK_AUDIO_DEVICE") {
            self.audio.device = Some(device);
        }

        if let Some(voice) = non_empty_env("VOICELINK_VOICE") {
            self.voice.voice = voice;
        }

        if let Some(language) = non_empty_env("VOICELINK_LANGUAGE") {
            self.voice.language = language;
        }

        self
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        fn invalid(key: &str, message: &str) -> crate::error::Result<()> {
            Err(VoiceLinkError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        }

        if self.audio.sample_rate == 0 {
            return invalid("audio.sample_rate", "must be positive");
        }
        if self.playback.sample_rate == 0 {
            return invalid("playback.sample_rate", "must be positive");
        }
        if !(0.0..=1.0).contains(&self.audio.vad_threshold) {
            return invalid("audio.vad_threshold", "must be between 0.0 and 1.0");
        }
        if self.voice.speed.is_nan() || self.voice.speed <= 0.0 {
            return invalid("voice.speed", "must be positive");
        }
        if self.server.token_env.trim().is_empty() {
            return invalid("server.token_env", "must not be empty");
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voicelink/config.toml on Linux
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(dir.join("voicelink").join("config.toml"))
    }

    /// Serialize to TOML, as written by `config init`.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Client configuration derived from this file.
    pub fn client_config(&self) -> VoiceClientConfig {
        VoiceClientConfig {
            channel: ChannelConfig {
                origin: self.server.origin.clone(),
                endpoint_path: self.server.endpoint_path.clone(),
                reconnect: ReconnectPolicy {
                    max_attempts: self.reconnect.max_attempts,
                    base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                },
            },
            pipeline: PipelineConfig {
                sample_rate: self.audio.sample_rate,
                codec: self.audio.codec,
                constraints: CaptureConstraints::default(),
                ..PipelineConfig::default()
            },
            vad: VadConfig {
                threshold: self.audio.vad_threshold,
                hold_off: Duration::from_millis(self.audio.silence_duration_ms as u64),
                ..VadConfig::default()
            },
            playback_rate: self.playback.sample_rate,
            auto_end_turn: self.audio.auto_end_turn,
        }
    }

    pub fn credentials(&self) -> EnvCredentials {
        EnvCredentials::new(self.server.token_env.clone())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}
