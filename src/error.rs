//! Error types for voicelink.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceLinkError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Channel errors
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Channel connection failed: {message}")]
    ChannelConnection { message: String },

    #[error("Channel closed: {reason}")]
    ChannelClosed { reason: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Audio capture errors
    #[error("Microphone access denied: {message}")]
    MicrophoneAccess { message: String },

    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio encoding failed: {message}")]
    Encoding { message: String },

    // Playback errors
    #[error("Audio output failed: {message}")]
    AudioOutput { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoiceLinkError {
    /// Whether the error ends the current attempt without any automatic retry.
    ///
    /// Transport hiccups are recovered by the reconnect loop; everything the
    /// user has to act on (credentials, microphone access) is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceLinkError::Authentication { .. }
                | VoiceLinkError::MicrophoneAccess { .. }
                | VoiceLinkError::AudioDeviceNotFound { .. }
                | VoiceLinkError::ConfigFileNotFound { .. }
                | VoiceLinkError::ConfigInvalidValue { .. }
                | VoiceLinkError::Config(_)
        )
    }
}

impl VoiceLinkError {
    /// A copy for publishing to subscribers while the original is returned.
    ///
    /// Wrapped library errors are not `Clone`, so they degrade to `Other`
    /// with the same message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::ConfigFileNotFound { path } => Self::ConfigFileNotFound { path: path.clone() },
            Self::ConfigInvalidValue { key, message } => Self::ConfigInvalidValue {
                key: key.clone(),
                message: message.clone(),
            },
            Self::Authentication { message } => Self::Authentication {
                message: message.clone(),
            },
            Self::ChannelConnection { message } => Self::ChannelConnection {
                message: message.clone(),
            },
            Self::ChannelClosed { reason } => Self::ChannelClosed {
                reason: reason.clone(),
            },
            Self::Protocol { message } => Self::Protocol {
                message: message.clone(),
            },
            Self::MicrophoneAccess { message } => Self::MicrophoneAccess {
                message: message.clone(),
            },
            Self::AudioDeviceNotFound { device } => Self::AudioDeviceNotFound {
                device: device.clone(),
            },
            Self::AudioCapture { message } => Self::AudioCapture {
                message: message.clone(),
            },
            Self::Encoding { message } => Self::Encoding {
                message: message.clone(),
            },
            Self::AudioOutput { message } => Self::AudioOutput {
                message: message.clone(),
            },
            Self::Other(message) => Self::Other(message.clone()),
            Self::Config(_) | Self::Io(_) | Self::Json(_) => Self::Other(self.to_string()),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoiceLinkError>;

/// Error as delivered to subscribers; errors are not `Clone`.
pub type SharedError = std::sync::Arc<VoiceLinkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_file_not_found_display() {
        let error = VoiceLinkError::ConfigFileNotFound {
            path: "/path/to/config.toml".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Configuration file not found at /path/to/config.toml"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = VoiceLinkError::ConfigInvalidValue {
            key: "reconnect.max_attempts".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for reconnect.max_attempts: must be positive"
        );
    }

    #[test]
    fn test_authentication_display() {
        let error = VoiceLinkError::Authentication {
            message: "no bearer token".to_string(),
        };
        assert_eq!(error.to_string(), "Authentication failed: no bearer token");
    }

    #[test]
    fn test_channel_connection_display() {
        let error = VoiceLinkError::ChannelConnection {
            message: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Channel connection failed: connection refused"
        );
    }

    #[test]
    fn test_microphone_access_display() {
        let error = VoiceLinkError::MicrophoneAccess {
            message: "permission denied".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Microphone access denied: permission denied"
        );
    }

    #[test]
    fn test_audio_device_not_found_display() {
        let error = VoiceLinkError::AudioDeviceNotFound {
            device: "default".to_string(),
        };
        assert_eq!(error.to_string(), "Audio device not found: default");
    }

    #[test]
    fn test_audio_output_display() {
        let error = VoiceLinkError::AudioOutput {
            message: "stream underrun".to_string(),
        };
        assert_eq!(error.to_string(), "Audio output failed: stream underrun");
    }

    #[test]
    fn test_other_display() {
        let error = VoiceLinkError::Other("unexpected error".to_string());
        assert_eq!(error.to_string(), "unexpected error");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VoiceLinkError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_str = "invalid = toml = syntax";
        let toml_error = toml::from_str::<toml::Value>(toml_str).unwrap_err();
        let error: VoiceLinkError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: VoiceLinkError = json_error.into();
        assert!(error.to_string().starts_with("JSON error"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(
            VoiceLinkError::Authentication {
                message: String::new()
            }
            .is_fatal()
        );
        assert!(
            VoiceLinkError::MicrophoneAccess {
                message: String::new()
            }
            .is_fatal()
        );
        assert!(
            !VoiceLinkError::ChannelConnection {
                message: String::new()
            }
            .is_fatal()
        );
        assert!(
            !VoiceLinkError::ChannelClosed {
                reason: String::new()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: VoiceLinkError = io_error.into();

        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VoiceLinkError>();
        assert_sync::<VoiceLinkError>();
    }

    #[test]
    fn test_duplicate_keeps_variant_and_message() {
        let original = VoiceLinkError::MicrophoneAccess {
            message: "denied".to_string(),
        };
        match original.duplicate() {
            VoiceLinkError::MicrophoneAccess { message } => assert_eq!(message, "denied"),
            other => panic!("Expected MicrophoneAccess, got: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_of_wrapped_error_keeps_message() {
        let original: VoiceLinkError = io::Error::other("disk gone").into();
        let copy = original.duplicate();
        assert!(matches!(copy, VoiceLinkError::Other(_)));
        assert_eq!(copy.to_string(), original.to_string());
    }
}
