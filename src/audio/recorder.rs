use crate::defaults;
use crate::error::{Result, VoiceLinkError};

/// Processing requested from the capture device.
///
/// Hosts that cannot honour a constraint ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Trait for audio source devices.
///
/// This trait allows swapping implementations (real audio device vs mock).
pub trait AudioSource: Send + Sync {
    /// Start capturing audio from the source.
    ///
    /// # Errors
    /// Returns `VoiceLinkError::MicrophoneAccess` if the device refuses to open.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio from the source.
    fn stop(&mut self) -> Result<()>;

    /// Samples captured since the last read, as 16-bit mono PCM at [`sample_rate`](Self::sample_rate).
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Enable or disable the track. A disabled source keeps running but yields silence.
    fn set_enabled(&mut self, enabled: bool);

    fn sample_rate(&self) -> u32;
}

/// Configuration for audio source initialization
#[derive(Debug, Clone)]
pub struct AudioSourceConfig {
    pub sample_rate: u32,
    pub device: Option<String>,
    pub constraints: CaptureConstraints,
}

impl Default for AudioSourceConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            device: None,
            constraints: CaptureConstraints::default(),
        }
    }
}

/// Mock audio source for testing
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    is_started: bool,
    enabled: bool,
    samples: Vec<i16>,
    sample_rate: u32,
    should_fail_start: bool,
    /// Successful reads left before every read fails.
    reads_before_failure: Option<usize>,
    error_message: String,
}

impl MockAudioSource {
    /// Create a new mock audio source with default settings
    pub fn new() -> Self {
        Self {
            is_started: false,
            enabled: true,
            samples: vec![0i16; 160],
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            should_fail_start: false,
            reads_before_failure: None,
            error_message: "mock audio error".to_string(),
        }
    }

    /// Configure the mock to return specific samples on every read
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Configure the mock to fail on start, as if permission was denied
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on read
    pub fn with_read_failure(self) -> Self {
        self.with_read_failure_after(0)
    }

    /// Succeed for `reads` reads, then fail every read, like a device that
    /// disappears mid-session.
    pub fn with_read_failure_after(mut self, reads: usize) -> Self {
        self.reads_before_failure = Some(reads);
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Check if the audio source is started
    pub fn is_started(&self) -> bool {
        self.is_started
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            Err(VoiceLinkError::MicrophoneAccess {
                message: self.error_message.clone(),
            })
        } else {
            self.is_started = true;
            Ok(())
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if let Some(remaining) = self.reads_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(VoiceLinkError::AudioCapture {
                    message: self.error_message.clone(),
                });
            }
            *remaining -= 1;
        }
        if !self.is_started {
            return Ok(Vec::new());
        }
        if self.enabled {
            Ok(self.samples.clone())
        } else {
            Ok(vec![0i16; self.samples.len()])
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_audio_source_returns_configured_samples() {
        let test_samples = vec![100i16, 200, 300, 400, 500];
        let mut source = MockAudioSource::new().with_samples(test_samples.clone());
        source.start().unwrap();

        assert_eq!(source.read_samples().unwrap(), test_samples);
        assert_eq!(source.read_samples().unwrap(), test_samples);
    }

    #[test]
    fn test_mock_audio_source_silent_until_started() {
        let mut source = MockAudioSource::new().with_samples(vec![7i16; 10]);
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_source_yields_silence() {
        let mut source = MockAudioSource::new().with_samples(vec![900i16; 4]);
        source.start().unwrap();
        source.set_enabled(false);

        assert!(!source.is_enabled());
        assert_eq!(source.read_samples().unwrap(), vec![0i16; 4]);

        source.set_enabled(true);
        assert_eq!(source.read_samples().unwrap(), vec![900i16; 4]);
    }

    #[test]
    fn test_start_failure_is_microphone_access_error() {
        let mut source = MockAudioSource::new()
            .with_start_failure()
            .with_error_message("permission denied");

        let result = source.start();

        assert!(!source.is_started());
        match result {
            Err(VoiceLinkError::MicrophoneAccess { message }) => {
                assert_eq!(message, "permission denied");
            }
            _ => panic!("Expected MicrophoneAccess error"),
        }
    }

    #[test]
    fn test_read_failure() {
        let mut source = MockAudioSource::new().with_read_failure();
        match source.read_samples() {
            Err(VoiceLinkError::AudioCapture { message }) => {
                assert_eq!(message, "mock audio error");
            }
            _ => panic!("Expected AudioCapture error"),
        }
    }

    #[test]
    fn test_read_failure_after_successful_reads() {
        let mut source = MockAudioSource::new()
            .with_samples(vec![5i16; 4])
            .with_read_failure_after(2);
        source.start().unwrap();

        assert_eq!(source.read_samples().unwrap(), vec![5i16; 4]);
        assert_eq!(source.read_samples().unwrap(), vec![5i16; 4]);
        assert!(matches!(
            source.read_samples(),
            Err(VoiceLinkError::AudioCapture { .. })
        ));
        assert!(source.read_samples().is_err());
    }

    #[test]
    fn test_start_stop_multiple_times() {
        let mut source = MockAudioSource::new();
        for _ in 0..3 {
            assert!(source.start().is_ok());
            assert!(source.is_started());
            assert!(source.stop().is_ok());
            assert!(!source.is_started());
        }
    }

    #[test]
    fn test_default_constraints_enable_all_processing() {
        let constraints = CaptureConstraints::default();
        assert!(constraints.echo_cancellation);
        assert!(constraints.noise_suppression);
        assert!(constraints.auto_gain_control);
        assert_eq!(AudioSourceConfig::default().sample_rate, 16000);
    }

    #[test]
    fn test_audio_source_trait_is_object_safe() {
        let mut source: Box<dyn AudioSource> = Box::new(
            MockAudioSource::new()
                .with_samples(vec![1i16, 2, 3])
                .with_sample_rate(48000),
        );
        source.start().unwrap();
        assert_eq!(source.read_samples().unwrap(), vec![1i16, 2, 3]);
        assert_eq!(source.sample_rate(), 48000);
        source.stop().unwrap();
    }
}
