//! Microphone capture and speaker output using CPAL (Cross-Platform Audio Library).

use crate::audio::convert::{StreamResampler, downmix_i16, f32_to_i16};
use crate::audio::recorder::{AudioSource, AudioSourceConfig, CaptureConstraints};
use crate::error::{Result, VoiceLinkError};
use crate::sync::lock;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Suppress noisy JACK/ALSA messages that occur during audio backend probing.
///
/// # Safety
/// Modifies environment variables; call at startup before spawning threads.
pub fn suppress_audio_warnings() {
    // SAFETY: Called at startup before any threads are spawned
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        std::env::set_var("ALSA_DEBUG", "0");
        std::env::set_var("PW_LOG", "0");
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
///
/// Those servers apply echo cancellation and noise suppression when the
/// session is configured for it, which raw ALSA devices never do.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for a voice conversation.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// Which side of the audio path a device listing is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
}

/// List usable devices, marking preferred ones with "\[recommended\]".
///
/// # Errors
/// Returns `VoiceLinkError::AudioCapture` if device enumeration fails.
pub fn list_devices(kind: DeviceKind) -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = match kind {
            DeviceKind::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
            DeviceKind::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
        };
        devices.map_err(|e| VoiceLinkError::AudioCapture {
            message: format!("Failed to enumerate devices: {}", e),
        })
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Find a device by exact name, or the best default for `kind`.
///
/// # Errors
/// Returns `VoiceLinkError::AudioDeviceNotFound` if nothing matches.
pub(crate) fn find_device(kind: DeviceKind, device_name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices: Vec<cpal::Device> = match kind {
            DeviceKind::Input => host.input_devices().map(|d| d.collect()),
            DeviceKind::Output => host.output_devices().map(|d| d.collect()),
        }
        .unwrap_or_default();

        if let Some(name) = device_name {
            return devices
                .into_iter()
                .find(|dev| dev.name().is_ok_and(|n| n == name))
                .ok_or_else(|| VoiceLinkError::AudioDeviceNotFound {
                    device: name.to_string(),
                });
        }

        if let Some(device) = devices
            .into_iter()
            .find(|dev| dev.name().is_ok_and(|n| is_preferred_device(&n)))
        {
            return Ok(device);
        }

        match kind {
            DeviceKind::Input => host.default_input_device(),
            DeviceKind::Output => host.default_output_device(),
        }
        .ok_or_else(|| VoiceLinkError::AudioDeviceNotFound {
            device: "default".to_string(),
        })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through the owning Mutex, one thread at a time.
pub(crate) struct SendableStream(pub(crate) cpal::Stream);

unsafe impl Send for SendableStream {}

/// Shared between the CPAL callback and the reader.
struct CaptureShared {
    buffer: Mutex<Vec<i16>>,
    enabled: AtomicBool,
    callbacks: AtomicU64,
}

impl CaptureShared {
    fn append(&self, samples: &[i16]) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
        let mut buffer = lock(&self.buffer);
        if self.enabled.load(Ordering::Relaxed) {
            buffer.extend_from_slice(samples);
        } else {
            buffer.resize(buffer.len() + samples.len(), 0);
        }
    }
}

/// Microphone capture through CPAL.
///
/// Delivers 16-bit mono PCM at the configured rate. Tries the preferred
/// format first (i16, then f32, at the target rate and mono), then falls back
/// to the device's native config with software down-mix and resampling.
pub struct CpalAudioSource {
    device: cpal::Device,
    stream: Mutex<Option<SendableStream>>,
    shared: Arc<CaptureShared>,
    sample_rate: u32,
    constraints: CaptureConstraints,
}

impl CpalAudioSource {
    /// Open the named input device, or the best default.
    ///
    /// # Errors
    /// Returns `VoiceLinkError::AudioDeviceNotFound` if the device does not exist.
    pub fn new(config: &AudioSourceConfig) -> Result<Self> {
        let device = find_device(DeviceKind::Input, config.device.as_deref())?;
        Ok(Self {
            device,
            stream: Mutex::new(None),
            shared: Arc::new(CaptureShared {
                buffer: Mutex::new(Vec::new()),
                enabled: AtomicBool::new(true),
                callbacks: AtomicU64::new(0),
            }),
            sample_rate: config.sample_rate,
            constraints: config.constraints,
        })
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::clone(&self.shared);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| shared.append(data),
            |err| tracing::warn!("Audio input stream error: {}", err),
            None,
        ) {
            return Ok(stream);
        }

        let shared = Arc::clone(&self.shared);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                shared.append(&converted);
            },
            |err| tracing::warn!("Audio input stream error: {}", err),
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Capture at the device's native config and convert in software.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| VoiceLinkError::MicrophoneAccess {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            "Using native capture format ({}ch/{}Hz/{:?}), converting in software",
            native_channels,
            native_rate,
            default_config.sample_format(),
        );

        let shared = Arc::clone(&self.shared);
        let mut resampler = StreamResampler::new(native_rate, target_rate);
        let mut convert = move |samples: &[i16]| {
            let mono = downmix_i16(samples, native_channels);
            shared.append(&resampler.process_i16(&mono));
        };

        let stream = match default_config.sample_format() {
            SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| convert(data),
                |err| tracing::warn!("Audio input stream error: {}", err),
                None,
            ),
            SampleFormat::F32 => self.device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                    convert(&converted);
                },
                |err| tracing::warn!("Audio input stream error: {}", err),
                None,
            ),
            fmt => {
                return Err(VoiceLinkError::AudioCapture {
                    message: format!(
                        "Unsupported native sample format: {:?}. Try another device.",
                        fmt
                    ),
                });
            }
        };

        stream.map_err(|e| VoiceLinkError::MicrophoneAccess {
            message: format!("Failed to open input stream: {}", e),
        })
    }
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        if lock(&self.stream).is_some() {
            return Ok(());
        }

        tracing::debug!(
            echo_cancellation = self.constraints.echo_cancellation,
            noise_suppression = self.constraints.noise_suppression,
            auto_gain_control = self.constraints.auto_gain_control,
            "Opening microphone; processing is delegated to the sound server"
        );

        let stream = self.build_stream()?;
        stream.play().map_err(|e| VoiceLinkError::MicrophoneAccess {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        // Some PipeWire-ALSA setups accept non-native configs but never deliver data.
        std::thread::sleep(std::time::Duration::from_millis(200));

        let stream = if self.shared.callbacks.load(Ordering::Relaxed) == 0 {
            drop(stream);
            lock(&self.shared.buffer).clear();

            let native_stream = self.build_stream_native()?;
            native_stream
                .play()
                .map_err(|e| VoiceLinkError::MicrophoneAccess {
                    message: format!("Failed to start native audio stream: {}", e),
                })?;
            native_stream
        } else {
            stream
        };

        *lock(&self.stream) = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = lock(&self.stream).take() {
            stream.0.pause().map_err(|e| VoiceLinkError::AudioCapture {
                message: format!("Failed to stop audio stream: {}", e),
            })?;
        }
        lock(&self.shared.buffer).clear();
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        Ok(std::mem::take(&mut *lock(&self.shared.buffer)))
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
