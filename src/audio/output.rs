//! Audio output capability: a clock plus sample-accurate scheduling.

use crate::error::Result;
use crate::sync::lock;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Handle to one scheduled block of samples.
pub type UnitId = u64;

/// A device that plays sample blocks at absolute times on its own clock.
///
/// Times are seconds on the output clock, which starts at 0 and only moves
/// forward while the device renders.
pub trait AudioOutput: Send + Sync {
    /// Current output clock, in seconds.
    fn now(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Schedule mono samples to start playing at `start_at`.
    fn schedule(&self, samples: Vec<f32>, start_at: f64) -> Result<UnitId>;

    /// Stop a unit immediately. Halting a finished or unknown unit is a no-op.
    fn halt(&self, unit: UnitId);
}

/// What a [`VirtualOutput`] recorded for one `schedule` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledUnit {
    pub id: UnitId,
    pub start: f64,
    pub duration: f64,
    pub samples: Vec<f32>,
    pub halted: bool,
}

impl ScheduledUnit {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug, Default)]
struct VirtualState {
    now: f64,
    next_id: UnitId,
    units: BTreeMap<UnitId, ScheduledUnit>,
}

/// Output whose clock only moves when told to. Renders nothing.
#[derive(Debug)]
pub struct VirtualOutput {
    sample_rate: u32,
    state: Mutex<VirtualState>,
}

impl VirtualOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(VirtualState::default()),
        }
    }

    pub fn advance(&self, seconds: f64) {
        lock(&self.state).now += seconds.max(0.0);
    }

    /// Every unit scheduled so far, in scheduling order.
    pub fn units(&self) -> Vec<ScheduledUnit> {
        lock(&self.state).units.values().cloned().collect()
    }

    /// Units that are neither halted nor finished at the current time.
    pub fn active_units(&self) -> Vec<ScheduledUnit> {
        let state = lock(&self.state);
        state
            .units
            .values()
            .filter(|u| !u.halted && u.end() > state.now)
            .cloned()
            .collect()
    }
}

impl AudioOutput for VirtualOutput {
    fn now(&self) -> f64 {
        lock(&self.state).now
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedule(&self, samples: Vec<f32>, start_at: f64) -> Result<UnitId> {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        let duration = samples.len() as f64 / self.sample_rate as f64;
        state.units.insert(
            id,
            ScheduledUnit {
                id,
                start: start_at,
                duration,
                samples,
                halted: false,
            },
        );
        Ok(id)
    }

    fn halt(&self, unit: UnitId) {
        let mut state = lock(&self.state);
        let now = state.now;
        if let Some(unit) = state.units.get_mut(&unit)
            && unit.end() > now
        {
            unit.halted = true;
        }
    }
}

#[cfg(feature = "cpal-audio")]
pub use self::device::CpalOutput;

#[cfg(feature = "cpal-audio")]
mod device {
    use super::{AudioOutput, UnitId};
    use crate::audio::capture::{DeviceKind, SendableStream, find_device};
    use crate::error::{Result, VoiceLinkError};
    use crate::sync::lock;
    use cpal::traits::{DeviceTrait, StreamTrait};
    use std::sync::{Arc, Mutex};

    struct Voice {
        id: UnitId,
        start_frame: u64,
        samples: Vec<f32>,
    }

    impl Voice {
        fn end_frame(&self) -> u64 {
            self.start_frame + self.samples.len() as u64
        }
    }

    #[derive(Default)]
    struct Mixer {
        frames_rendered: u64,
        next_id: UnitId,
        voices: Vec<Voice>,
    }

    impl Mixer {
        /// Mix every voice overlapping this buffer into `out`, one value per frame.
        fn render(&mut self, out: &mut [f32]) {
            out.fill(0.0);
            let first = self.frames_rendered;
            let last = first + out.len() as u64;
            for voice in &self.voices {
                if voice.start_frame >= last || voice.end_frame() <= first {
                    continue;
                }
                let from = voice.start_frame.max(first);
                let to = voice.end_frame().min(last);
                for frame in from..to {
                    out[(frame - first) as usize] += voice.samples[(frame - voice.start_frame) as usize];
                }
            }
            self.frames_rendered = last;
            self.voices.retain(|v| v.end_frame() > last);
        }
    }

    /// Speaker output through CPAL with a software mixer.
    ///
    /// The clock is the number of frames the device has pulled, divided by
    /// the device sample rate.
    pub struct CpalOutput {
        _stream: Mutex<SendableStream>,
        mixer: Arc<Mutex<Mixer>>,
        sample_rate: u32,
    }

    impl CpalOutput {
        /// Open the named output device, or the best default, and start it.
        ///
        /// # Errors
        /// Returns `VoiceLinkError::AudioDeviceNotFound` or `VoiceLinkError::AudioOutput`.
        pub fn new(device_name: Option<&str>) -> Result<Self> {
            use cpal::SampleFormat;

            let device = find_device(DeviceKind::Output, device_name)?;
            let default_config =
                device
                    .default_output_config()
                    .map_err(|e| VoiceLinkError::AudioOutput {
                        message: format!("Failed to query default output config: {}", e),
                    })?;
            let sample_rate = default_config.sample_rate().0;
            let channels = default_config.channels() as usize;
            let stream_config: cpal::StreamConfig = default_config.clone().into();
            let mixer = Arc::new(Mutex::new(Mixer::default()));

            let err_callback = |err| tracing::warn!("Audio output stream error: {}", err);

            let stream = match default_config.sample_format() {
                SampleFormat::F32 => {
                    let mixer = Arc::clone(&mixer);
                    let mut mono = Vec::new();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            mono.resize(data.len() / channels.max(1), 0.0);
                            lock(&mixer).render(&mut mono);
                            for (frame, &value) in data.chunks_mut(channels.max(1)).zip(&mono) {
                                frame.fill(value);
                            }
                        },
                        err_callback,
                        None,
                    )
                }
                SampleFormat::I16 => {
                    let mixer = Arc::clone(&mixer);
                    let mut mono = Vec::new();
                    device.build_output_stream(
                        &stream_config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            mono.resize(data.len() / channels.max(1), 0.0);
                            lock(&mixer).render(&mut mono);
                            for (frame, &value) in data.chunks_mut(channels.max(1)).zip(&mono) {
                                frame.fill(crate::audio::convert::f32_to_i16(value));
                            }
                        },
                        err_callback,
                        None,
                    )
                }
                fmt => {
                    return Err(VoiceLinkError::AudioOutput {
                        message: format!("Unsupported output sample format: {:?}", fmt),
                    });
                }
            }
            .map_err(|e| VoiceLinkError::AudioOutput {
                message: format!("Failed to open output stream: {}", e),
            })?;

            stream.play().map_err(|e| VoiceLinkError::AudioOutput {
                message: format!("Failed to start output stream: {}", e),
            })?;

            tracing::debug!(sample_rate, channels, "Audio output started");

            Ok(Self {
                _stream: Mutex::new(SendableStream(stream)),
                mixer,
                sample_rate,
            })
        }
    }

    impl AudioOutput for CpalOutput {
        fn now(&self) -> f64 {
            lock(&self.mixer).frames_rendered as f64 / self.sample_rate as f64
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn schedule(&self, samples: Vec<f32>, start_at: f64) -> Result<UnitId> {
            let mut mixer = lock(&self.mixer);
            let id = mixer.next_id;
            mixer.next_id += 1;
            let start_frame = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
            mixer.voices.push(Voice {
                id,
                start_frame,
                samples,
            });
            Ok(id)
        }

        fn halt(&self, unit: UnitId) {
            lock(&self.mixer).voices.retain(|v| v.id != unit);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_output_records_units() {
        let output = VirtualOutput::new(24000);
        let id = output.schedule(vec![0.0; 12000], 0.25).unwrap();

        let units = output.units();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, id);
        assert_eq!(units[0].start, 0.25);
        assert!((units[0].end() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_virtual_clock_advances_manually() {
        let output = VirtualOutput::new(24000);
        assert_eq!(output.now(), 0.0);
        output.advance(1.5);
        output.advance(-3.0);
        assert_eq!(output.now(), 1.5);
    }

    #[test]
    fn test_halt_is_idempotent_and_ignores_finished_units() {
        let output = VirtualOutput::new(1000);
        let finished = output.schedule(vec![0.0; 100], 0.0).unwrap();
        let playing = output.schedule(vec![0.0; 1000], 0.0).unwrap();
        output.advance(0.5);

        output.halt(finished);
        output.halt(playing);
        output.halt(playing);
        output.halt(42);

        let units = output.units();
        assert!(!units[0].halted);
        assert!(units[1].halted);
        assert!(output.active_units().is_empty());
    }
}
