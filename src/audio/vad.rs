//! Voice Activity Detection (VAD) module.
//!
//! Decides when the user has finished speaking. The detector samples the
//! analysis tap on a fixed tick, computes the RMS level and tracks a
//! speaking flag plus a silence timer. End-of-turn is edge-triggered: it
//! fires once per utterance, and only after the level has stayed at or below
//! the threshold for longer than the hold-off.

use crate::audio::tap::AnalysisTap;
use crate::defaults;
use crate::error::{Result, VoiceLinkError};
use crate::events::{Registry, Subscription};
use crate::sync::lock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Trait for time operations, allowing mock time in tests.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that follows tokio's time source, so paused-time tests can drive it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<Instant>>,
}

impl MockClock {
    /// Creates a new mock clock starting at the current instant.
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Advances the mock clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        *lock(&self.current) += duration;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *lock(&self.current)
    }
}

/// Configuration for Voice Activity Detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// RMS threshold for detecting speech (0.0 to 1.0).
    pub threshold: f32,
    /// Continuous silence after speech before the turn ends.
    pub hold_off: Duration,
    /// How often the monitor samples the analysis tap.
    pub tick: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            hold_off: Duration::from_millis(defaults::SILENCE_DURATION_MS as u64),
            tick: Duration::from_millis(defaults::VAD_TICK_MS),
        }
    }
}

/// Result of one detector tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadTick {
    /// RMS level of the analysed window (0.0 to 1.0).
    pub level: f32,
    /// The user went from quiet to speaking on this tick.
    pub speech_started: bool,
    /// The user's turn ended on this tick.
    pub end_of_turn: bool,
}

/// Voice Activity Detector state machine.
pub struct VoiceActivityDetector<C: Clock = SystemClock> {
    config: VadConfig,
    speaking: bool,
    silence_start: Option<Instant>,
    clock: C,
}

impl<C: Clock> VoiceActivityDetector<C> {
    /// Creates a new detector with the given configuration and clock.
    pub fn with_clock(config: VadConfig, clock: C) -> Self {
        Self {
            config,
            speaking: false,
            silence_start: None,
            clock,
        }
    }

    /// Analyse one window of normalized samples.
    pub fn tick(&mut self, window: &[f32]) -> VadTick {
        let level = calculate_rms(window);
        let mut result = VadTick {
            level,
            speech_started: false,
            end_of_turn: false,
        };

        if level > self.config.threshold {
            result.speech_started = !self.speaking;
            self.speaking = true;
            self.silence_start = None;
            return result;
        }

        if !self.speaking {
            return result;
        }

        let now = self.clock.now();
        match self.silence_start {
            None => self.silence_start = Some(now),
            Some(start) => {
                if now.saturating_duration_since(start) > self.config.hold_off {
                    result.end_of_turn = true;
                    self.speaking = false;
                    self.silence_start = None;
                }
            }
        }
        result
    }

    /// Whether speech has been detected since the last end-of-turn or reset.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Clears the speaking flag and silence timer.
    pub fn reset(&mut self) {
        self.speaking = false;
        self.silence_start = None;
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Updates the speech threshold without resetting state.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.config.threshold = threshold;
    }
}

impl VoiceActivityDetector<SystemClock> {
    /// Creates a new detector using the system clock.
    pub fn new(config: VadConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

/// Calculates the Root Mean Square (RMS) of normalized samples.
///
/// # Returns
/// RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let sample = sample as f64;
            sample * sample
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}

/// Runs a detector against the analysis tap on a fixed tick.
///
/// Every tick publishes the level to level subscribers; end-of-turn
/// subscribers are notified once per utterance.
pub struct VadMonitor<C: Clock + 'static = TokioClock> {
    detector: Arc<Mutex<VoiceActivityDetector<C>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    levels: Registry<f32>,
    end_of_turn: Registry<()>,
}

impl VadMonitor<TokioClock> {
    pub fn new(config: VadConfig) -> Self {
        Self::with_clock(config, TokioClock)
    }
}

impl<C: Clock + 'static> VadMonitor<C> {
    pub fn with_clock(config: VadConfig, clock: C) -> Self {
        Self {
            detector: Arc::new(Mutex::new(VoiceActivityDetector::with_clock(config, clock))),
            task: Mutex::new(None),
            levels: Registry::new("vad.level"),
            end_of_turn: Registry::new("vad.end_of_turn"),
        }
    }

    /// Start sampling `tap`. No-op if already running.
    ///
    /// # Errors
    /// Returns `VoiceLinkError::Other` when called outside a tokio runtime.
    pub fn start(&self, tap: Arc<AnalysisTap>) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|e| VoiceLinkError::Other(format!("VAD monitor needs a tokio runtime: {}", e)))?;
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let detector = Arc::clone(&self.detector);
        let levels = self.levels.clone();
        let end_of_turn = self.end_of_turn.clone();
        let period = lock(&self.detector).config().tick;

        *task = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let window = tap.snapshot();
                let result = lock(&detector).tick(&window);
                levels.emit(&result.level);
                if result.end_of_turn {
                    tracing::debug!("VAD: end of turn");
                    end_of_turn.emit(&());
                }
            }
        }));
        Ok(())
    }

    /// Stop sampling and reset the detector. Safe when not running.
    pub fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        lock(&self.detector).reset();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn is_speaking(&self) -> bool {
        lock(&self.detector).is_speaking()
    }

    pub fn on_level<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&f32) + Send + Sync + 'static,
    {
        self.levels.subscribe(handler)
    }

    pub fn on_end_of_turn<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.end_of_turn.subscribe(move |_: &()| handler())
    }
}

impl<C: Clock + 'static> Drop for VadMonitor<C> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}
