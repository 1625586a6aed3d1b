//! Gapless playback of streamed speech.
//!
//! Chunks arrive with arbitrary boundaries. Each one is scheduled to start
//! exactly where the previous one ends on the output clock, or immediately
//! if the queue already ran dry.

use crate::audio::convert::{StreamResampler, i16_to_f32, pcm16_le_to_i16};
use crate::audio::output::{AudioOutput, UnitId};
use crate::defaults;
use crate::error::Result;
use crate::sync::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
struct Pending {
    id: UnitId,
    end: f64,
}

#[derive(Debug)]
struct SchedulerState {
    /// Output time at which the next chunk starts; 0 means "as soon as possible".
    next_play_time: f64,
    pending: VecDeque<Pending>,
    /// Declared input rate to the output's rate.
    resampler: StreamResampler,
}

impl SchedulerState {
    fn prune(&mut self, now: f64) {
        while self.pending.front().is_some_and(|p| p.end <= now) {
            self.pending.pop_front();
        }
    }
}

/// Schedules inbound PCM16 chunks back to back on an [`AudioOutput`].
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self::with_input_rate(output, defaults::PLAYBACK_SAMPLE_RATE)
    }

    pub fn with_input_rate(output: Arc<dyn AudioOutput>, input_rate: u32) -> Self {
        let resampler = StreamResampler::new(input_rate, output.sample_rate());
        Self {
            output,
            state: Mutex::new(SchedulerState {
                next_play_time: 0.0,
                pending: VecDeque::new(),
                resampler,
            }),
        }
    }

    /// Decode and schedule one chunk of little-endian PCM16.
    ///
    /// Returns `None` for chunks without a single whole sample.
    pub fn enqueue(&self, bytes: &[u8]) -> Result<Option<UnitId>> {
        let (samples, trailing) = pcm16_le_to_i16(bytes);
        if trailing {
            tracing::warn!(len = bytes.len(), "Dropping odd trailing byte of audio chunk");
        }
        if samples.is_empty() {
            return Ok(None);
        }

        let output_rate = self.output.sample_rate();
        let mut state = lock(&self.state);
        let normalized: Vec<f32> = samples.into_iter().map(i16_to_f32).collect();
        let samples = if state.resampler.is_passthrough() {
            normalized
        } else {
            state.resampler.process(&normalized)
        };
        if samples.is_empty() {
            return Ok(None);
        }
        let duration = samples.len() as f64 / output_rate as f64;

        let now = self.output.now();
        state.prune(now);
        let start = now.max(state.next_play_time);
        let id = self.output.schedule(samples, start)?;
        let end = start + duration;
        state.next_play_time = end;
        state.pending.push_back(Pending { id, end });
        Ok(Some(id))
    }

    /// Halt everything queued or playing and reset the cursor.
    ///
    /// Idempotent; safe when nothing is queued.
    pub fn stop_playback(&self) {
        let pending: Vec<Pending> = {
            let mut state = lock(&self.state);
            state.next_play_time = 0.0;
            state.resampler.reset();
            state.pending.drain(..).collect()
        };
        if !pending.is_empty() {
            tracing::debug!(units = pending.len(), "Stopping playback");
        }
        for unit in pending {
            self.output.halt(unit.id);
        }
    }

    /// Sample rate inbound chunks are declared at.
    pub fn set_input_rate(&self, rate: u32) {
        if rate == 0 {
            return;
        }
        let mut state = lock(&self.state);
        if state.resampler.from_rate() != rate {
            state.resampler = StreamResampler::new(rate, self.output.sample_rate());
        }
    }

    pub fn input_rate(&self) -> u32 {
        lock(&self.state).resampler.from_rate()
    }

    pub fn next_play_time(&self) -> f64 {
        lock(&self.state).next_play_time
    }

    /// Units scheduled and not yet finished on the output clock.
    pub fn pending_count(&self) -> usize {
        let now = self.output.now();
        let mut state = lock(&self.state);
        state.prune(now);
        state.pending.len()
    }

    pub fn is_playing(&self) -> bool {
        self.pending_count() > 0
    }
}
