//! Sample format conversions shared by capture and playback.

/// Decode little-endian 16-bit PCM.
///
/// Returns the samples and whether a dangling odd byte was dropped.
pub fn pcm16_le_to_i16(bytes: &[u8]) -> (Vec<i16>, bool) {
    let chunks = bytes.chunks_exact(2);
    let trailing = !chunks.remainder().is_empty();
    let samples = chunks
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    (samples, trailing)
}

/// Encode samples as little-endian 16-bit PCM.
pub fn i16_to_pcm16_le(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Normalize a sample to [-1.0, 1.0] by dividing by 32768.
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    (sample as f32 / 32768.0).clamp(-1.0, 1.0)
}

pub fn i16_slice_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().copied().map(i16_to_f32).collect()
}

/// Convert a float sample back to 16-bit, clamping out-of-range input.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Average interleaved channels down to mono. Incomplete trailing frames are dropped.
pub fn downmix_i16(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler for a stream that arrives in chunks.
///
/// The read position and the previous chunk's last sample carry over between
/// calls, so output length tracks the rate ratio exactly however the input is
/// cut, and interpolation is continuous across chunk boundaries. Good enough
/// for speech; no anti-aliasing filter is applied when downsampling.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    /// Position of the next output sample relative to the start of the next
    /// chunk, in units of `1 / to_rate` input samples. Negative values fall
    /// between `last` and the chunk's first sample.
    phase: i64,
    last: Option<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            phase: 0,
            last: None,
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0
    }

    /// Forget the carried position, e.g. before an unrelated stream.
    pub fn reset(&mut self) {
        self.phase = 0;
        self.last = None;
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        if samples.is_empty() {
            return Vec::new();
        }

        let to = self.to_rate as i64;
        let step = self.from_rate as i64;
        let len = samples.len() as i64;
        let last_position = (len - 1) * to;
        let mut output = Vec::with_capacity((len * to / step) as usize + 1);

        let mut phase = self.phase;
        while phase <= last_position {
            let (left, right, fraction) = if phase < 0 {
                let first = samples[0];
                (self.last.unwrap_or(first), first, phase + to)
            } else {
                let idx = (phase / to) as usize;
                let left = samples[idx];
                (left, samples.get(idx + 1).copied().unwrap_or(left), phase % to)
            };
            let fraction = fraction as f64 / to as f64;
            output.push((left as f64 + (right as f64 - left as f64) * fraction) as f32);
            phase += step;
        }

        self.phase = phase - len * to;
        self.last = samples.last().copied();
        output
    }

    /// [`process`](Self::process) for 16-bit samples.
    pub fn process_i16(&mut self, samples: &[i16]) -> Vec<i16> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        let floats: Vec<f32> = samples.iter().map(|&s| s as f32).collect();
        self.process(&floats)
            .into_iter()
            .map(|s| s.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect()
    }
}

/// Resample one self-contained buffer.
pub fn resample_f32(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    StreamResampler::new(from_rate, to_rate).process(samples)
}
