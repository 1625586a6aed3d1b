//! Frame assembly and encoding for outbound audio.

use crate::defaults;
use crate::error::Result;
use std::time::Instant;

/// One fixed-duration frame of captured audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Monotonically increasing within a capture session.
    pub sequence: u64,
    /// When the frame's last sample was handed to the assembler.
    pub captured_at: Instant,
    pub samples: Vec<i16>,
}

/// Cuts a continuous sample stream into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    pending: Vec<i16>,
    next_sequence: u64,
}

impl FrameAssembler {
    /// Assembler for [`defaults::FRAME_DURATION_MS`] frames at `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        Self::with_frame_len(defaults::frame_samples(sample_rate))
    }

    pub fn with_frame_len(frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len),
            next_sequence: 0,
        }
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_len);
        let now = Instant::now();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(AudioFrame {
                sequence: self.next_sequence,
                captured_at: now,
                samples,
            });
            self.next_sequence += 1;
        }
        frames
    }

    /// Drop any partial frame. Sequence numbers keep counting.
    pub fn discard_partial(&mut self) {
        self.pending.clear();
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Turns one frame of samples into the bytes sent on the channel.
pub trait FrameEncoder: Send {
    fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>>;

    /// Short codec name for logs.
    fn name(&self) -> &'static str;
}

/// Raw little-endian 16-bit PCM.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pcm16Encoder;

impl FrameEncoder for Pcm16Encoder {
    fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>> {
        Ok(crate::audio::convert::i16_to_pcm16_le(samples))
    }

    fn name(&self) -> &'static str {
        "pcm16"
    }
}

/// Which encoder the capture pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Pcm16,
    Opus,
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::Pcm16 => write!(f, "pcm16"),
            Codec::Opus => write!(f, "opus"),
        }
    }
}

/// Build the encoder for `codec` at `sample_rate`.
///
/// # Errors
/// Returns `VoiceLinkError::Encoding` if the codec is unavailable in this
/// build or rejects the sample rate.
pub fn build_encoder(codec: Codec, sample_rate: u32) -> Result<Box<dyn FrameEncoder>> {
    match codec {
        Codec::Pcm16 => Ok(Box::new(Pcm16Encoder)),
        #[cfg(feature = "opus")]
        Codec::Opus => Ok(Box::new(opus::OpusFrameEncoder::new(sample_rate)?)),
        #[cfg(not(feature = "opus"))]
        Codec::Opus => {
            tracing::warn!(sample_rate, "Opus requested but not compiled in");
            Err(crate::error::VoiceLinkError::Encoding {
                message: "opus support not compiled in (enable the `opus` feature)".to_string(),
            })
        }
    }
}

#[cfg(feature = "opus")]
mod opus {
    use super::FrameEncoder;
    use crate::error::{Result, VoiceLinkError};
    use audiopus::coder::Encoder;
    use audiopus::{Application, Channels, SampleRate};

    /// Opus packet duration within a frame.
    const PACKET_MS: usize = 20;

    /// Upper bound for one encoded packet.
    const MAX_PACKET_BYTES: usize = 4000;

    /// Encodes a 100 ms frame as five 20 ms Opus packets, each prefixed with
    /// its length as a little-endian u16.
    pub struct OpusFrameEncoder {
        encoder: Encoder,
        packet_len: usize,
    }

    impl OpusFrameEncoder {
        pub fn new(sample_rate: u32) -> Result<Self> {
            let rate = SampleRate::try_from(sample_rate as i32).map_err(|e| {
                VoiceLinkError::Encoding {
                    message: format!("Invalid Opus sample rate {}: {}", sample_rate, e),
                }
            })?;
            let encoder = Encoder::new(rate, Channels::Mono, Application::Voip).map_err(|e| {
                VoiceLinkError::Encoding {
                    message: format!("Failed to create Opus encoder: {}", e),
                }
            })?;
            Ok(Self {
                encoder,
                packet_len: sample_rate as usize * PACKET_MS / 1000,
            })
        }
    }

    impl FrameEncoder for OpusFrameEncoder {
        fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>> {
            let mut out = Vec::new();
            let mut packet = vec![0u8; MAX_PACKET_BYTES];
            for chunk in samples.chunks(self.packet_len) {
                let result = if chunk.len() == self.packet_len {
                    self.encoder.encode(chunk, &mut packet)
                } else {
                    let mut padded = chunk.to_vec();
                    padded.resize(self.packet_len, 0);
                    self.encoder.encode(&padded, &mut packet)
                };
                let len = result.map_err(|e| VoiceLinkError::Encoding {
                    message: format!("Opus encode failed: {}", e),
                })?;
                out.extend_from_slice(&(len as u16).to_le_bytes());
                out.extend_from_slice(&packet[..len]);
            }
            Ok(out)
        }

        fn name(&self) -> &'static str {
            "opus"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_frame_becomes_five_length_prefixed_packets() {
            let mut encoder = OpusFrameEncoder::new(16000).unwrap();
            let encoded = encoder.encode(&vec![0i16; 1600]).unwrap();

            let mut offset = 0;
            let mut packets = 0;
            while offset < encoded.len() {
                let len = u16::from_le_bytes([encoded[offset], encoded[offset + 1]]) as usize;
                offset += 2 + len;
                packets += 1;
            }
            assert_eq!(offset, encoded.len());
            assert_eq!(packets, 5);
        }

        #[test]
        fn test_rejects_unsupported_rate() {
            assert!(OpusFrameEncoder::new(44100).is_err());
        }
    }
}
