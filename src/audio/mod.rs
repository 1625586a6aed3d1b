//! Audio: microphone capture, voice activity detection and playback.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod convert;
pub mod encoder;
pub mod output;
pub mod pipeline;
pub mod playback;
pub mod recorder;
pub mod tap;
pub mod vad;
