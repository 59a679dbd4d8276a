//! Hardware-priority video encoder abstraction plus Opus audio encoding.
//!
//! Encoder selection is a closed, compile-time-known tagged variant
//! ([`EncoderKind`]) rather than a trait object — new encoders require a
//! release, matching the dynamic-dispatch design note this crate implements.

mod audio;
mod error;
mod kind;
mod pipeline;

pub use audio::OpusEncoder;
pub use error::EncodeError;
pub use kind::EncoderKind;
pub use pipeline::{EncodedSample, EncoderSpec, VideoEncoder};
