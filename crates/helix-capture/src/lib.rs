//! Capture Pipeline (C1): turns a desktop container's compositor framebuffer
//! and audio graph into a timestamped stream of encoded video/audio samples.
//!
//! - `portal`: XDG Desktop Portal `ScreenCast` negotiation.
//! - `pipewire_stream` / `audio_stream`: `PipeWire` video/audio capture.
//! - `spa_meta`: SPA buffer metadata extraction (damage rects, cursor).
//! - `compositor`: multi-monitor frame merge.
//! - `pipeline`: the public `Start`/`RequestKeyframe`/`Stop`/`Samples` contract.

pub mod audio_stream;
pub mod compositor;
pub mod frame;
pub mod pipeline;
pub mod pipewire_stream;
pub mod portal;
pub mod spa_meta;

pub use pipeline::{start, CaptureError, CaptureHandle, CaptureSample, CaptureSpec};
