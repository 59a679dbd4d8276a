//! Local screenshot cache (`spec.md` §4.2 item 5: "a local HTTP API for
//! screenshots"). `helix-capture::pipeline::CaptureHandle` exposes only
//! encoded `CaptureSample`s, never raw frames, so there is no direct
//! framebuffer grab to serve here — each viewer's keyframe is opportunistically
//! decoded back to a PNG and cached, the same one-shot GStreamer decode
//! pipeline `helix-encode::pipeline`'s encoder build mirrors
//! in reverse (`appsrc ! h264parse ! avdec_h264 ! videoconvert ! pngenc !
//! appsink`).

use std::sync::Mutex;

use gstreamer::prelude::*;
use gstreamer::{Buffer, Caps, ClockTime, Element, FlowSuccess, Pipeline, State};
use gstreamer_app::{AppSink, AppSrc};

use crate::error::EdgeError;

#[derive(Default)]
pub struct ScreenshotCache {
    latest_png: Mutex<Option<Vec<u8>>>,
}

impl ScreenshotCache {
    #[must_use]
    pub fn latest(&self) -> Option<Vec<u8>> {
        self.latest_png.lock().expect("screenshot cache mutex poisoned").clone()
    }

    fn store(&self, png: Vec<u8>) {
        *self.latest_png.lock().expect("screenshot cache mutex poisoned") = Some(png);
    }
}

/// Decodes one H.264 keyframe access unit to PNG and updates `cache`.
/// Best-effort: logs and leaves the cache unchanged on any pipeline failure
/// rather than disrupting the viewer's video forwarding path, since a failed
/// screenshot refresh is never worse than a stale one.
pub async fn update_from_keyframe(cache: std::sync::Arc<ScreenshotCache>, payload: Vec<u8>, width: u32, height: u32) {
    let result = tokio::task::spawn_blocking(move || decode_to_png(&payload, width, height)).await;
    match result {
        Ok(Ok(png)) => cache.store(png),
        Ok(Err(e)) => tracing::debug!(error = %e, "screenshot keyframe decode failed"),
        Err(e) => tracing::warn!(error = %e, "screenshot decode task panicked"),
    }
}

fn decode_to_png(payload: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EdgeError> {
    let pipeline = Pipeline::new();

    let src_caps = Caps::builder("video/x-h264")
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .field("width", width as i32)
        .field("height", height as i32)
        .build();

    let appsrc = gstreamer_app::AppSrc::builder()
        .caps(&src_caps)
        .format(gstreamer::Format::Time)
        .build();

    let h264parse = gstreamer::ElementFactory::make("h264parse").build().map_err(|_| EdgeError::EncoderFault)?;
    let decoder = gstreamer::ElementFactory::make("avdec_h264").build().map_err(|_| EdgeError::EncoderFault)?;
    let videoconvert = gstreamer::ElementFactory::make("videoconvert").build().map_err(|_| EdgeError::EncoderFault)?;
    let pngenc = gstreamer::ElementFactory::make("pngenc").build().map_err(|_| EdgeError::EncoderFault)?;

    let appsink = gstreamer_app::AppSink::builder().sync(false).async_(false).max_buffers(1).drop(false).build();

    let appsrc_elem: Element = appsrc.clone().upcast();
    let appsink_elem: Element = appsink.clone().upcast();

    pipeline
        .add_many([&appsrc_elem, &h264parse, &decoder, &videoconvert, &pngenc, &appsink_elem])
        .map_err(|_| EdgeError::EncoderFault)?;
    Element::link_many([&appsrc_elem, &h264parse, &decoder, &videoconvert, &pngenc, &appsink_elem])
        .map_err(|_| EdgeError::EncoderFault)?;

    pipeline.set_state(State::Playing).map_err(|_| EdgeError::EncoderFault)?;

    let buffer = Buffer::from_mut_slice(payload.to_vec());
    match appsrc.push_buffer(buffer) {
        Ok(FlowSuccess::Ok) => {}
        _ => {
            let _ = pipeline.set_state(State::Null);
            return Err(EdgeError::EncoderFault);
        }
    }
    let _ = appsrc.end_of_stream();

    let sample = appsink
        .try_pull_sample(ClockTime::from_seconds(2))
        .ok_or(EdgeError::EncoderFault);
    let result = sample.and_then(|sample| {
        let buffer = sample.buffer().ok_or(EdgeError::EncoderFault)?;
        let map = buffer.map_readable().map_err(|_| EdgeError::EncoderFault)?;
        Ok(map.as_slice().to_vec())
    });

    let _ = pipeline.set_state(State::Null);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_starts_empty_and_reflects_stores() {
        let cache = ScreenshotCache::default();
        assert!(cache.latest().is_none());
        cache.store(vec![1, 2, 3]);
        assert_eq!(cache.latest(), Some(vec![1, 2, 3]));
    }
}
