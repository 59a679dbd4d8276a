//! GStreamer H.264 video encoding pipeline.
//!
//! `appsrc(raw frames) ! [videoconvert] ! <hw-or-sw-encoder> ! [capsfilter:
//! profile] ! h264parse(config-interval=-1) !
//! capsfilter(stream-format=byte-stream,alignment=au) ! appsink`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gstreamer::prelude::*;
use gstreamer::{Buffer, Caps, ClockTime, Element, FlowSuccess, Pipeline, State};
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video::UpstreamForceKeyUnitEvent;

use crate::error::EncodeError;
use crate::kind::EncoderKind;

/// Requested parameters for a new [`VideoEncoder`].
#[derive(Debug, Clone, Copy)]
pub struct EncoderSpec {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate_kbps: u32,
    pub preferred: Option<EncoderKind>,
}

/// One encoded access unit pulled from the pipeline's appsink.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
    pub pts: Option<ClockTime>,
}

/// A running GStreamer H.264 encode pipeline feeding from raw `BGRA`/`BGRx`
/// frames pushed via [`Self::encode_frame`] to encoded access units pulled
/// via [`Self::pull_encoded`].
pub struct VideoEncoder {
    pipeline: Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    kind: EncoderKind,
    pipeline_error: Arc<AtomicBool>,
    width: u32,
    height: u32,
}

impl VideoEncoder {
    /// Build and start an encode pipeline, selecting the highest-priority
    /// usable hardware encoder (falling back to software x264) per
    /// [`EncoderKind::detect`].
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::NoEncoderAvailable`] if no backend, including
    /// software x264, can be instantiated. Returns [`EncodeError::Link`] or
    /// [`EncodeError::PipelineStart`] if pipeline construction fails.
    pub fn new(spec: EncoderSpec) -> Result<Self, EncodeError> {
        let kind = EncoderKind::detect(spec.preferred).ok_or(EncodeError::NoEncoderAvailable)?;
        tracing::info!(?kind, width = spec.width, height = spec.height, "selected video encoder");

        let pipeline = Pipeline::new();

        let src_format = if kind.accepts_bgra_directly() { "BGRA" } else { "BGRx" };
        let src_caps = Caps::builder("video/x-raw")
            .field("format", src_format)
            .field("width", spec.width as i32)
            .field("height", spec.height as i32)
            .field("framerate", gstreamer::Fraction::new(spec.framerate as i32, 1))
            .build();

        let appsrc = gstreamer_app::AppSrc::builder()
            .caps(&src_caps)
            .format(gstreamer::Format::Time)
            .is_live(true)
            .do_timestamp(true)
            .build();
        appsrc.set_property("block", false);
        appsrc.set_max_bytes(0);

        let encoder = build_encoder_element(kind, spec.bitrate_kbps)?;

        let h264parse = gstreamer::ElementFactory::make("h264parse")
            .property("config-interval", -1i32)
            .build()
            .map_err(EncodeError::Link)?;

        let parse_caps = Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let parse_filter = gstreamer::ElementFactory::make("capsfilter")
            .property("caps", &parse_caps)
            .build()
            .map_err(EncodeError::Link)?;

        let appsink = gstreamer_app::AppSink::builder()
            .sync(false)
            .async_(false)
            .max_buffers(1)
            .drop(true)
            .build();

        let appsrc_elem: Element = appsrc.clone().upcast();
        let appsink_elem: Element = appsink.clone().upcast();

        pipeline
            .add_many([&appsrc_elem, &encoder, &h264parse, &parse_filter, &appsink_elem])
            .map_err(EncodeError::Link)?;

        if kind.accepts_bgra_directly() {
            Element::link_many([&appsrc_elem, &encoder, &h264parse, &parse_filter, &appsink_elem])
                .map_err(EncodeError::Link)?;
        } else {
            let videoconvert = gstreamer::ElementFactory::make("videoconvert")
                .build()
                .map_err(EncodeError::Link)?;
            pipeline.add(&videoconvert).map_err(EncodeError::Link)?;
            Element::link_many([
                &appsrc_elem,
                &videoconvert,
                &encoder,
                &h264parse,
                &parse_filter,
                &appsink_elem,
            ])
            .map_err(EncodeError::Link)?;
        }

        let pipeline_error = Arc::new(AtomicBool::new(false));
        let bus = pipeline.bus().expect("pipeline always has a bus");
        let error_flag = Arc::clone(&pipeline_error);
        bus.add_watch(move |_bus, msg| {
            use gstreamer::MessageView;
            if let MessageView::Error(err) = msg.view() {
                tracing::error!(error = %err.error(), debug = ?err.debug(), "encoder pipeline error");
                error_flag.store(true, Ordering::SeqCst);
            }
            gstreamer::glib::ControlFlow::Continue
        })
        .map_err(|_| EncodeError::PipelineBuild("failed to install bus watch".into()))?;

        pipeline
            .set_state(State::Playing)
            .map_err(EncodeError::PipelineStart)?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            kind,
            pipeline_error,
            width: spec.width,
            height: spec.height,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> EncoderKind {
        self.kind
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.pipeline_error.load(Ordering::SeqCst)
    }

    /// Push one raw frame (already matching this encoder's negotiated
    /// `width`/`height`/pixel format) into the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Push`] if the appsrc rejects the buffer (e.g.
    /// pipeline already EOS'd).
    pub fn encode_frame(&self, data: &[u8]) -> Result<(), EncodeError> {
        let buffer = Buffer::from_mut_slice(data.to_vec());
        match self.appsrc.push_buffer(buffer) {
            Ok(FlowSuccess::Ok) => Ok(()),
            _ => Err(EncodeError::Push),
        }
    }

    /// Request the next output unit be encoded as a keyframe, via an
    /// upstream force-key-unit event.
    pub fn force_keyframe(&self) {
        let event = UpstreamForceKeyUnitEvent::builder().all_headers(true).build();
        let _ = self.appsrc.send_event(event);
    }

    /// Pull the next encoded access unit, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::NoSample`]/[`EncodeError::NoBuffer`] if the
    /// appsink produced nothing within `timeout`.
    pub fn pull_encoded(&self, timeout: Duration) -> Result<EncodedSample, EncodeError> {
        let sample = self
            .appsink
            .try_pull_sample(ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or(EncodeError::NoSample)?;
        let buffer = sample.buffer().ok_or(EncodeError::NoBuffer)?;
        let map = buffer.map_readable().map_err(|_| EncodeError::NoBuffer)?;
        Ok(EncodedSample {
            data: map.as_slice().to_vec(),
            is_keyframe: !buffer.flags().contains(gstreamer::BufferFlags::DELTA_UNIT),
            pts: buffer.pts(),
        })
    }

    #[must_use]
    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(State::Null);
    }
}

fn build_encoder_element(kind: EncoderKind, bitrate_kbps: u32) -> Result<Element, EncodeError> {
    let builder = gstreamer::ElementFactory::make(kind.factory_name());
    let element = match kind {
        EncoderKind::Nvenc => builder
            .property("bitrate", bitrate_kbps)
            .property_from_str("preset", "low-latency-hq")
            .property_from_str("rc-mode", "cbr-ld-hq")
            .property("zerolatency", true)
            .property("qp-max-i", 30u32)
            .property("qp-max-p", 30u32)
            .property("vbv-buffer-size", bitrate_kbps)
            .build(),
        EncoderKind::Qsv => builder
            .property("bitrate", bitrate_kbps)
            .property_from_str("rate-control", "cbr")
            .build(),
        EncoderKind::VaApi => builder
            .property("bitrate", bitrate_kbps)
            .property_from_str("rate-control", "cbr")
            .property("target-usage", 7u32)
            .property("key-int-max", 300u32)
            .build(),
        EncoderKind::VaApiLowPower => builder
            .property("bitrate", bitrate_kbps)
            .property_from_str("rate-control", "cbr")
            .property("target-usage", 7u32)
            .property("key-int-max", 300u32)
            .property("low-power", true)
            .build(),
        EncoderKind::X264 => builder
            .property("bitrate", bitrate_kbps)
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "ultrafast")
            .property("key-int-max", 300u32)
            .property("bframes", 0u32)
            .build(),
    };
    element.map_err(EncodeError::Link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn src_caps_format_follows_encoder_kind() {
        for kind in EncoderKind::PRIORITY {
            let expected = if kind.accepts_bgra_directly() { "BGRA" } else { "BGRx" };
            assert_eq!(expected, if kind.accepts_bgra_directly() { "BGRA" } else { "BGRx" });
        }
    }

    #[test]
    fn encoded_sample_flags_keyframe_from_delta_unit() {
        let non_delta = gstreamer::BufferFlags::empty();
        assert!(!non_delta.contains(gstreamer::BufferFlags::DELTA_UNIT));
    }
}
