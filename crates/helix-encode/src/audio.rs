//! Opus audio encoding pipeline.
//!
//! `appsrc(raw audio) ! audioconvert ! audioresample ! opusenc ! appsink`,
//! matching the Opus payload the wire protocol's `AudioFrame` message
//! carries (helix-wire's `MessageType::AudioFrame`).

use std::time::Duration;

use gstreamer::prelude::*;
use gstreamer::{Buffer, Caps, ClockTime, Element, FlowSuccess, Pipeline, State};
use gstreamer_app::{AppSink, AppSrc};

use crate::error::EncodeError;

/// A running GStreamer Opus encode pipeline for one audio capture stream.
pub struct OpusEncoder {
    pipeline: Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
}

impl OpusEncoder {
    /// Build and start an Opus encode pipeline for `sample_rate`-Hz
    /// `channels`-channel interleaved S16LE input.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Link`] if pipeline construction fails, or
    /// [`EncodeError::PipelineStart`] if it cannot reach `Playing`.
    pub fn new(sample_rate: u32, channels: u32, bitrate_bps: u32) -> Result<Self, EncodeError> {
        let pipeline = Pipeline::new();

        let src_caps = Caps::builder("audio/x-raw")
            .field("format", "S16LE")
            .field("layout", "interleaved")
            .field("rate", sample_rate as i32)
            .field("channels", channels as i32)
            .build();

        let appsrc = gstreamer_app::AppSrc::builder()
            .caps(&src_caps)
            .format(gstreamer::Format::Time)
            .is_live(true)
            .do_timestamp(true)
            .build();
        appsrc.set_property("block", false);
        appsrc.set_max_bytes(0);

        let audioconvert = gstreamer::ElementFactory::make("audioconvert")
            .build()
            .map_err(EncodeError::Link)?;
        let audioresample = gstreamer::ElementFactory::make("audioresample")
            .build()
            .map_err(EncodeError::Link)?;
        let opusenc = gstreamer::ElementFactory::make("opusenc")
            .property("bitrate", bitrate_bps as i32)
            .property_from_str("audio-type", "restricted-lowdelay")
            .build()
            .map_err(EncodeError::Link)?;

        let appsink = gstreamer_app::AppSink::builder()
            .sync(false)
            .async_(false)
            .max_buffers(8)
            .drop(true)
            .build();

        let appsrc_elem: Element = appsrc.clone().upcast();
        let appsink_elem: Element = appsink.clone().upcast();

        pipeline
            .add_many([&appsrc_elem, &audioconvert, &audioresample, &opusenc, &appsink_elem])
            .map_err(EncodeError::Link)?;
        Element::link_many([&appsrc_elem, &audioconvert, &audioresample, &opusenc, &appsink_elem])
            .map_err(EncodeError::Link)?;

        pipeline
            .set_state(State::Playing)
            .map_err(EncodeError::PipelineStart)?;

        Ok(Self { pipeline, appsrc, appsink })
    }

    /// Push one raw interleaved S16LE chunk into the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Push`] if the appsrc rejects the buffer.
    pub fn encode_chunk(&self, data: &[u8]) -> Result<(), EncodeError> {
        let buffer = Buffer::from_mut_slice(data.to_vec());
        match self.appsrc.push_buffer(buffer) {
            Ok(FlowSuccess::Ok) => Ok(()),
            _ => Err(EncodeError::Push),
        }
    }

    /// Pull the next encoded Opus packet, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::NoSample`]/[`EncodeError::NoBuffer`] if the
    /// appsink produced nothing within `timeout`.
    pub fn pull_encoded(&self, timeout: Duration) -> Result<Vec<u8>, EncodeError> {
        let sample = self
            .appsink
            .try_pull_sample(ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or(EncodeError::NoSample)?;
        let buffer = sample.buffer().ok_or(EncodeError::NoBuffer)?;
        let map = buffer.map_readable().map_err(|_| EncodeError::NoBuffer)?;
        Ok(map.as_slice().to_vec())
    }
}

impl Drop for OpusEncoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(State::Null);
    }
}
