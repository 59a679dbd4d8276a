//! Capture Pipeline public contract: `Start`/`RequestKeyframe`/`Stop`/`Samples`.
//!
//! Ties together portal negotiation, the `PipeWire` video/audio streams, the
//! multi-monitor compositor, and `helix-encode`'s encoder abstraction into
//! the `Off -> Probing -> Encoding -> {Faulted, Off}` state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use helix_encode::{EncoderSpec, OpusEncoder, VideoEncoder};
use helix_wire::CodecId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio_stream::PwAudioStream;
use crate::compositor::{self, FrameCompositor, MonitorInfo};
use crate::frame::{AudioChunk, CaptureEvent};
use crate::pipewire_stream::PwVideoStream;
use crate::portal;

/// Requested capture parameters, supplied by the Edge Server on viewer
/// attach.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSpec {
    /// Client-advertised codec capability bitmask (helix-wire §6.3).
    pub codec_bitmask: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub target_fps: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub bitrate_ceiling_kbps: u32,
}

/// One encoded sample produced by the pipeline.
#[derive(Debug, Clone)]
pub enum CaptureSample {
    Video {
        codec: CodecId,
        is_keyframe: bool,
        pts_us: u64,
        width: u16,
        height: u16,
        payload: Vec<u8>,
    },
    Audio {
        pts_us: u64,
        channels: u8,
        payload: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no codec satisfies both the host encoders and the client's capability bits")]
    NoCompatibleCodec,
    #[error("the compositor or audio graph is not yet available")]
    SourceUnavailable,
    #[error("video encoder faulted")]
    EncoderFault,
    #[error("sample sink backpressure sustained")]
    Overrun,
}

/// The host's only supported codec family is H.264, produced by every
/// backend in `EncoderKind::PRIORITY`. HEVC/AV1 bits in `codec_bitmask` never
/// match; see DESIGN.md's disposition of this Open Question.
const HOST_CODEC_PRIORITY: &[CodecId] = &[CodecId::H264];

/// A live handle to a running capture pipeline. Dropping this stops it.
pub struct CaptureHandle {
    codec: CodecId,
    keyframe_requested: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    samples: mpsc::Receiver<CaptureSample>,
}

impl CaptureHandle {
    #[must_use]
    pub const fn negotiated_codec(&self) -> CodecId {
        self.codec
    }

    /// Idempotent: causes the next emitted video access unit to be a
    /// keyframe.
    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::SeqCst);
    }

    /// Tears the pipeline down. Safe to call any number of times.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Receive the next sample. Returns `None` once `Stop` has been called
    /// or the upstream source has permanently failed. Not restartable — call
    /// [`start`] again for a fresh sequence.
    pub async fn next_sample(&mut self) -> Option<CaptureSample> {
        self.samples.recv().await
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the background encode task, kept alive for as long as the
/// task runs so the `PipeWire` capture threads don't get dropped mid-stream.
struct EncodeTaskState {
    codec: CodecId,
    video_encoder: VideoEncoder,
    audio_encoder: Option<OpusEncoder>,
    _video_streams: Vec<PwVideoStream>,
    _audio_stream: Option<PwAudioStream>,
}

/// Negotiate codec, probe sources, and start the encode pipeline.
///
/// On success, guarantees the first video sample delivered through
/// [`CaptureHandle::next_sample`] is a keyframe.
///
/// # Errors
///
/// Returns [`CaptureError::NoCompatibleCodec`] if the client's capability
/// bits don't overlap [`HOST_CODEC_PRIORITY`], or
/// [`CaptureError::SourceUnavailable`] if portal/`PipeWire`/encoder
/// negotiation fails.
pub async fn start(spec: CaptureSpec) -> Result<CaptureHandle, CaptureError> {
    let codec = CodecId::intersect_bitmask(spec.codec_bitmask, HOST_CODEC_PRIORITY)
        .ok_or(CaptureError::NoCompatibleCodec)?;

    let portal_session = portal::request_screencast().await.map_err(|e| {
        tracing::warn!(error = %e, "screencast portal negotiation failed");
        CaptureError::SourceUnavailable
    })?;

    if portal_session.streams.is_empty() {
        return Err(CaptureError::SourceUnavailable);
    }

    let monitor_infos: Vec<MonitorInfo> = portal_session
        .streams
        .iter()
        .map(|s| {
            let (x, y) = s.position.unwrap_or((0, 0));
            let (w, h) = s
                .size
                .unwrap_or((spec.target_width as i32, spec.target_height as i32));
            MonitorInfo {
                node_id: s.node_id,
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                width: w.max(0) as u16,
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                height: h.max(0) as u16,
                x,
                y,
            }
        })
        .collect();

    let mut video_streams = Vec::with_capacity(monitor_infos.len());
    let mut monitor_rxs = Vec::with_capacity(monitor_infos.len());
    for m in &monitor_infos {
        let (stream, rx) = PwVideoStream::start(
            &portal_session.pipewire_fd,
            m.node_id,
            u32::from(m.width),
            u32::from(m.height),
            8,
        )
        .map_err(|e| {
            tracing::error!(error = %e, "failed to start PipeWire video stream");
            CaptureError::SourceUnavailable
        })?;
        video_streams.push(stream);
        monitor_rxs.push(rx);
    }

    let (compositor, composed_rx) = FrameCompositor::new(&monitor_infos, monitor_rxs, 4);
    tokio::spawn(compositor.run());

    let (coded_width, coded_height) =
        bounding_box_or(&monitor_infos, spec.target_width, spec.target_height);

    let video_encoder = VideoEncoder::new(EncoderSpec {
        width: coded_width,
        height: coded_height,
        framerate: spec.target_fps,
        bitrate_kbps: spec.bitrate_ceiling_kbps,
        preferred: None,
    })
    .map_err(|e| {
        tracing::error!(error = %e, "failed to start video encoder");
        CaptureError::SourceUnavailable
    })?;

    let audio: Option<(PwAudioStream, mpsc::Receiver<AudioChunk>, OpusEncoder)> =
        match PwAudioStream::start(spec.audio_channels, spec.audio_sample_rate, 8) {
            Ok((stream, rx)) => {
                match OpusEncoder::new(spec.audio_sample_rate, u32::from(spec.audio_channels), 64_000) {
                    Ok(encoder) => Some((stream, rx, encoder)),
                    Err(e) => {
                        tracing::warn!(error = %e, "audio encoder unavailable, streaming video only");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "audio capture unavailable, streaming video only");
                None
            }
        };

    let (audio_stream, audio_rx, audio_encoder) = match audio {
        Some((s, r, e)) => (Some(s), Some(r), Some(e)),
        None => (None, None, None),
    };

    let (sample_tx, sample_rx) = mpsc::channel(16);
    let keyframe_requested = Arc::new(AtomicBool::new(true)); // forces first sample to be a keyframe
    let stopped = Arc::new(AtomicBool::new(false));

    let state = EncodeTaskState {
        codec,
        video_encoder,
        audio_encoder,
        _video_streams: video_streams,
        _audio_stream: audio_stream,
    };

    let task = tokio::spawn(run_encode_loop(
        state,
        composed_rx,
        audio_rx,
        sample_tx,
        Arc::clone(&keyframe_requested),
        Arc::clone(&stopped),
    ));

    Ok(CaptureHandle {
        codec,
        keyframe_requested,
        stopped,
        task: Some(task),
        samples: sample_rx,
    })
}

fn bounding_box_or(monitors: &[MonitorInfo], fallback_w: u32, fallback_h: u32) -> (u32, u32) {
    let (w, h) = compositor::bounding_box(monitors);
    if w == 0 || h == 0 {
        (fallback_w, fallback_h)
    } else {
        (u32::from(w), u32::from(h))
    }
}

async fn run_encode_loop(
    mut state: EncodeTaskState,
    mut video_rx: mpsc::Receiver<CaptureEvent>,
    mut audio_rx: Option<mpsc::Receiver<AudioChunk>>,
    sample_tx: mpsc::Sender<CaptureSample>,
    keyframe_requested: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
) {
    let (coded_w, coded_h) = state.video_encoder.dimensions();
    let mut consecutive_faults = 0u32;

    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            event = video_rx.recv() => {
                let Some(event) = event else { break };
                let (CaptureEvent::Frame(frame) | CaptureEvent::FrameAndCursor(frame, _)) = event else {
                    continue;
                };
                if keyframe_requested.swap(false, Ordering::SeqCst) {
                    state.video_encoder.force_keyframe();
                }
                if state.video_encoder.encode_frame(&frame.data).is_err() {
                    tracing::warn!("failed to push frame into video encoder");
                    continue;
                }
                match state.video_encoder.pull_encoded(Duration::from_millis(50)) {
                    Ok(sample) => {
                        if state.video_encoder.has_error() {
                            consecutive_faults += 1;
                            if consecutive_faults > 3 {
                                tracing::error!("video encoder persistently faulted");
                                break;
                            }
                            state.video_encoder.force_keyframe();
                        } else {
                            consecutive_faults = 0;
                        }
                        let pts_us = sample.pts.map_or(0, |p| p.useconds());
                        let msg = CaptureSample::Video {
                            codec: state.codec,
                            is_keyframe: sample.is_keyframe,
                            pts_us,
                            #[allow(clippy::cast_possible_truncation)]
                            width: coded_w as u16,
                            #[allow(clippy::cast_possible_truncation)]
                            height: coded_h as u16,
                            payload: sample.data,
                        };
                        if sample_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => continue,
                }
            }
            chunk = recv_audio(&mut audio_rx) => {
                let Some(chunk) = chunk else { continue };
                let Some(encoder) = state.audio_encoder.as_ref() else { continue };
                if encoder.encode_chunk(&chunk.data).is_err() {
                    continue;
                }
                if let Ok(payload) = encoder.pull_encoded(Duration::from_millis(50)) {
                    let msg = CaptureSample::Audio {
                        pts_us: chunk.sequence * 1_000_000 / u64::from(chunk.sample_rate.max(1)),
                        #[allow(clippy::cast_possible_truncation)]
                        channels: chunk.channels as u8,
                        payload,
                    };
                    if sample_tx.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn recv_audio(rx: &mut Option<mpsc::Receiver<AudioChunk>>) -> Option<AudioChunk> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_codec_priority_is_h264_only() {
        assert_eq!(HOST_CODEC_PRIORITY, &[CodecId::H264]);
    }
}
