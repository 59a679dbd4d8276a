//! Per-viewer session: negotiates a Capture Pipeline, forwards encoded
//! samples as wire messages, and routes inbound input back through the
//! shared [`EiInput`] injector.
//!
//! One task per viewer substream, spawned from `tunnel.rs`'s
//! `on_viewer_open` callback. A viewer's encoder session is entirely its
//! own — `helix-capture::pipeline::start` is called once per attach, never
//! shared across viewers (`spec.md` §9: no shared-encoder fan-out in this
//! cut).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use helix_capture::pipeline::{CaptureError, CaptureSample, CaptureSpec};
use helix_input::libei::{EiInput, MouseButton};
use helix_wire::{Message, StreamErrorReason};
use tokio::sync::{mpsc, Mutex};

use crate::config::EdgeConfig;
use crate::tunnel::{TrySendOutcome, ViewerOutbound};

/// Negotiation parameters carried as the viewer substream's first item, a
/// plain query string (`spec.md` §6.3: `codecs=<bitmask>&w=<int>&h=<int>
/// &fps=<int>&touch=<0|1>`) forwarded verbatim by the Control Gateway from
/// the original WebSocket upgrade request.
struct Negotiation {
    codec_bitmask: u32,
    width: u32,
    height: u32,
    fps: u32,
    touch: bool,
}

fn parse_negotiation(raw: &[u8], defaults: &EdgeConfig) -> Negotiation {
    let raw = String::from_utf8_lossy(raw);
    let mut n = Negotiation {
        codec_bitmask: 1, // bit 0 = H264; assume viewer supports it if unspecified
        width: defaults.default_width,
        height: defaults.default_height,
        fps: defaults.default_fps,
        touch: false,
    };
    for pair in raw.trim_start_matches('?').split('&') {
        let Some((key, value)) = pair.split_once('=') else { continue };
        match key {
            "codecs" => n.codec_bitmask = value.parse().unwrap_or(n.codec_bitmask),
            "w" => n.width = value.parse().unwrap_or(n.width),
            "h" => n.height = value.parse().unwrap_or(n.height),
            "fps" => n.fps = value.parse().unwrap_or(n.fps),
            "touch" => n.touch = value.trim() == "1",
            _ => {}
        }
    }
    n
}

/// Count of recent malformed inbound frames in a sliding one-second window
/// (`spec.md` §4.2 malformed-frame rate limit).
struct MalformedRateLimiter {
    limit: u32,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl MalformedRateLimiter {
    fn new(limit: u32) -> Self {
        Self { limit, window: Duration::from_secs(1), hits: VecDeque::new() }
    }

    /// Records one malformed frame and reports whether the limit was
    /// exceeded within the trailing window.
    fn record_and_check(&mut self) -> bool {
        let now = Instant::now();
        while matches!(self.hits.front(), Some(t) if now.duration_since(*t) > self.window) {
            self.hits.pop_front();
        }
        self.hits.push_back(now);
        self.hits.len() as u32 > self.limit
    }
}

/// One queued, already-encoded wire message awaiting a non-blocking send
/// attempt. `is_keyframe` is only meaningful for video entries; it's what
/// lets the backpressure gate tell a droppable delta from a frame it must
/// keep.
struct QueuedFrame {
    is_keyframe: bool,
    bytes: Bytes,
}

/// Per-viewer send-queue depth monitor (`spec.md` §5 "Backpressure"): once
/// the video queue holds more than `Q_HIGH` frames for more than
/// `SUSTAINED` wall-clock time, the caller drops every buffered
/// non-keyframe frame, asks the Capture Pipeline for a fresh keyframe, and
/// resumes forwarding from there.
struct BackpressureGate {
    high_since: Option<Instant>,
}

impl BackpressureGate {
    const Q_HIGH: usize = 8;
    const SUSTAINED: Duration = Duration::from_millis(250);

    fn new() -> Self {
        Self { high_since: None }
    }

    /// Reports whether sustained backpressure has just been confirmed for
    /// the given queue depth. Resets its own timer once depth drops back
    /// to normal.
    fn observe(&mut self, depth: usize) -> bool {
        if depth > Self::Q_HIGH {
            let now = Instant::now();
            let since = *self.high_since.get_or_insert(now);
            now.duration_since(since) >= Self::SUSTAINED
        } else {
            self.high_since = None;
            false
        }
    }
}

/// Drains as many queued frames as the tunnel writer will currently accept
/// without blocking. Returns `false` once the outbound channel is closed —
/// the caller should stop trying to serve this viewer.
fn drain_queue(outbound: &ViewerOutbound, queue: &mut VecDeque<QueuedFrame>) -> bool {
    while let Some(front) = queue.front() {
        match outbound.try_send(front.bytes.clone()) {
            TrySendOutcome::Sent => {
                queue.pop_front();
            }
            TrySendOutcome::Full => break,
            TrySendOutcome::Closed => return false,
        }
    }
    true
}

/// Audio is never intentionally delayed for backpressure (`spec.md` §5: "it
/// is cheap"), but an unbounded queue under a persistently slow viewer would
/// still grow forever, so it gets its own smaller cap: once more than 40
/// frames are buffered, the oldest half are dropped silently.
const AUDIO_QUEUE_CAP: usize = 40;

fn cap_audio_queue(queue: &mut VecDeque<QueuedFrame>) {
    if queue.len() > AUDIO_QUEUE_CAP {
        let drop_count = queue.len() / 2;
        for _ in 0..drop_count {
            queue.pop_front();
        }
    }
}

/// Drives one viewer end to end until the tunnel substream or Capture
/// Pipeline ends. Never returns early on a recoverable error — always sends
/// a `StreamError` frame first so the browser can distinguish retryable
/// from fatal failures (`spec.md` §6.2).
#[allow(clippy::too_many_lines)]
pub async fn run(
    mut inbox: mpsc::Receiver<Bytes>,
    outbound: ViewerOutbound,
    ei_input: Arc<Mutex<EiInput>>,
    config: Arc<EdgeConfig>,
    screenshot_cache: Arc<crate::screenshot::ScreenshotCache>,
) {
    let Some(first_item) = inbox.recv().await else {
        return;
    };
    let negotiation = parse_negotiation(&first_item, &config);

    let spec = CaptureSpec {
        codec_bitmask: negotiation.codec_bitmask,
        target_width: negotiation.width,
        target_height: negotiation.height,
        target_fps: negotiation.fps,
        audio_sample_rate: config.default_audio_sample_rate,
        audio_channels: config.default_audio_channels,
        bitrate_ceiling_kbps: config.default_bitrate_ceiling_kbps,
    };

    let mut handle = match helix_capture::pipeline::start(spec).await {
        Ok(handle) => handle,
        Err(e) => {
            let reason = match e {
                CaptureError::NoCompatibleCodec => StreamErrorReason::NoCompatibleCodec,
                CaptureError::SourceUnavailable | CaptureError::Overrun => StreamErrorReason::SessionNotReady,
                CaptureError::EncoderFault => StreamErrorReason::EncoderFault,
            };
            send_error(&outbound, reason, &e.to_string()).await;
            return;
        }
    };

    let stream_init = Message::StreamInit {
        codec: handle.negotiated_codec(),
        #[allow(clippy::cast_possible_truncation)]
        width: negotiation.width as u16,
        #[allow(clippy::cast_possible_truncation)]
        height: negotiation.height as u16,
        #[allow(clippy::cast_possible_truncation)]
        fps: negotiation.fps as u8,
        #[allow(clippy::cast_possible_truncation)]
        audio_channels: config.default_audio_channels as u8,
        sample_rate: config.default_audio_sample_rate,
        touch_support: negotiation.touch,
    };
    if !outbound.send(stream_init.encode().freeze()).await {
        return;
    }

    let mut video_started = false;
    let mut rate_limiter = MalformedRateLimiter::new(config.malformed_rate_limit_per_sec);
    let stall_timeout = Duration::from_secs(config.stall_timeout_secs);
    let mut last_progress = Instant::now();

    let mut video_queue: VecDeque<QueuedFrame> = VecDeque::new();
    let mut audio_queue: VecDeque<QueuedFrame> = VecDeque::new();
    let mut bp_gate = BackpressureGate::new();
    // Drains both queues on a short tick so a slow tunnel writer that frees
    // up capacity between capture samples still gets serviced promptly,
    // without the viewer task blocking on `send` and going unresponsive to
    // new inbound input in the meantime.
    let mut drain_tick = tokio::time::interval(Duration::from_millis(5));

    loop {
        tokio::select! {
            sample = handle.next_sample() => {
                match sample {
                    Some(CaptureSample::Video { codec, is_keyframe, pts_us, width, height, payload }) => {
                        if !video_started {
                            if !is_keyframe {
                                // Shouldn't happen — `pipeline::start` guarantees the
                                // first sample is a keyframe — but gate defensively
                                // rather than forward a delta frame with no reference.
                                continue;
                            }
                            video_started = true;
                        }
                        last_progress = Instant::now();
                        if is_keyframe {
                            let cache = Arc::clone(&screenshot_cache);
                            let payload_for_cache = payload.clone();
                            tokio::spawn(crate::screenshot::update_from_keyframe(cache, payload_for_cache, u32::from(width), u32::from(height)));
                        }
                        let msg = Message::VideoFrame { codec, is_keyframe, pts_us, width, height, payload: Bytes::from(payload) };
                        video_queue.push_back(QueuedFrame { is_keyframe, bytes: msg.encode().freeze() });
                        if !drain_queue(&outbound, &mut video_queue) {
                            break;
                        }
                        if bp_gate.observe(video_queue.len()) {
                            tracing::debug!(depth = video_queue.len(), "sustained video backpressure, dropping buffered deltas");
                            video_queue.clear();
                            handle.request_keyframe();
                            video_started = false;
                        }
                    }
                    Some(CaptureSample::Audio { pts_us, channels, payload }) => {
                        last_progress = Instant::now();
                        let msg = Message::AudioFrame { pts_us, channels, payload: Bytes::from(payload) };
                        audio_queue.push_back(QueuedFrame { is_keyframe: false, bytes: msg.encode().freeze() });
                        cap_audio_queue(&mut audio_queue);
                        if !drain_queue(&outbound, &mut audio_queue) {
                            break;
                        }
                    }
                    None => {
                        send_error(&outbound, StreamErrorReason::EncoderFault, "capture pipeline ended").await;
                        break;
                    }
                }
            }

            item = inbox.recv() => {
                let Some(item) = item else {
                    break;
                };
                last_progress = Instant::now();
                match Message::decode(item) {
                    Ok(msg) => handle_inbound(msg, &handle, &outbound, &ei_input).await,
                    Err(e) => {
                        tracing::debug!(error = %e, "malformed inbound viewer frame");
                        if rate_limiter.record_and_check() {
                            send_error(&outbound, StreamErrorReason::MalformedProtocol, "malformed frame rate exceeded").await;
                            break;
                        }
                    }
                }
            }

            _ = drain_tick.tick() => {
                if !drain_queue(&outbound, &mut video_queue) || !drain_queue(&outbound, &mut audio_queue) {
                    break;
                }
                if bp_gate.observe(video_queue.len()) {
                    tracing::debug!(depth = video_queue.len(), "sustained video backpressure, dropping buffered deltas");
                    video_queue.clear();
                    handle.request_keyframe();
                    video_started = false;
                }
            }

            () = tokio::time::sleep(stall_timeout) => {
                if last_progress.elapsed() >= stall_timeout {
                    tracing::info!("viewer stalled, closing");
                    break;
                }
            }
        }
    }

    handle.stop();
    outbound.close().await;
}

async fn handle_inbound(
    msg: Message,
    handle: &helix_capture::pipeline::CaptureHandle,
    outbound: &ViewerOutbound,
    ei_input: &Arc<Mutex<EiInput>>,
) {
    match msg {
        Message::Keyboard { is_down, keycode, .. } => {
            #[allow(clippy::cast_possible_truncation)]
            let code = (keycode & 0x00FF) as u8;
            let extended = keycode & 0xFF00 != 0;
            let mut input = ei_input.lock().await;
            if is_down {
                input.key_press(code, extended);
            } else {
                input.key_release(code, extended);
            }
        }
        Message::MouseButton { is_down, button } => {
            let Some(btn) = wire_button_to_mouse_button(button) else { return };
            ei_input.lock().await.mouse_button(btn, is_down);
        }
        Message::WheelHiRes { dx, dy } => {
            ei_input.lock().await.scroll(i32::from(dx), i32::from(dy));
        }
        Message::WheelLoRes { dx, dy } => {
            ei_input.lock().await.scroll(i32::from(dx), i32::from(dy));
        }
        Message::MouseAbsolute { x, y, .. } => {
            #[allow(clippy::cast_sign_loss)]
            let (x, y) = (x.max(0) as u16, y.max(0) as u16);
            ei_input.lock().await.mouse_move(x, y);
        }
        Message::MouseRelative { dx, dy } => {
            ei_input.lock().await.mouse_rel_move(i32::from(dx), i32::from(dy));
        }
        Message::Touch { phase, x, y, .. } => {
            // `EiInput` has no multi-touch surface; a single-point proxy onto
            // the pointer device covers the dominant "touch to tap/drag" use
            // case (`spec.md` §4.2's touch-support bit only promises a touch
            // *capability* flag, not multi-touch gestures).
            const TOUCH_DOWN: u8 = 0;
            const TOUCH_UP: u8 = 2;
            #[allow(clippy::cast_sign_loss)]
            let (x, y) = (x.max(0) as u16, y.max(0) as u16);
            let mut input = ei_input.lock().await;
            input.mouse_move(x, y);
            if phase == TOUCH_DOWN {
                input.mouse_button(MouseButton::Left, true);
            } else if phase == TOUCH_UP {
                input.mouse_button(MouseButton::Left, false);
            }
        }
        Message::ControllerEvent { .. } | Message::ControllerState { .. } => {
            // Accepted on the wire but not actuated: the injector has no
            // gamepad/controller surface (`helix-input::libei::EiInput`
            // exposes keyboard/pointer/scroll only).
        }
        Message::Ping { seq, client_us } => {
            #[allow(clippy::cast_possible_truncation)]
            let server_us = std::time::SystemTime::UNIX_EPOCH
                .elapsed()
                .map_or(0, |d| d.as_micros() as u64);
            let pong = Message::Pong { seq, client_us, server_us };
            let _ = outbound.send(pong.encode().freeze()).await;
        }
        Message::ControlMessage { payload } => {
            const REQUEST_KEYFRAME: u8 = 0x01;
            if payload.first() == Some(&REQUEST_KEYFRAME) {
                handle.request_keyframe();
            }
        }
        Message::StreamInit { .. } | Message::StreamError { .. } | Message::VideoFrame { .. } | Message::AudioFrame { .. } => {
            // Server-to-client-only message types received from a viewer are
            // a protocol violation the caller's malformed-rate limiter does
            // not see (they decode successfully) — silently ignored rather
            // than escalated, since it is not distinguishable from a lagged
            // echo on a misbehaving client.
        }
    }
}

fn wire_button_to_mouse_button(button: u8) -> Option<MouseButton> {
    match button {
        0 => Some(MouseButton::Left),
        1 => Some(MouseButton::Right),
        2 => Some(MouseButton::Middle),
        3 => Some(MouseButton::Back),
        4 => Some(MouseButton::Forward),
        _ => None,
    }
}

async fn send_error(outbound: &ViewerOutbound, reason: StreamErrorReason, message: &str) {
    let msg = Message::StreamError { reason, message: message.to_string() };
    let _ = outbound.send(msg.encode().freeze()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_parses_all_fields() {
        let defaults = EdgeConfig::default();
        let n = parse_negotiation(b"codecs=3&w=1280&h=720&fps=30&touch=1", &defaults);
        assert_eq!(n.codec_bitmask, 3);
        assert_eq!(n.width, 1280);
        assert_eq!(n.height, 720);
        assert_eq!(n.fps, 30);
        assert!(n.touch);
    }

    #[test]
    fn negotiation_falls_back_to_defaults_on_missing_fields() {
        let defaults = EdgeConfig::default();
        let n = parse_negotiation(b"codecs=1", &defaults);
        assert_eq!(n.width, defaults.default_width);
        assert_eq!(n.height, defaults.default_height);
        assert!(!n.touch);
    }

    #[test]
    fn malformed_rate_limiter_trips_after_limit() {
        let mut limiter = MalformedRateLimiter::new(3);
        assert!(!limiter.record_and_check());
        assert!(!limiter.record_and_check());
        assert!(!limiter.record_and_check());
        assert!(limiter.record_and_check());
    }

    #[test]
    fn keyframe_gate_skips_leading_delta_frames() {
        // Pure-function form of the gating logic in `run`'s video arm: a
        // delta frame before the first keyframe is dropped, everything from
        // the first keyframe onward passes.
        let incoming = [false, false, true, false, true];
        let mut started = false;
        let mut forwarded = Vec::new();
        for is_keyframe in incoming {
            if !started {
                if !is_keyframe {
                    continue;
                }
                started = true;
            }
            forwarded.push(is_keyframe);
        }
        assert_eq!(forwarded, vec![true, false, true]);
    }

    #[test]
    fn backpressure_gate_stays_quiet_under_q_high() {
        let mut gate = BackpressureGate::new();
        for _ in 0..20 {
            assert!(!gate.observe(BackpressureGate::Q_HIGH));
        }
    }

    #[test]
    fn backpressure_gate_trips_only_after_sustained_overflow() {
        let mut gate = BackpressureGate::new();
        assert!(!gate.observe(BackpressureGate::Q_HIGH + 1));
        std::thread::sleep(Duration::from_millis(10));
        assert!(!gate.observe(BackpressureGate::Q_HIGH + 1));
        std::thread::sleep(BackpressureGate::SUSTAINED);
        assert!(gate.observe(BackpressureGate::Q_HIGH + 1));
    }

    #[test]
    fn backpressure_gate_resets_once_depth_recovers() {
        let mut gate = BackpressureGate::new();
        assert!(!gate.observe(BackpressureGate::Q_HIGH + 1));
        assert!(!gate.observe(BackpressureGate::Q_HIGH));
        std::thread::sleep(BackpressureGate::SUSTAINED);
        assert!(!gate.observe(BackpressureGate::Q_HIGH));
    }

    #[test]
    fn audio_queue_drops_oldest_half_once_over_cap() {
        let mut queue: VecDeque<QueuedFrame> = (0..50)
            .map(|i| QueuedFrame { is_keyframe: false, bytes: Bytes::from(vec![i as u8]) })
            .collect();
        cap_audio_queue(&mut queue);
        assert_eq!(queue.len(), 25);
        // The newest half survives — the oldest (lowest-index) frames were dropped.
        assert_eq!(queue.front().unwrap().bytes, Bytes::from(vec![25u8]));
    }

    #[test]
    fn drain_queue_stops_once_the_channel_reports_full() {
        let (tx, _rx) = mpsc::channel(2);
        let outbound = ViewerOutbound::new_for_test(7, tx);
        let mut queue: VecDeque<QueuedFrame> = (0..5)
            .map(|i| QueuedFrame { is_keyframe: false, bytes: Bytes::from(vec![i as u8]) })
            .collect();
        assert!(drain_queue(&outbound, &mut queue));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn drain_queue_reports_closed_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let outbound = ViewerOutbound::new_for_test(7, tx);
        let mut queue: VecDeque<QueuedFrame> = VecDeque::from([QueuedFrame { is_keyframe: false, bytes: Bytes::new() }]);
        assert!(!drain_queue(&outbound, &mut queue));
    }
}
