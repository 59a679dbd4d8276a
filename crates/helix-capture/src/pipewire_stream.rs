//! `PipeWire` video stream handler.
//!
//! Mirrors [`crate::audio_stream`]'s dedicated-thread-plus-`MainLoop` shape:
//! each monitor gets its own `PipeWire` stream connected over the portal's
//! shared remote fd, negotiated for `BGRx` and delivering frames (plus
//! damage/cursor metadata extracted via [`crate::spa_meta`]) on a tokio mpsc
//! channel.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use pipewire as pw;
use pw::properties::properties;
use pw::stream::{Stream, StreamFlags, StreamState};
use tokio::sync::mpsc;

use crate::frame::{CaptureEvent, CapturedFrame, PixelFormat};
use crate::spa_meta;

/// Handle to a running `PipeWire` video capture stream for one monitor node.
///
/// Dropping this stops the capture thread.
pub struct PwVideoStream {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for PwVideoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PwVideoStream")
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PwVideoStream {
    /// Start capturing `node_id` from the `ScreenCast` portal's `PipeWire`
    /// remote, connected through `pipewire_fd`. `width`/`height` are the
    /// stream dimensions advertised by the portal for this node.
    ///
    /// # Errors
    ///
    /// Returns [`VideoCaptureError`] if the capture thread cannot be
    /// spawned.
    pub fn start(
        pipewire_fd: &OwnedFd,
        node_id: u32,
        width: u32,
        height: u32,
        channel_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<CaptureEvent>), VideoCaptureError> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let raw_fd = pipewire_fd.as_raw_fd();

        let thread = std::thread::Builder::new()
            .name(format!("pw-video-{node_id}"))
            .spawn(move || {
                if let Err(e) = run_video_loop(raw_fd, node_id, width, height, tx, running_clone) {
                    tracing::error!(node_id, "PipeWire video thread exited with error: {e}");
                }
            })
            .map_err(VideoCaptureError::SpawnThread)?;

        Ok((
            Self {
                running,
                thread: Some(thread),
            },
            rx,
        ))
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PwVideoStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::needless_pass_by_value, clippy::too_many_arguments)]
fn run_video_loop(
    pipewire_fd: RawFd,
    node_id: u32,
    width: u32,
    height: u32,
    frame_tx: mpsc::Sender<CaptureEvent>,
    running: Arc<AtomicBool>,
) -> Result<(), VideoCaptureError> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None).map_err(|_| VideoCaptureError::MainLoop)?;
    let context = pw::context::Context::new(&mainloop).map_err(|_| VideoCaptureError::Context)?;

    // Safety: `pipewire_fd` is the portal-provided remote fd, owned by the
    // caller for the lifetime of this thread.
    let core =
        unsafe { context.connect_fd(pipewire_fd, None) }.map_err(|_| VideoCaptureError::Connect)?;

    let stream = Stream::new(
        &core,
        "helix-rdsc-video",
        properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )
    .map_err(|_| VideoCaptureError::CreateStream)?;

    let sequence = Arc::new(AtomicU64::new(0));
    let seq_clone = Arc::clone(&sequence);

    let _listener = stream
        .add_local_listener_with_user_data(frame_tx)
        .state_changed(move |_stream, _tx, old, new| {
            tracing::debug!(node_id, "PipeWire video stream state: {old:?} -> {new:?}");
            if matches!(new, StreamState::Error(_)) {
                tracing::error!(node_id, "PipeWire video stream entered error state");
            }
        })
        .process(move |stream_ref, tx| {
            process_video(stream_ref, tx, &seq_clone, width, height);
        })
        .register()
        .map_err(|_| VideoCaptureError::RegisterListener)?;

    let video_info = pw::spa::param::video::VideoInfoRaw::new();
    let values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pw::spa::pod::Value::Object(pw::spa::pod::Object {
            type_: pw::spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
            id: pw::spa::param::ParamType::EnumFormat.as_raw(),
            properties: video_info.into(),
        }),
    )
    .map_err(|_| VideoCaptureError::CreateStream)?
    .0
    .into_inner();

    let mut params = [pw::spa::pod::Pod::from_bytes(&values).expect("valid pod")];

    stream
        .connect(
            pw::spa::utils::Direction::Input,
            Some(node_id),
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut params,
        )
        .map_err(|_| VideoCaptureError::StreamConnect)?;

    tracing::info!(node_id, width, height, "PipeWire video stream connected");

    while running.load(Ordering::SeqCst) {
        mainloop.loop_().iterate(std::time::Duration::from_millis(8));
    }

    tracing::info!(node_id, "PipeWire video main loop exiting");
    Ok(())
}

/// Process a single video buffer, extracting pixel data plus any damage
/// and cursor metadata the compositor attached.
fn process_video(
    stream: &pw::stream::StreamRef,
    tx: &mut mpsc::Sender<CaptureEvent>,
    sequence: &AtomicU64,
    width: u32,
    height: u32,
) {
    let Some(mut buffer) = stream.dequeue_buffer() else {
        return;
    };

    // Safety: the buffer is dequeued and valid for the duration of this
    // callback; `as_raw_ptr` exposes the underlying `spa_buffer` pointer
    // because `pipewire-rs` does not expose SPA metadata directly.
    let spa_buffer = unsafe { (*buffer.as_raw_ptr()).buffer };
    let damage = unsafe { spa_meta::extract_damage(spa_buffer) };
    let cursor = unsafe { spa_meta::extract_cursor(spa_buffer) };

    let datas = buffer.datas_mut();
    if datas.is_empty() {
        if let Some(cursor) = cursor {
            let _ = tx.try_send(CaptureEvent::Cursor(cursor));
        }
        return;
    }

    let data = &mut datas[0];
    let chunk = data.chunk();
    let size = chunk.size() as usize;
    #[allow(clippy::cast_sign_loss)]
    let stride = chunk.stride().max(0) as u32;

    let Some(slice) = data.data() else {
        return;
    };
    if size == 0 || size > slice.len() {
        return;
    }

    let seq = sequence.fetch_add(1, Ordering::Relaxed);
    let mut frame = CapturedFrame {
        data: slice[..size].to_vec(),
        width,
        height,
        format: PixelFormat::Bgra,
        stride: if stride > 0 { stride } else { width * 4 },
        sequence: seq,
        damage,
    };
    frame.ensure_alpha_opaque();

    let event = match cursor {
        Some(cursor) => CaptureEvent::FrameAndCursor(frame, cursor),
        None => CaptureEvent::Frame(frame),
    };

    if tx.try_send(event).is_err() {
        tracing::trace!(sequence = seq, "Video channel full, dropping frame");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VideoCaptureError {
    #[error("failed to create PipeWire MainLoop")]
    MainLoop,
    #[error("failed to create PipeWire Context")]
    Context,
    #[error("failed to connect to PipeWire remote")]
    Connect,
    #[error("failed to create PipeWire video Stream")]
    CreateStream,
    #[error("failed to register video stream listener")]
    RegisterListener,
    #[error("failed to connect video stream")]
    StreamConnect,
    #[error("failed to spawn PipeWire video thread")]
    SpawnThread(#[source] std::io::Error),
}
