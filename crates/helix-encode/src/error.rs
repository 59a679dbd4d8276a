//! Error types for encoder detection and the GStreamer pipelines.

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("no usable video encoder found on this host")]
    NoEncoderAvailable,
    #[error("failed to build GStreamer pipeline: {0}")]
    PipelineBuild(String),
    #[error("failed to start GStreamer pipeline: {0}")]
    PipelineStart(#[source] gstreamer::glib::BoolError),
    #[error("failed to link GStreamer elements: {0}")]
    Link(#[source] gstreamer::glib::BoolError),
    #[error("failed to push buffer into appsrc")]
    Push,
    #[error("encoder pipeline reported an error on its bus")]
    PipelineFault,
    #[error("appsink returned no sample")]
    NoSample,
    #[error("sample had no buffer")]
    NoBuffer,
}
