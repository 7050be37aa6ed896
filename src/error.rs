use std::path::PathBuf;
use thiserror::Error;

/// Fatal session errors. Every variant aborts the current image or
/// video session; none of them are retried here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("detector failure: {0}")]
    Detection(#[source] anyhow::Error),

    #[error("input stream unreadable: {0}")]
    Decode(String),

    #[error("no usable codec, tried: {0}")]
    CodecInit(String),

    #[error("frame write failed at frame {frame_index}")]
    Encode {
        frame_index: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("output file missing or empty: {}", .0.display())]
    Verification(PathBuf),
}

pub type SessionResult<T> = std::result::Result<T, PipelineError>;
