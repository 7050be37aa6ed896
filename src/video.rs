// src/video.rs

use crate::error::{PipelineError, SessionResult};
use crate::types::Frame;
use anyhow::Result;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTraitConst, VideoWriter},
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Stream metadata read once at OPENING.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub frame_count: i64,
}

/// A readable stream of decoded frames.
pub trait FrameSource {
    fn info(&self) -> StreamInfo;

    /// `Ok(None)` at end of stream; decode errors are fatal.
    fn read(&mut self) -> SessionResult<Option<Mat>>;
}

/// A writable annotated-frame stream.
pub trait FrameSink {
    fn write(&mut self, frame: &Mat) -> Result<()>;

    /// Releases the handle and verifies the produced output.
    fn finish(&mut self) -> SessionResult<()>;
}

/// Encoder capability: yields a usable sink for one codec candidate,
/// or nothing if that codec cannot be initialized.
pub trait SinkFactory {
    fn open(
        &self,
        path: &Path,
        codec: &CodecCandidate,
        fps: f64,
        size: core::Size,
    ) -> Result<Option<Box<dyn FrameSink>>>;
}

#[derive(Debug, Clone, Copy)]
pub struct CodecCandidate {
    pub fourcc: &'static str,
    pub description: &'static str,
}

/// Preference order: best playback compatibility first. The first
/// candidate that yields a writable handle is adopted.
pub const DEFAULT_CODECS: [CodecCandidate; 3] = [
    CodecCandidate {
        fourcc: "avc1",
        description: "H.264",
    },
    CodecCandidate {
        fourcc: "mp4v",
        description: "MPEG-4",
    },
    CodecCandidate {
        fourcc: "XVID",
        description: "Xvid",
    },
];

/// `<output_dir>/processed_<stem>.mp4`. The container extension is
/// always rewritten to the canonical one so downstream playback gets
/// a single known container/codec combination.
pub fn derive_output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    output_dir.join(format!("processed_{}.mp4", stem))
}

/// BGR `Mat` to the tightly-packed RGB buffer the detectors consume.
pub fn mat_to_rgb(mat: &Mat) -> Result<Frame> {
    let mut rgb_mat = Mat::default();
    imgproc::cvt_color(mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)?;

    Ok(Frame {
        data: rgb_mat.data_bytes()?.to_vec(),
        width: mat.cols() as usize,
        height: mat.rows() as usize,
    })
}

pub struct OpenCvSource {
    cap: VideoCapture,
    info: StreamInfo,
}

impl OpenCvSource {
    pub fn open(path: &Path) -> SessionResult<Self> {
        info!("Opening video: {}", path.display());

        let cap = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        if !cap
            .is_opened()
            .map_err(|e| PipelineError::Decode(e.to_string()))?
        {
            return Err(PipelineError::Decode(format!(
                "could not open {}",
                path.display()
            )));
        }

        let get = |prop: i32| -> SessionResult<f64> {
            VideoCaptureTraitConst::get(&cap, prop).map_err(|e| PipelineError::Decode(e.to_string()))
        };
        let info = StreamInfo {
            width: get(videoio::CAP_PROP_FRAME_WIDTH)? as i32,
            height: get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32,
            fps: get(videoio::CAP_PROP_FPS)?,
            frame_count: get(videoio::CAP_PROP_FRAME_COUNT)? as i64,
        };

        info!(
            "Video properties: {}x{} @ {:.1} FPS, {} frames",
            info.width, info.height, info.fps, info.frame_count
        );

        Ok(Self { cap, info })
    }
}

impl FrameSource for OpenCvSource {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read(&mut self) -> SessionResult<Option<Mat>> {
        use opencv::videoio::VideoCaptureTrait;

        let mut mat = Mat::default();
        let got = VideoCaptureTrait::read(&mut self.cap, &mut mat)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        if !got || mat.empty() {
            return Ok(None);
        }
        Ok(Some(mat))
    }
}

pub struct OpenCvSink {
    writer: VideoWriter,
    path: PathBuf,
}

impl FrameSink for OpenCvSink {
    fn write(&mut self, frame: &Mat) -> Result<()> {
        use opencv::videoio::VideoWriterTrait;
        self.writer.write(frame)?;
        Ok(())
    }

    fn finish(&mut self) -> SessionResult<()> {
        use opencv::videoio::VideoWriterTrait;
        self.writer
            .release()
            .map_err(|e| PipelineError::Encode {
                frame_index: 0,
                source: e.into(),
            })?;

        // The writer may report success and still leave nothing usable
        // behind; check the file itself.
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(PipelineError::Verification(self.path.clone())),
        }
    }
}

pub struct OpenCvSinkFactory;

impl SinkFactory for OpenCvSinkFactory {
    fn open(
        &self,
        path: &Path,
        codec: &CodecCandidate,
        fps: f64,
        size: core::Size,
    ) -> Result<Option<Box<dyn FrameSink>>> {
        let chars: Vec<char> = codec.fourcc.chars().collect();
        anyhow::ensure!(chars.len() == 4, "fourcc must be four characters");

        let fourcc = VideoWriter::fourcc(chars[0], chars[1], chars[2], chars[3])?;
        let writer = VideoWriter::new(&path.to_string_lossy(), fourcc, fps, size, true)?;

        if !writer.is_opened()? {
            return Ok(None);
        }

        Ok(Some(Box::new(OpenCvSink {
            writer,
            path: path.to_path_buf(),
        })))
    }
}
