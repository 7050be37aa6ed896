// src/session.rs
//
// Image and video session controllers. A session runs start-to-finish
// on the calling thread; every error in the table at error.rs aborts
// the whole session rather than skipping the bad frame, since silently
// dropped frames would corrupt output timing without warning.

use crate::alert::ViolationRecorder;
use crate::annotate;
use crate::association::associate;
use crate::compliance::RequiredGear;
use crate::detector::Detector;
use crate::error::{PipelineError, SessionResult};
use crate::types::{ComplianceResult, ComplianceStatus, PersonEntity};
use crate::video::{mat_to_rgb, CodecCandidate, FrameSink, FrameSource, SinkFactory};
use opencv::{
    core::{self, Mat},
    prelude::*,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const DEFAULT_SAMPLE_STRIDE: u64 = 5;

fn encode_err(frame_index: u64) -> impl FnOnce(anyhow::Error) -> PipelineError {
    move |source| PipelineError::Encode {
        frame_index,
        source,
    }
}

/// Single-frame pipeline: detect persons, detect gear, associate,
/// evaluate, annotate. The frame buffer is annotated in place.
pub fn process_image(
    frame: &mut Mat,
    person_detector: &mut dyn Detector,
    gear_detector: &mut dyn Detector,
    gear: &RequiredGear,
    confidence_threshold: f32,
) -> SessionResult<ComplianceResult> {
    let rgb = mat_to_rgb(frame).map_err(|e| PipelineError::Decode(e.to_string()))?;

    let person_dets = person_detector
        .detect(&rgb, confidence_threshold)
        .map_err(PipelineError::Detection)?;

    if person_dets.is_empty() {
        annotate::draw_no_human_banner(frame).map_err(encode_err(0))?;
        return Ok(ComplianceResult::no_human());
    }

    let mut persons: Vec<PersonEntity> =
        person_dets.iter().map(|d| PersonEntity::new(d.bbox)).collect();

    let items = gear_detector
        .detect(&rgb, confidence_threshold)
        .map_err(PipelineError::Detection)?;

    associate(&mut persons, &items);

    let missing = gear.missing_across(&persons);
    let per_person: Vec<Vec<String>> = persons.iter().map(|p| gear.missing_for(p)).collect();

    // Image mode outlines persons only; item boxes are a video-path
    // rendering.
    annotate::draw_persons(frame, &persons).map_err(encode_err(0))?;
    annotate::draw_compliance_banner(frame, &missing).map_err(encode_err(0))?;

    let mut result = ComplianceResult::from_missing(missing.into_iter().collect());
    result.per_person = per_person;
    Ok(result)
}

pub struct VideoSessionOptions {
    pub output_path: PathBuf,
    pub sample_stride: u64,
    pub codecs: Vec<CodecCandidate>,
    pub confidence_threshold: f32,
}

#[derive(Debug)]
pub struct VideoSummary {
    pub output_path: PathBuf,
    pub result: ComplianceResult,
    pub frames_read: u64,
    pub frames_written: u64,
    pub sampled_frames: u64,
    pub snapshots_written: u64,
    pub codec: &'static str,
}

/// Drives one video start-to-finish: open input, initialize the
/// encoder through the codec fallback chain, stream frames with the
/// sampling stride, accumulate the session-wide missing set, finalize
/// and verify the output.
pub struct VideoSession<'a> {
    opts: VideoSessionOptions,
    person_detector: &'a mut dyn Detector,
    gear_detector: &'a mut dyn Detector,
    gear: &'a RequiredGear,
    recorder: Option<&'a mut ViolationRecorder>,
}

struct StreamState {
    frame_index: u64,
    sampled_frames: u64,
    frames_written: u64,
    snapshots_written: u64,
    /// Running union across sampled frames. Never shrinks: a briefly
    /// missing item stays reported even if later frames are compliant.
    missing_accumulator: BTreeSet<String>,
    persons_seen: bool,
}

impl<'a> VideoSession<'a> {
    pub fn new(
        opts: VideoSessionOptions,
        person_detector: &'a mut dyn Detector,
        gear_detector: &'a mut dyn Detector,
        gear: &'a RequiredGear,
    ) -> Self {
        Self {
            opts,
            person_detector,
            gear_detector,
            gear,
            recorder: None,
        }
    }

    /// Enables the live-alert variant: debounced violation snapshots
    /// on sampled frames.
    pub fn with_recorder(mut self, recorder: &'a mut ViolationRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn run(
        mut self,
        source: &mut dyn FrameSource,
        factory: &dyn SinkFactory,
    ) -> SessionResult<VideoSummary> {
        // ── OPENING ──────────────────────────────────────────────────
        let info = source.info();
        let size = core::Size::new(info.width, info.height);
        let (mut sink, codec) = self.open_sink(factory, info.fps, size)?;

        let mut state = StreamState {
            frame_index: 0,
            sampled_frames: 0,
            frames_written: 0,
            snapshots_written: 0,
            missing_accumulator: BTreeSet::new(),
            persons_seen: false,
        };

        // ── STREAMING ────────────────────────────────────────────────
        // Dropping sink/source on an early return releases the handles
        // of a partially-run session.
        while let Some(mut mat) = source.read()? {
            if state.frame_index % self.opts.sample_stride == 0 {
                state.sampled_frames += 1;
                self.process_sampled_frame(&mut mat, &mut state)?;
            }

            // Every frame is written, sampled or not: output stays
            // frame-count-identical and temporally aligned with input.
            sink.write(&mat).map_err(encode_err(state.frame_index))?;
            state.frames_written += 1;
            state.frame_index += 1;

            if state.frame_index % 100 == 0 {
                info!(
                    "Processed {}/{} frames",
                    state.frame_index, info.frame_count
                );
            }
        }

        // ── FINALIZING ───────────────────────────────────────────────
        sink.finish()?;

        let result = self.summarize(&state);
        info!(
            "✓ Video session complete: {} frames, {} sampled, status {:?}",
            state.frames_written, state.sampled_frames, result.status
        );

        Ok(VideoSummary {
            output_path: self.opts.output_path,
            result,
            frames_read: state.frame_index,
            frames_written: state.frames_written,
            sampled_frames: state.sampled_frames,
            snapshots_written: state.snapshots_written,
            codec,
        })
    }

    fn open_sink(
        &self,
        factory: &dyn SinkFactory,
        fps: f64,
        size: core::Size,
    ) -> SessionResult<(Box<dyn FrameSink>, &'static str)> {
        for codec in &self.opts.codecs {
            match factory.open(&self.opts.output_path, codec, fps, size) {
                Ok(Some(sink)) => {
                    info!("✓ Video writer initialized with {} codec", codec.description);
                    return Ok((sink, codec.description));
                }
                Ok(None) => debug!("Codec {} not available, trying next", codec.description),
                Err(e) => warn!("Codec {} failed to initialize: {}", codec.description, e),
            }
        }

        // A refused writer can still leave an empty container behind
        let _ = std::fs::remove_file(&self.opts.output_path);

        let tried = self
            .opts
            .codecs
            .iter()
            .map(|c| c.fourcc)
            .collect::<Vec<_>>()
            .join(", ");
        Err(PipelineError::CodecInit(tried))
    }

    fn process_sampled_frame(&mut self, mat: &mut Mat, state: &mut StreamState) -> SessionResult<()> {
        let frame_index = state.frame_index;
        let rgb = mat_to_rgb(mat).map_err(|e| PipelineError::Decode(e.to_string()))?;

        let person_dets = self
            .person_detector
            .detect(&rgb, self.opts.confidence_threshold)
            .map_err(PipelineError::Detection)?;

        if person_dets.is_empty() {
            // Items are not checked and nothing enters the accumulator
            annotate::draw_no_human_banner(mat).map_err(encode_err(frame_index))?;
            return Ok(());
        }
        state.persons_seen = true;

        let mut persons: Vec<PersonEntity> =
            person_dets.iter().map(|d| PersonEntity::new(d.bbox)).collect();

        let items = self
            .gear_detector
            .detect(&rgb, self.opts.confidence_threshold)
            .map_err(PipelineError::Detection)?;

        associate(&mut persons, &items);

        let missing = self.gear.missing_across(&persons);
        state.missing_accumulator.extend(missing.iter().cloned());

        annotate::draw_persons(mat, &persons).map_err(encode_err(frame_index))?;
        annotate::draw_items(mat, &items).map_err(encode_err(frame_index))?;
        annotate::draw_compliance_banner(mat, &missing).map_err(encode_err(frame_index))?;

        if let Some(recorder) = self.recorder.as_deref_mut() {
            let written = recorder
                .maybe_snapshot(mat, &missing)
                .map_err(encode_err(frame_index))?;
            if written.is_some() {
                state.snapshots_written += 1;
            }
        }

        Ok(())
    }

    fn summarize(&self, state: &StreamState) -> ComplianceResult {
        if !state.persons_seen {
            return ComplianceResult::no_human();
        }
        let missing: Vec<String> = state.missing_accumulator.iter().cloned().collect();
        debug_assert!(missing.iter().all(|m| self.gear.items().contains(m)));
        ComplianceResult::from_missing(missing)
    }
}

// Convenience for callers that only care about the status tag.
impl VideoSummary {
    pub fn status(&self) -> ComplianceStatus {
        self.result.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Detection, Frame};
    use crate::video::{StreamInfo, DEFAULT_CODECS};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::rc::Rc;

    const W: i32 = 64;
    const H: i32 = 64;

    fn blank_mat() -> Mat {
        Mat::new_rows_cols_with_default(H, W, core::CV_8UC3, core::Scalar::all(0.0)).unwrap()
    }

    fn det(label: &str, x1: i32, y1: i32, x2: i32, y2: i32) -> Detection {
        Detection {
            label: label.to_string(),
            confidence: 0.9,
            bbox: BoundingBox::new(x1, y1, x2, y2),
        }
    }

    fn person_det() -> Detection {
        det("person", 0, 0, W - 1, H - 1)
    }

    /// Returns scripted responses in order, then the fallback forever.
    struct StubDetector {
        script: VecDeque<Vec<Detection>>,
        fallback: Vec<Detection>,
        calls: usize,
    }

    impl StubDetector {
        fn fixed(fallback: Vec<Detection>) -> Self {
            Self {
                script: VecDeque::new(),
                fallback,
                calls: 0,
            }
        }

        fn scripted(script: Vec<Vec<Detection>>, fallback: Vec<Detection>) -> Self {
            Self {
                script: script.into(),
                fallback,
                calls: 0,
            }
        }
    }

    impl Detector for StubDetector {
        fn detect(&mut self, _frame: &Frame, _conf: f32) -> anyhow::Result<Vec<Detection>> {
            self.calls += 1;
            Ok(self.script.pop_front().unwrap_or_else(|| self.fallback.clone()))
        }

        fn label_for(&self, _class_id: usize) -> Option<&str> {
            None
        }
    }

    struct VecSource {
        remaining: u64,
        total: u64,
    }

    impl VecSource {
        fn with_frames(n: u64) -> Self {
            Self {
                remaining: n,
                total: n,
            }
        }
    }

    impl FrameSource for VecSource {
        fn info(&self) -> StreamInfo {
            StreamInfo {
                width: W,
                height: H,
                fps: 30.0,
                frame_count: self.total as i64,
            }
        }

        fn read(&mut self) -> SessionResult<Option<Mat>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(blank_mat()))
        }
    }

    struct CountingSink {
        writes: Rc<RefCell<u64>>,
    }

    impl FrameSink for CountingSink {
        fn write(&mut self, _frame: &Mat) -> anyhow::Result<()> {
            *self.writes.borrow_mut() += 1;
            Ok(())
        }

        fn finish(&mut self) -> SessionResult<()> {
            Ok(())
        }
    }

    struct StubFactory {
        fail_first: usize,
        attempts: Rc<RefCell<Vec<&'static str>>>,
        writes: Rc<RefCell<u64>>,
    }

    impl StubFactory {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                attempts: Rc::new(RefCell::new(Vec::new())),
                writes: Rc::new(RefCell::new(0)),
            }
        }
    }

    impl SinkFactory for StubFactory {
        fn open(
            &self,
            _path: &Path,
            codec: &CodecCandidate,
            _fps: f64,
            _size: core::Size,
        ) -> anyhow::Result<Option<Box<dyn FrameSink>>> {
            let mut attempts = self.attempts.borrow_mut();
            attempts.push(codec.fourcc);
            if attempts.len() <= self.fail_first {
                return Ok(None);
            }
            Ok(Some(Box::new(CountingSink {
                writes: Rc::clone(&self.writes),
            })))
        }
    }

    fn options() -> VideoSessionOptions {
        VideoSessionOptions {
            output_path: std::env::temp_dir().join("ppe_session_test.mp4"),
            sample_stride: DEFAULT_SAMPLE_STRIDE,
            codecs: DEFAULT_CODECS.to_vec(),
            confidence_threshold: 0.3,
        }
    }

    // ---- Image session ----

    #[test]
    fn test_image_no_person_skips_item_detector() {
        let mut person = StubDetector::fixed(vec![]);
        let mut gear_det = StubDetector::fixed(vec![det("Helmet", 10, 10, 30, 30)]);
        let gear = RequiredGear::default();
        let mut frame = blank_mat();

        let result =
            process_image(&mut frame, &mut person, &mut gear_det, &gear, 0.3).unwrap();

        assert_eq!(result.status, ComplianceStatus::NoHuman);
        assert!(result.missing.is_empty());
        assert_eq!(gear_det.calls, 0);
    }

    #[test]
    fn test_image_helmet_assigned_excludes_it_from_missing() {
        let mut person = StubDetector::fixed(vec![det("person", 0, 0, 50, 60)]);
        let mut gear_det = StubDetector::fixed(vec![det("Helmet", 10, 10, 30, 30)]);
        let gear = RequiredGear::default();
        let mut frame = blank_mat();

        let result =
            process_image(&mut frame, &mut person, &mut gear_det, &gear, 0.3).unwrap();

        assert_eq!(result.status, ComplianceStatus::Violation);
        assert!(!result.missing.contains(&"Helmet".to_string()));
        assert_eq!(
            result.missing,
            vec!["Glass".to_string(), "Gloves".to_string(), "Safety-Vest".to_string()]
        );
        assert_eq!(result.per_person.len(), 1);
    }

    #[test]
    fn test_image_one_violator_marks_whole_frame() {
        let mut person = StubDetector::fixed(vec![
            det("person", 0, 0, 30, 60),
            det("person", 32, 0, 62, 60),
        ]);
        // Only the first person gets a helmet
        let mut gear_det = StubDetector::fixed(vec![det("Helmet", 10, 5, 20, 15)]);
        let gear = RequiredGear::new(&["Helmet"]);
        let mut frame = blank_mat();

        let result =
            process_image(&mut frame, &mut person, &mut gear_det, &gear, 0.3).unwrap();

        assert_eq!(result.status, ComplianceStatus::Violation);
        assert_eq!(result.missing, vec!["Helmet".to_string()]);
        assert_eq!(result.per_person[0], Vec::<String>::new());
        assert_eq!(result.per_person[1], vec!["Helmet".to_string()]);
    }

    #[test]
    fn test_image_fully_equipped_is_compliant() {
        let mut person = StubDetector::fixed(vec![det("person", 0, 0, 60, 60)]);
        let mut gear_det = StubDetector::fixed(vec![
            det("Glass", 5, 5, 15, 15),
            det("Gloves", 5, 20, 15, 30),
            det("Helmet", 20, 5, 30, 15),
            det("Safety-Vest", 20, 20, 40, 50),
        ]);
        let gear = RequiredGear::default();
        let mut frame = blank_mat();

        let result =
            process_image(&mut frame, &mut person, &mut gear_det, &gear, 0.3).unwrap();

        assert_eq!(result.status, ComplianceStatus::Compliant);
        assert!(result.missing.is_empty());
    }

    // ---- Video session ----

    #[test]
    fn test_thirty_frames_stride_five_samples_six_writes_all() {
        let mut person = StubDetector::fixed(vec![person_det()]);
        let mut gear_det = StubDetector::fixed(vec![]);
        let gear = RequiredGear::new(&["Helmet"]);
        let factory = StubFactory::new(0);
        let mut source = VecSource::with_frames(30);

        let summary = VideoSession::new(options(), &mut person, &mut gear_det, &gear)
            .run(&mut source, &factory)
            .unwrap();

        assert_eq!(summary.frames_read, 30);
        assert_eq!(summary.frames_written, 30);
        assert_eq!(*factory.writes.borrow(), 30);
        assert_eq!(summary.sampled_frames, 6);
        assert_eq!(person.calls, 6);
    }

    #[test]
    fn test_accumulator_is_running_union() {
        let mut person = StubDetector::fixed(vec![person_det()]);
        // Sampled frame 1: helmet worn; 2: both worn; later: nothing
        let mut gear_det = StubDetector::scripted(
            vec![
                vec![det("Helmet", 10, 10, 20, 20)],
                vec![det("Helmet", 10, 10, 20, 20), det("Gloves", 30, 30, 40, 40)],
            ],
            vec![],
        );
        let gear = RequiredGear::new(&["Gloves", "Helmet"]);
        let factory = StubFactory::new(0);
        let mut source = VecSource::with_frames(30);

        let summary = VideoSession::new(options(), &mut person, &mut gear_det, &gear)
            .run(&mut source, &factory)
            .unwrap();

        // Gloves missing on frame 1, everything on later frames; the
        // briefly-compliant frame 2 does not erase either
        assert_eq!(summary.result.status, ComplianceStatus::Violation);
        assert_eq!(
            summary.result.missing,
            vec!["Gloves".to_string(), "Helmet".to_string()]
        );
    }

    #[test]
    fn test_no_person_video_reports_no_human_and_skips_items() {
        let mut person = StubDetector::fixed(vec![]);
        let mut gear_det = StubDetector::fixed(vec![det("Helmet", 10, 10, 20, 20)]);
        let gear = RequiredGear::default();
        let factory = StubFactory::new(0);
        let mut source = VecSource::with_frames(10);

        let summary = VideoSession::new(options(), &mut person, &mut gear_det, &gear)
            .run(&mut source, &factory)
            .unwrap();

        assert_eq!(summary.status(), ComplianceStatus::NoHuman);
        assert!(summary.result.missing.is_empty());
        assert_eq!(gear_det.calls, 0);
        assert_eq!(summary.frames_written, 10);
    }

    #[test]
    fn test_codec_fallback_advances_to_third_candidate() {
        let mut person = StubDetector::fixed(vec![]);
        let mut gear_det = StubDetector::fixed(vec![]);
        let gear = RequiredGear::default();
        let factory = StubFactory::new(2);
        let mut source = VecSource::with_frames(5);

        let summary = VideoSession::new(options(), &mut person, &mut gear_det, &gear)
            .run(&mut source, &factory)
            .unwrap();

        assert_eq!(*factory.attempts.borrow(), vec!["avc1", "mp4v", "XVID"]);
        assert_eq!(summary.codec, "Xvid");
    }

    #[test]
    fn test_all_codecs_failing_is_codec_init_error() {
        let mut person = StubDetector::fixed(vec![]);
        let mut gear_det = StubDetector::fixed(vec![]);
        let gear = RequiredGear::default();
        let factory = StubFactory::new(3);
        let mut source = VecSource::with_frames(5);

        let opts = VideoSessionOptions {
            output_path: std::env::temp_dir().join("ppe_codec_fail_test.mp4"),
            ..options()
        };
        let output_path = opts.output_path.clone();

        let err = VideoSession::new(opts, &mut person, &mut gear_det, &gear)
            .run(&mut source, &factory)
            .unwrap_err();

        assert!(matches!(err, PipelineError::CodecInit(_)));
        assert!(!output_path.exists());
    }

    #[test]
    fn test_stride_one_samples_every_frame() {
        let mut person = StubDetector::fixed(vec![person_det()]);
        let mut gear_det = StubDetector::fixed(vec![]);
        let gear = RequiredGear::new(&["Helmet"]);
        let factory = StubFactory::new(0);
        let mut source = VecSource::with_frames(7);

        let opts = VideoSessionOptions {
            sample_stride: 1,
            ..options()
        };
        let summary = VideoSession::new(opts, &mut person, &mut gear_det, &gear)
            .run(&mut source, &factory)
            .unwrap();

        assert_eq!(summary.sampled_frames, 7);
        assert_eq!(person.calls, 7);
        assert_eq!(gear_det.calls, 7);
    }
}
