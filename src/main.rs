// src/main.rs

mod alert;
mod annotate;
mod association;
mod compliance;
mod config;
mod detector;
mod error;
mod session;
mod types;
mod video;

use alert::ViolationRecorder;
use anyhow::Result;
use compliance::RequiredGear;
use detector::YoloDetector;
use opencv::{core, imgcodecs, prelude::*};
use session::{VideoSession, VideoSessionOptions};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use types::{ComplianceResult, ComplianceStatus, Config};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

fn main() -> Result<()> {
    let config = Config::load("config.yaml")?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "ppe_detection={},ort=warn",
            config.logging.level
        ))
        .init();

    info!("🦺 PPE Compliance Detection Starting");
    info!("✓ Configuration loaded");

    let mut person_detector = YoloDetector::person(&config.models.person_model)?;
    let mut gear_detector = YoloDetector::gear(&config.models.gear_model)?;
    let gear = RequiredGear::default();
    info!("✓ Detectors ready (required gear: {})", gear.items().join(", "));

    std::fs::create_dir_all(&config.video.output_dir)?;

    let media_files = find_media_files(&config.video.input_dir);
    if media_files.is_empty() {
        error!("No media files found in {}", config.video.input_dir);
        return Ok(());
    }
    info!("Found {} media file(s) to process", media_files.len());

    for (idx, path) in media_files.iter().enumerate() {
        info!(
            "Processing {}/{}: {}",
            idx + 1,
            media_files.len(),
            path.display()
        );

        let outcome = if is_video_file(path) {
            process_video_file(
                path,
                &config,
                &mut person_detector,
                &mut gear_detector,
                &gear,
            )
        } else {
            process_image_file(
                path,
                &config,
                &mut person_detector,
                &mut gear_detector,
                &gear,
            )
        };

        match outcome {
            Ok(result) => log_result(path, &result),
            Err(e) => error!("Failed to process {}: {:#}", path.display(), e),
        }
    }

    Ok(())
}

fn find_media_files(input_dir: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(input_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    let ext = ext.to_lowercase();
                    IMAGE_EXTENSIONS.contains(&ext.as_str())
                        || VIDEO_EXTENSIONS.contains(&ext.as_str())
                })
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn process_image_file(
    path: &Path,
    config: &Config,
    person_detector: &mut YoloDetector,
    gear_detector: &mut YoloDetector,
    gear: &RequiredGear,
) -> Result<ComplianceResult> {
    let mut frame = imgcodecs::imread(&path.to_string_lossy(), imgcodecs::IMREAD_COLOR)?;
    if frame.empty() {
        anyhow::bail!("could not decode image {}", path.display());
    }

    let result = session::process_image(
        &mut frame,
        person_detector,
        gear_detector,
        gear,
        config.models.confidence_threshold,
    )?;

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("jpg");
    let output_path =
        Path::new(&config.video.output_dir).join(format!("processed_{}.{}", stem, ext));

    let ok = imgcodecs::imwrite(&output_path.to_string_lossy(), &frame, &core::Vector::new())?;
    anyhow::ensure!(ok, "imwrite refused {}", output_path.display());
    info!("Annotated image written to {}", output_path.display());

    if config.alerts.enabled && result.status == ComplianceStatus::Violation {
        let mut recorder =
            ViolationRecorder::new(&config.alerts.violations_dir, config.alerts.debounce_seconds)?;
        let missing: BTreeSet<String> = result.missing.iter().cloned().collect();
        recorder.maybe_snapshot(&frame, &missing)?;
    }

    write_result_sidecar(&output_path, &result)?;
    Ok(result)
}

fn process_video_file(
    path: &Path,
    config: &Config,
    person_detector: &mut YoloDetector,
    gear_detector: &mut YoloDetector,
    gear: &RequiredGear,
) -> Result<ComplianceResult> {
    let mut source = video::OpenCvSource::open(path)?;
    let output_path = video::derive_output_path(path, Path::new(&config.video.output_dir));

    // Debounce state is per video session, never shared across files
    let mut recorder = if config.alerts.enabled {
        Some(ViolationRecorder::new(
            &config.alerts.violations_dir,
            config.alerts.debounce_seconds,
        )?)
    } else {
        None
    };

    let opts = VideoSessionOptions {
        output_path,
        sample_stride: config.video.sample_stride.max(1),
        codecs: video::DEFAULT_CODECS.to_vec(),
        confidence_threshold: config.models.confidence_threshold,
    };

    let mut session = VideoSession::new(opts, person_detector, gear_detector, gear);
    if let Some(ref mut rec) = recorder {
        session = session.with_recorder(rec);
    }

    let summary = session.run(&mut source, &video::OpenCvSinkFactory)?;

    info!(
        "Annotated video written to {} ({} codec, {} frames, {} snapshot(s))",
        summary.output_path.display(),
        summary.codec,
        summary.frames_written,
        summary.snapshots_written
    );

    write_result_sidecar(&summary.output_path, &summary.result)?;
    Ok(summary.result)
}

fn write_result_sidecar(output_path: &Path, result: &ComplianceResult) -> Result<()> {
    let sidecar = output_path.with_extension("json");
    std::fs::write(&sidecar, serde_json::to_string_pretty(result)?)?;
    Ok(())
}

fn log_result(path: &Path, result: &ComplianceResult) {
    match result.status {
        ComplianceStatus::NoHuman => {
            info!("{}: no human detected", path.display());
        }
        ComplianceStatus::Compliant => {
            info!("{}: ✓ all safety gear present", path.display());
        }
        ComplianceStatus::Violation => {
            warn!(
                "{}: ⚠️  missing gear: {}",
                path.display(),
                result.missing.join(", ")
            );
        }
    }
}
