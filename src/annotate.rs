// src/annotate.rs

use crate::types::{BoundingBox, Detection, PersonEntity};
use anyhow::Result;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
};
use std::collections::BTreeSet;

const BANNER_ORIGIN: (i32, i32) = (20, 40);
const BANNER_SCALE: f64 = 0.8;
const LABEL_SCALE: f64 = 0.5;

fn red() -> core::Scalar {
    core::Scalar::new(0.0, 0.0, 255.0, 0.0)
}

fn green() -> core::Scalar {
    core::Scalar::new(0.0, 255.0, 0.0, 0.0)
}

fn blue() -> core::Scalar {
    core::Scalar::new(255.0, 0.0, 0.0, 0.0)
}

fn rect_of(bbox: &BoundingBox) -> core::Rect {
    core::Rect::new(bbox.x1, bbox.y1, bbox.x2 - bbox.x1, bbox.y2 - bbox.y1)
}

/// Blue outline per detected person. Used by both the image path and
/// the sampled video path.
pub fn draw_persons(frame: &mut Mat, persons: &[PersonEntity]) -> Result<()> {
    for person in persons {
        imgproc::rectangle(frame, rect_of(&person.bbox), blue(), 2, imgproc::LINE_8, 0)?;
    }
    Ok(())
}

/// Green box plus class label per detected gear item. Only the live
/// video path draws these; image mode outlines persons only.
pub fn draw_items(frame: &mut Mat, items: &[Detection]) -> Result<()> {
    for item in items {
        imgproc::rectangle(frame, rect_of(&item.bbox), green(), 2, imgproc::LINE_8, 0)?;
        imgproc::put_text(
            frame,
            &item.label,
            core::Point::new(item.bbox.x1, item.bbox.y1 - 10),
            imgproc::FONT_HERSHEY_SIMPLEX,
            LABEL_SCALE,
            green(),
            2,
            imgproc::LINE_8,
            false,
        )?;
    }
    Ok(())
}

fn draw_banner(frame: &mut Mat, text: &str, color: core::Scalar) -> Result<()> {
    imgproc::put_text(
        frame,
        text,
        core::Point::new(BANNER_ORIGIN.0, BANNER_ORIGIN.1),
        imgproc::FONT_HERSHEY_SIMPLEX,
        BANNER_SCALE,
        color,
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// One-line compliance banner. Rendering only; the structured result
/// never depends on what was drawn here.
pub fn draw_compliance_banner(frame: &mut Mat, missing: &BTreeSet<String>) -> Result<()> {
    if missing.is_empty() {
        draw_banner(frame, "All Safety Gear Present", green())
    } else {
        let joined = missing.iter().cloned().collect::<Vec<_>>().join(", ");
        draw_banner(frame, &format!("Missing: {}", joined), red())
    }
}

pub fn draw_no_human_banner(frame: &mut Mat) -> Result<()> {
    draw_banner(frame, "No human detected", red())
}
