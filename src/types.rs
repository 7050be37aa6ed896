use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub models: ModelConfig,
    pub video: VideoConfig,
    pub alerts: AlertConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub person_model: String,
    pub gear_model: String,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub input_dir: String,
    pub output_dir: String,
    pub sample_stride: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub enabled: bool,
    pub violations_dir: String,
    pub debounce_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// One decoded frame as tightly-packed RGB bytes, the format the
/// detectors consume.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

/// Axis-aligned box in pixel coordinates, x1 < x2 and y1 < y2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Truncates model-space f32 corners to integer pixel coordinates.
    pub fn from_xyxy(bbox: [f32; 4]) -> Self {
        Self {
            x1: bbox[0] as i32,
            y1: bbox[1] as i32,
            x2: bbox[2] as i32,
            y2: bbox[3] as i32,
        }
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }
}

/// One labeled box from a detector, transient per frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// A detected person plus the gear items associated to them so far.
#[derive(Debug, Clone)]
pub struct PersonEntity {
    pub bbox: BoundingBox,
    pub items_present: Vec<String>,
}

impl PersonEntity {
    pub fn new(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            items_present: Vec::new(),
        }
    }

    pub fn has_item(&self, label: &str) -> bool {
        self.items_present.iter().any(|i| i == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    NoHuman,
    Compliant,
    Violation,
}

/// Structured outcome of one frame (image mode) or one whole video
/// session. `missing` is sorted and always a subset of the required
/// gear list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub status: ComplianceStatus,
    pub missing: Vec<String>,
    /// Per-person missing lists in detection order. Empty for the
    /// no-human case and for video summaries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_person: Vec<Vec<String>>,
}

impl ComplianceResult {
    pub fn no_human() -> Self {
        Self {
            status: ComplianceStatus::NoHuman,
            missing: Vec::new(),
            per_person: Vec::new(),
        }
    }

    pub fn from_missing(missing: Vec<String>) -> Self {
        let status = if missing.is_empty() {
            ComplianceStatus::Compliant
        } else {
            ComplianceStatus::Violation
        };
        Self {
            status,
            missing,
            per_person: Vec::new(),
        }
    }
}
