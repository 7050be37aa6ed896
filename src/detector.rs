// src/detector.rs

use crate::types::{BoundingBox, Detection, Frame};
use anyhow::Result;
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

const YOLO_INPUT_SIZE: usize = 640;
const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Safety gear classes of the custom PPE model, in training order.
pub const GEAR_LABELS: [&str; 4] = ["Glass", "Gloves", "Helmet", "Safety-Vest"];

/// A detection source. Implemented by the ONNX-backed detector in
/// production and by fixed-list stubs in tests.
pub trait Detector {
    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>>;

    fn label_for(&self, class_id: usize) -> Option<&str>;
}

pub struct YoloDetector {
    session: Session,
    labels: Vec<String>,
    keep: Vec<String>,
}

impl YoloDetector {
    pub fn new(model_path: &str, labels: Vec<String>, keep: Vec<String>) -> Result<Self> {
        info!("Loading YOLO model: {}", model_path);

        let session = Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().with_device_id(0).build()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)?;

        info!("✓ YOLO detector initialized ({} classes)", labels.len());
        Ok(Self {
            session,
            labels,
            keep,
        })
    }

    /// COCO-trained person detector; everything but `person` is discarded.
    pub fn person(model_path: &str) -> Result<Self> {
        Self::new(model_path, coco_labels(), vec!["person".to_string()])
    }

    /// Custom PPE model trained on the safety gear classes.
    pub fn gear(model_path: &str) -> Result<Self> {
        let labels: Vec<String> = GEAR_LABELS.iter().map(|s| s.to_string()).collect();
        Self::new(model_path, labels.clone(), labels)
    }

    fn preprocess(&self, src: &[u8], src_w: usize, src_h: usize) -> (Vec<f32>, f32, f32, f32) {
        let target_size = YOLO_INPUT_SIZE;

        // Scale to fit inside 640x640 while keeping aspect ratio
        let scale = (target_size as f32 / src_w as f32).min(target_size as f32 / src_h as f32);
        let scaled_w = (src_w as f32 * scale) as usize;
        let scaled_h = (src_h as f32 * scale) as usize;

        let pad_x = (target_size - scaled_w) as f32 / 2.0;
        let pad_y = (target_size - scaled_h) as f32 / 2.0;

        let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

        // Gray letterbox canvas
        let mut canvas = vec![114u8; target_size * target_size * 3];
        for y in 0..scaled_h {
            for x in 0..scaled_w {
                let src_idx = (y * scaled_w + x) * 3;
                let dst_x = x + pad_x as usize;
                let dst_y = y + pad_y as usize;
                let dst_idx = (dst_y * target_size + dst_x) * 3;
                canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
            }
        }

        // Normalize [0, 255] -> [0, 1] and convert HWC -> CHW
        let mut input = vec![0.0f32; 3 * target_size * target_size];
        for c in 0..3 {
            for h in 0..target_size {
                for w in 0..target_size {
                    let hwc_idx = (h * target_size + w) * 3 + c;
                    let chw_idx = c * target_size * target_size + h * target_size + w;
                    input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
                }
            }
        }

        (input, scale, pad_x, pad_y)
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_tensor::<f32>()?;

        Ok(data.to_vec())
    }

    fn postprocess(
        &self,
        output: &[f32],
        scale: f32,
        pad_x: f32,
        pad_y: f32,
        conf_thresh: f32,
    ) -> Vec<Detection> {
        let num_classes = self.labels.len();
        // YOLOv8 output is [1, 4 + num_classes, N] flattened; N predictions
        let num_preds = output.len() / (4 + num_classes);

        let mut detections = Vec::new();

        for i in 0..num_preds {
            let cx = output[i];
            let cy = output[num_preds + i];
            let w = output[num_preds * 2 + i];
            let h = output[num_preds * 3 + i];

            let mut max_conf = 0.0f32;
            let mut best_class = 0;
            for c in 0..num_classes {
                let conf = output[num_preds * (4 + c) + i];
                if conf > max_conf {
                    max_conf = conf;
                    best_class = c;
                }
            }

            if max_conf < conf_thresh {
                continue;
            }
            let label = &self.labels[best_class];
            if !self.keep.contains(label) {
                continue;
            }

            // Center format -> corner format, then undo the letterbox
            let x1 = (cx - w / 2.0 - pad_x) / scale;
            let y1 = (cy - h / 2.0 - pad_y) / scale;
            let x2 = (cx + w / 2.0 - pad_x) / scale;
            let y2 = (cy + h / 2.0 - pad_y) / scale;

            detections.push(Detection {
                label: label.clone(),
                confidence: max_conf,
                bbox: BoundingBox::from_xyxy([x1, y1, x2, y2]),
            });
        }

        nms(detections, NMS_IOU_THRESHOLD)
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let (input, scale, pad_x, pad_y) = self.preprocess(&frame.data, frame.width, frame.height);

        let output = self.infer(&input)?;

        let detections = self.postprocess(&output, scale, pad_x, pad_y, confidence_threshold);
        debug!("Detected {} object(s)", detections.len());
        Ok(detections)
    }

    fn label_for(&self, class_id: usize) -> Option<&str> {
        self.labels.get(class_id).map(|s| s.as_str())
    }
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());

    let mut keep = Vec::new();

    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| calculate_iou(&current.bbox, &det.bbox) < iou_threshold);
        keep.push(current);
    }

    keep
}

fn calculate_iou(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let x1 = box1.x1.max(box2.x1) as f32;
    let y1 = box1.y1.max(box2.y1) as f32;
    let x2 = box1.x2.min(box2.x2) as f32;
    let y2 = box1.y2.min(box2.y2) as f32;

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1.x2 - box1.x1) as f32 * (box1.y2 - box1.y1) as f32;
    let area2 = (box2.x2 - box2.x1) as f32 * (box2.y2 - box2.y1) as f32;
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

pub fn coco_labels() -> Vec<String> {
    [
        "person",
        "bicycle",
        "car",
        "motorcycle",
        "airplane",
        "bus",
        "train",
        "truck",
        "boat",
        "traffic light",
        "fire hydrant",
        "stop sign",
        "parking meter",
        "bench",
        "bird",
        "cat",
        "dog",
        "horse",
        "sheep",
        "cow",
        "elephant",
        "bear",
        "zebra",
        "giraffe",
        "backpack",
        "umbrella",
        "handbag",
        "tie",
        "suitcase",
        "frisbee",
        "skis",
        "snowboard",
        "sports ball",
        "kite",
        "baseball bat",
        "baseball glove",
        "skateboard",
        "surfboard",
        "tennis racket",
        "bottle",
        "wine glass",
        "cup",
        "fork",
        "knife",
        "spoon",
        "bowl",
        "banana",
        "apple",
        "sandwich",
        "orange",
        "broccoli",
        "carrot",
        "hot dog",
        "pizza",
        "donut",
        "cake",
        "chair",
        "couch",
        "potted plant",
        "bed",
        "dining table",
        "toilet",
        "tv",
        "laptop",
        "mouse",
        "remote",
        "keyboard",
        "cell phone",
        "microwave",
        "oven",
        "toaster",
        "sink",
        "refrigerator",
        "book",
        "clock",
        "vase",
        "scissors",
        "teddy bear",
        "hair drier",
        "toothbrush",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
