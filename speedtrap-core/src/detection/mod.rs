//! detection: YOLO vehicle detection over ONNX Runtime
//!
//! Two model generations are supported, and they differ only in how the raw
//! output tensor is laid out:
//!
//! * YOLOv8: `[1, 4 + classes, proposals]`, column-major, no objectness.
//! * YOLOv5: `[1, proposals, 5 + classes]`, row-major, objectness × class.
//!
//! The generation is chosen once in [`load_detector`]; callers only ever see a
//! `Box<dyn VehicleDetector>`.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use fast_image_resize as fr;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::video::RgbFrame;

// ── Constants ────────────────────────────────────────────────────────────────

/// YOLO input size (square).
const YOLO_SIZE: u32 = 640;
/// COCO classes kept by the detector: car, motorcycle, bus, truck.
pub const VEHICLE_CLASSES: [usize; 4] = [2, 3, 5, 7];
/// IoU threshold for NMS.
const IOU_THRESHOLD: f32 = 0.45;

// ── Public types ─────────────────────────────────────────────────────────────

/// Axis-aligned bounding box in pixel coordinates of the original frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence: 1.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }
    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }

    /// Box area in square pixels. Degenerate boxes report zero.
    pub fn area(&self) -> f64 {
        (self.width().max(0.0) as f64) * (self.height().max(0.0) as f64)
    }

    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        inter / union
    }
}

/// Tracker-assigned identity, stable across frames for one physical object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A detector box before identity assignment.
#[derive(Debug, Clone, Copy)]
pub struct VehicleBox {
    pub class_id: usize,
    pub bbox: BBox,
}

/// One per-frame observation handed to the track history.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub class_id: usize,
    pub bbox: BBox,
    pub track_id: Option<TrackId>,
}

/// Finds vehicles in a single frame.
pub trait VehicleDetector: Send {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<VehicleBox>>;
}

/// Produces identity-tagged detections for a frame (detector + tracker).
pub trait DetectionSource: Send {
    fn detections(&mut self, frame: &RgbFrame) -> Result<Vec<Detection>>;
}

/// Output layout of the exported YOLO model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelGeneration {
    V5,
    #[default]
    V8,
}

/// Load a YOLO ONNX model and return the detector for its output layout.
pub fn load_detector<P: AsRef<Path>>(
    model_path: P,
    generation: ModelGeneration,
    confidence_threshold: f32,
) -> Result<Box<dyn VehicleDetector>> {
    let model_path = model_path.as_ref();
    let input = OnnxYolo::load(model_path)
        .with_context(|| format!("failed to load YOLO model: {}", model_path.display()))?;
    debug!(?generation, path = %model_path.display(), "vehicle detector loaded");
    Ok(match generation {
        ModelGeneration::V8 => Box::new(YoloV8Detector {
            model: input,
            confidence_threshold,
        }),
        ModelGeneration::V5 => Box::new(YoloV5Detector {
            model: input,
            confidence_threshold,
        }),
    })
}

// ── Shared ONNX session + preprocessing ──────────────────────────────────────

struct OnnxYolo {
    session: Session,
    input_name: String,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

/// Raw output tensor plus the scale back to source pixels.
struct RawOutput {
    shape: Vec<i64>,
    data: Vec<f32>,
    scale_x: f32,
    scale_y: f32,
    frame_w: f32,
    frame_h: f32,
}

impl OnnxYolo {
    fn load(model_path: &Path) -> Result<Self> {
        let session = build_ort_session(model_path)?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("YOLO model declares no inputs")?;
        Ok(Self {
            session,
            input_name,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (YOLO_SIZE * YOLO_SIZE * 3) as usize],
        })
    }

    fn run(&mut self, frame: &RgbFrame) -> Result<RawOutput> {
        let input_tensor = self.preprocess(frame)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .context("YOLO inference failed")?;

        let (_, first) = outputs.iter().next().context("YOLO produced no outputs")?;
        let (shape, data) = first
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLO output tensor")?;

        Ok(RawOutput {
            shape: shape.iter().copied().collect(),
            data: data.to_vec(),
            scale_x: frame.width as f32 / YOLO_SIZE as f32,
            scale_y: frame.height as f32 / YOLO_SIZE as f32,
            frame_w: frame.width as f32,
            frame_h: frame.height as f32,
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            YOLO_SIZE,
            YOLO_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize YOLO downscale failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, 640, 640].
        let size = (YOLO_SIZE * YOLO_SIZE) as usize;
        let mut tensor_data = vec![0f32; 3 * size];
        tensor_data
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(channel, plane)| {
                for (idx, out) in plane.iter_mut().enumerate() {
                    *out = raw[idx * 3 + channel] as f32 / 255.0;
                }
            });

        let shape = [1usize, 3, YOLO_SIZE as usize, YOLO_SIZE as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create YOLO input tensor")?
            .into_dyn())
    }
}

impl RawOutput {
    /// Convert a YOLO (cx, cy, w, h) in 640-space to a clamped source-frame box.
    fn to_bbox(&self, cx: f32, cy: f32, w: f32, h: f32, confidence: f32) -> BBox {
        BBox {
            x1: ((cx - w / 2.0) * self.scale_x).max(0.0),
            y1: ((cy - h / 2.0) * self.scale_y).max(0.0),
            x2: ((cx + w / 2.0) * self.scale_x).min(self.frame_w),
            y2: ((cy + h / 2.0) * self.scale_y).min(self.frame_h),
            confidence,
        }
    }
}

// ── YOLOv8 ───────────────────────────────────────────────────────────────────

pub struct YoloV8Detector {
    model: OnnxYolo,
    confidence_threshold: f32,
}

impl VehicleDetector for YoloV8Detector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<VehicleBox>> {
        let out = self.model.run(frame)?;
        let boxes = decode_v8(&out, self.confidence_threshold)?;
        Ok(nms(boxes, IOU_THRESHOLD))
    }
}

fn decode_v8(out: &RawOutput, threshold: f32) -> Result<Vec<VehicleBox>> {
    let [_, rows, proposals] = out.shape[..] else {
        bail!("unexpected YOLOv8 output shape {:?}", out.shape);
    };
    let (rows, proposals) = (rows as usize, proposals as usize);
    if rows <= 4 || out.data.len() < rows * proposals {
        bail!("unexpected YOLOv8 output shape {:?}", out.shape);
    }
    let num_classes = rows - 4;
    let data = &out.data;

    Ok((0..proposals)
        .into_par_iter()
        .filter_map(|i| {
            let (class_id, score) = (0..num_classes)
                .map(|c| (c, data[(4 + c) * proposals + i]))
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if score < threshold || !VEHICLE_CLASSES.contains(&class_id) {
                return None;
            }
            let cx = data[i];
            let cy = data[proposals + i];
            let w = data[2 * proposals + i];
            let h = data[3 * proposals + i];
            Some(VehicleBox {
                class_id,
                bbox: out.to_bbox(cx, cy, w, h, score),
            })
        })
        .collect())
}

// ── YOLOv5 ───────────────────────────────────────────────────────────────────

pub struct YoloV5Detector {
    model: OnnxYolo,
    confidence_threshold: f32,
}

impl VehicleDetector for YoloV5Detector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<VehicleBox>> {
        let out = self.model.run(frame)?;
        let boxes = decode_v5(&out, self.confidence_threshold)?;
        Ok(nms(boxes, IOU_THRESHOLD))
    }
}

fn decode_v5(out: &RawOutput, threshold: f32) -> Result<Vec<VehicleBox>> {
    let [_, proposals, cols] = out.shape[..] else {
        bail!("unexpected YOLOv5 output shape {:?}", out.shape);
    };
    let (proposals, cols) = (proposals as usize, cols as usize);
    if cols <= 5 || out.data.len() < proposals * cols {
        bail!("unexpected YOLOv5 output shape {:?}", out.shape);
    }

    Ok(out
        .data
        .par_chunks_exact(cols)
        .take(proposals)
        .filter_map(|row| {
            let objectness = row[4];
            if objectness < threshold {
                return None;
            }
            let (class_id, class_score) = row[5..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            let score = objectness * class_score;
            if score < threshold || !VEHICLE_CLASSES.contains(&class_id) {
                return None;
            }
            Some(VehicleBox {
                class_id,
                bbox: out.to_bbox(row[0], row[1], row[2], row[3], score),
            })
        })
        .collect())
}

// ── Session ──────────────────────────────────────────────────────────────────

pub(crate) fn build_ort_session(model_path: &Path) -> Result<Session> {
    Session::builder()
        .context("failed to create ORT session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("failed to set ORT optimization level")?
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
}

// ── Non-Maximum Suppression ──────────────────────────────────────────────────

/// Greedy per-class NMS: sort by confidence descending, suppress overlapping
/// boxes of the same class.
fn nms(mut boxes: Vec<VehicleBox>, iou_thresh: f32) -> Vec<VehicleBox> {
    boxes.sort_unstable_by(|a, b| b.bbox.confidence.total_cmp(&a.bbox.confidence));

    let mut kept: Vec<VehicleBox> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[i].class_id == boxes[j].class_id && boxes[i].bbox.iou(&boxes[j].bbox) > iou_thresh
            {
                suppressed[j] = true;
            }
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(shape: Vec<i64>, data: Vec<f32>) -> RawOutput {
        RawOutput {
            shape,
            data,
            scale_x: 2.0,
            scale_y: 1.0,
            frame_w: 1280.0,
            frame_h: 640.0,
        }
    }

    #[test]
    fn area_of_box() {
        assert_eq!(BBox::new(10.0, 20.0, 30.0, 60.0).area(), 800.0);
        assert_eq!(BBox::new(30.0, 20.0, 10.0, 60.0).area(), 0.0);
    }

    #[test]
    fn v8_keeps_vehicle_classes_only() {
        // 8 classes, 2 proposals: proposal 0 is a car, proposal 1 a person.
        let proposals = 2;
        let rows = 4 + 8;
        let mut data = vec![0f32; rows * proposals];
        for (p, (cx, cy)) in [(100.0, 100.0), (300.0, 300.0)].into_iter().enumerate() {
            data[p] = cx;
            data[proposals + p] = cy;
            data[2 * proposals + p] = 40.0;
            data[3 * proposals + p] = 20.0;
        }
        data[(4 + 2) * proposals] = 0.9;
        data[4 * proposals + 1] = 0.95;

        let out = raw(vec![1, rows as i64, proposals as i64], data);
        let boxes = decode_v8(&out, 0.5).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].class_id, 2);
        assert_eq!(boxes[0].bbox.x1, 160.0);
        assert_eq!(boxes[0].bbox.x2, 240.0);
        assert_eq!(boxes[0].bbox.y1, 90.0);
    }

    #[test]
    fn v5_multiplies_objectness() {
        let cols = 5 + 8;
        let mut truck = vec![0f32; cols];
        truck[..5].copy_from_slice(&[50.0, 50.0, 10.0, 10.0, 0.9]);
        truck[5 + 7] = 0.9;
        let mut weak = vec![0f32; cols];
        weak[..5].copy_from_slice(&[80.0, 80.0, 10.0, 10.0, 0.6]);
        weak[5 + 2] = 0.6;
        let data = [truck, weak].concat();

        let out = raw(vec![1, 2, cols as i64], data);
        let boxes = decode_v5(&out, 0.5).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].class_id, 7);
        assert!((boxes[0].bbox.confidence - 0.81).abs() < 1e-6);
    }

    #[test]
    fn rejects_malformed_shape() {
        let out = raw(vec![1, 84], vec![0.0; 84]);
        assert!(decode_v8(&out, 0.5).is_err());
        assert!(decode_v5(&out, 0.5).is_err());
    }

    #[test]
    fn nms_is_per_class() {
        let car = |conf| VehicleBox {
            class_id: 2,
            bbox: BBox {
                confidence: conf,
                ..BBox::new(0.0, 0.0, 10.0, 10.0)
            },
        };
        let bus = VehicleBox {
            class_id: 5,
            ..car(0.7)
        };
        let kept = nms(vec![car(0.6), car(0.9), bus], IOU_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].bbox.confidence, 0.9);
        assert_eq!(kept[1].class_id, 5);
    }
}
