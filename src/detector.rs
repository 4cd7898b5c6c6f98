//! Anomaly detector — YOLO-family models via ONNX Runtime.
//!
//! Three models cover the four anomaly kinds: `fire.onnx` (class 0 =
//! fire, class 1 = smoke), `person.onnx` (class 0 = stranger) and
//! `fall.onnx` (class 0 = person falling). Depending on the detection
//! mode one or all of them run per frame.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::Array4;
use opencv::core::{Mat, Point, Rect, Scalar, Size};
use opencv::prelude::*;
use opencv::imgproc;
use tracing::debug;

use ort::session::Session;

use crate::types::{AlertKind, DetectMode};
use crate::worker::{InferBackend, RawDetection};

/// Box colors per kind (BGR), matched by the annotation legend.
fn kind_color(kind: AlertKind) -> Scalar {
    match kind {
        AlertKind::Smoke => Scalar::new(128.0, 128.0, 128.0, 0.0),
        AlertKind::Fire => Scalar::new(0.0, 0.0, 255.0, 0.0),
        AlertKind::Stranger => Scalar::new(0.0, 255.0, 0.0, 0.0),
        AlertKind::Fall => Scalar::new(255.0, 0.0, 0.0, 0.0),
    }
}

/// One loaded model plus its class → kind mapping.
struct Model {
    session: Session,
    name: &'static str,
    classes: &'static [AlertKind],
}

impl Model {
    fn load(dir: &Path, file: &'static str, classes: &'static [AlertKind]) -> Result<Self> {
        let path = dir.join(file);
        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(&path)
            .with_context(|| format!("loading model {}", path.display()))?;
        Ok(Self {
            session,
            name: file,
            classes,
        })
    }
}

/// The full model set. Loads only the sessions the detection mode needs.
pub struct ModelSet {
    fire: Option<Model>,
    person: Option<Model>,
    fall: Option<Model>,
    input_size: u32,
    iou_threshold: f32,
}

impl ModelSet {
    pub fn load(dir: &Path, mode: DetectMode, input_size: u32, iou_threshold: f32) -> Result<Self> {
        let want = |m: DetectMode| mode == DetectMode::All || mode == m;
        Ok(Self {
            fire: want(DetectMode::FireSmoke)
                .then(|| Model::load(dir, "fire.onnx", &[AlertKind::Fire, AlertKind::Smoke]))
                .transpose()?,
            person: want(DetectMode::Person)
                .then(|| Model::load(dir, "person.onnx", &[AlertKind::Stranger]))
                .transpose()?,
            fall: want(DetectMode::Fall)
                .then(|| Model::load(dir, "fall.onnx", &[AlertKind::Fall]))
                .transpose()?,
            input_size,
            iou_threshold,
        })
    }

    fn active_models(&self, mode: DetectMode) -> Vec<&Model> {
        let pick = |m: DetectMode, model: &Option<Model>| {
            if mode == DetectMode::All || mode == m {
                model.as_ref()
            } else {
                None
            }
        };
        [
            pick(DetectMode::FireSmoke, &self.fire),
            pick(DetectMode::Person, &self.person),
            pick(DetectMode::Fall, &self.fall),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn run_model(
        &self,
        model: &Model,
        mat: &Mat,
        confidence: f32,
    ) -> Result<Vec<RawDetection>> {
        let sz = self.input_size as i32;
        let (tensor, map) = preprocess(mat, sz)?;
        let array = Array4::from_shape_vec((1, 3, sz as usize, sz as usize), tensor)?;

        let outputs = model.session.run(ort::inputs!["images" => array.view()]?)?;
        let output = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("failed to extract {} output tensor: {}", model.name, e))?;
        let shape = output.shape();
        // YOLOv8 layout: [1, 4 + num_classes, num_boxes]
        let num_boxes = shape[2];
        let num_classes = shape[1] - 4;

        let mut hits = Vec::new();
        for i in 0..num_boxes {
            let cx = output[[0, 0, i]];
            let cy = output[[0, 1, i]];
            let bw = output[[0, 2, i]];
            let bh = output[[0, 3, i]];

            let mut best_score = 0f32;
            let mut best_class = 0usize;
            for c in 0..num_classes {
                let score = output[[0, 4 + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if best_score < confidence {
                continue;
            }
            let Some(kind) = model.classes.get(best_class).copied() else {
                continue;
            };
            hits.push(RawDetection {
                kind,
                confidence: best_score,
                bbox: map.to_frame(cx, cy, bw, bh, mat.cols(), mat.rows()),
            });
        }
        let kept = suppress(hits, self.iou_threshold);
        debug!(
            target: "detect",
            "{}: {} box(es) above {:.2}", model.name, kept.len(), confidence
        );
        Ok(kept)
    }
}

impl InferBackend for ModelSet {
    fn infer(
        &self,
        mat: &Mat,
        mode: DetectMode,
        confidence: f32,
    ) -> Result<Vec<RawDetection>> {
        let mut all = Vec::new();
        for model in self.active_models(mode) {
            all.extend(self.run_model(model, mat, confidence)?);
        }
        Ok(all)
    }

    fn annotate(&self, mat: &Mat, detections: &[RawDetection]) -> Result<Mat> {
        let mut out = mat.clone();
        for det in detections {
            let (x1, y1, x2, y2) = det.bbox;
            let rect = Rect::new(x1, y1, (x2 - x1).max(1), (y2 - y1).max(1));
            imgproc::rectangle(&mut out, rect, kind_color(det.kind), 2, imgproc::LINE_8, 0)?;
            let text = format!("{}: {:.2}", det.kind.label(), det.confidence);
            imgproc::put_text(
                &mut out,
                &text,
                Point::new(x1, (y1 - 10).max(10)),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.6,
                Scalar::new(255.0, 255.0, 255.0, 0.0),
                2,
                imgproc::LINE_8,
                false,
            )?;
        }
        Ok(out)
    }
}

// ─── Preprocessing ───────────────────────────────────────────────────────────

/// Mapping from letterboxed model coordinates back to frame pixels.
struct LetterboxMap {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxMap {
    fn to_frame(&self, cx: f32, cy: f32, bw: f32, bh: f32, frame_w: i32, frame_h: i32) -> (i32, i32, i32, i32) {
        let x1 = ((cx - bw / 2.0 - self.pad_x) / self.scale).clamp(0.0, frame_w as f32);
        let y1 = ((cy - bh / 2.0 - self.pad_y) / self.scale).clamp(0.0, frame_h as f32);
        let x2 = ((cx + bw / 2.0 - self.pad_x) / self.scale).clamp(0.0, frame_w as f32);
        let y2 = ((cy + bh / 2.0 - self.pad_y) / self.scale).clamp(0.0, frame_h as f32);
        (x1 as i32, y1 as i32, x2 as i32, y2 as i32)
    }
}

/// Letterbox the BGR frame into `target×target` (grey padding), convert
/// to RGB CHW f32 normalised to [0,1].
fn preprocess(src: &Mat, target: i32) -> Result<(Vec<f32>, LetterboxMap)> {
    let w = src.cols();
    let h = src.rows();
    let scale = (target as f64 / w.max(h) as f64).min(1.0);
    let new_w = ((w as f64 * scale) as i32).max(1);
    let new_h = ((h as f64 * scale) as i32).max(1);

    let mut resized = Mat::default();
    imgproc::resize(
        src,
        &mut resized,
        Size::new(new_w, new_h),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    let pad_x = (target - new_w) / 2;
    let pad_y = (target - new_h) / 2;
    let mut padded = Mat::default();
    opencv::core::copy_make_border(
        &resized,
        &mut padded,
        pad_y,
        target - new_h - pad_y,
        pad_x,
        target - new_w - pad_x,
        opencv::core::BORDER_CONSTANT,
        Scalar::new(114.0, 114.0, 114.0, 0.0),
    )?;

    let mut rgb = Mat::default();
    imgproc::cvt_color(&padded, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

    let size = target as usize;
    let data = rgb.data_bytes()?;
    let mut tensor = vec![0f32; 3 * size * size];
    for y in 0..size {
        for x in 0..size {
            let pixel = (y * size + x) * 3;
            for c in 0..3usize {
                tensor[c * size * size + y * size + x] = data[pixel + c] as f32 / 255.0;
            }
        }
    }

    Ok((
        tensor,
        LetterboxMap {
            scale: scale as f32,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    ))
}

// ─── Non-maximum suppression ─────────────────────────────────────────────────

/// Greedy per-kind NMS: keep the highest-confidence box, drop overlaps
/// above the IoU threshold.
fn suppress(mut hits: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    hits.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(hits.len());
    for hit in hits {
        let overlaps = kept
            .iter()
            .any(|k| k.kind == hit.kind && iou(k.bbox, hit.bbox) > iou_threshold);
        if !overlaps {
            kept.push(hit);
        }
    }
    kept
}

fn iou(a: (i32, i32, i32, i32), b: (i32, i32, i32, i32)) -> f32 {
    let ix1 = a.0.max(b.0);
    let iy1 = a.1.max(b.1);
    let ix2 = a.2.min(b.2);
    let iy2 = a.3.min(b.3);
    let inter = ((ix2 - ix1).max(0) as f32) * ((iy2 - iy1).max(0) as f32);
    let area_a = ((a.2 - a.0).max(0) as f32) * ((a.3 - a.1).max(0) as f32);
    let area_b = ((b.2 - b.0).max(0) as f32) * ((b.3 - b.1).max(0) as f32);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(kind: AlertKind, conf: f32, bbox: (i32, i32, i32, i32)) -> RawDetection {
        RawDetection {
            kind,
            confidence: conf,
            bbox,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        assert!((iou((0, 0, 10, 10), (0, 0, 10, 10)) - 1.0).abs() < 1e-6);
        assert_eq!(iou((0, 0, 10, 10), (20, 20, 30, 30)), 0.0);
    }

    #[test]
    fn nms_keeps_highest_confidence_overlap() {
        let hits = vec![
            det(AlertKind::Fire, 0.7, (0, 0, 100, 100)),
            det(AlertKind::Fire, 0.9, (5, 5, 105, 105)),
            det(AlertKind::Fire, 0.8, (300, 300, 400, 400)),
        ];
        let kept = suppress(hits, 0.6);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.8);
    }

    #[test]
    fn nms_never_merges_across_kinds() {
        let hits = vec![
            det(AlertKind::Fire, 0.9, (0, 0, 100, 100)),
            det(AlertKind::Smoke, 0.7, (0, 0, 100, 100)),
        ];
        let kept = suppress(hits, 0.6);
        assert_eq!(kept.len(), 2);
    }
}
