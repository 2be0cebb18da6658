//! Face-mesh landmark oracle via ONNX Runtime.
//!
//! Runs a 468-point face-mesh model on the whole (letterboxed) frame and
//! maps the predicted points back to normalized frame coordinates. The mesh
//! model tracks one face, so each frame yields at most one landmark set.

use crate::embedding::LANDMARK_COUNT;
use crate::types::{LandmarkSet, Point};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const MESH_INPUT_SIZE: usize = 192;
/// Values per landmark in the output tensor (x, y, z).
const MESH_POINT_STRIDE: usize = 3;
/// Default minimum face-presence probability.
pub const MESH_PRESENCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too small: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a grayscale frame into per-face landmarks.
pub trait LandmarkOracle {
    fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<LandmarkSet>, OracleError>;
}

/// Metadata for mapping letterboxed model coordinates back to the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, size: usize) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size as f32 - new_w) / 2.0).floor(),
            pad_y: ((size as f32 - new_h) / 2.0).floor(),
        }
    }
}

pub struct FaceMeshLandmarker {
    session: Session,
    output_count: usize,
    presence_threshold: f32,
}

impl FaceMeshLandmarker {
    /// Load the face-mesh ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, OracleError> {
        if !Path::new(model_path).exists() {
            return Err(OracleError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_count = session.outputs().len();
        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face mesh model"
        );
        if output_count == 0 {
            return Err(OracleError::InferenceFailed("face mesh model has no outputs".into()));
        }

        Ok(Self {
            session,
            output_count,
            presence_threshold: MESH_PRESENCE_THRESHOLD,
        })
    }

    /// Minimum face-presence probability (after the sigmoid) for a mesh to count.
    pub fn with_presence_threshold(mut self, threshold: f32) -> Self {
        self.presence_threshold = threshold;
        self
    }
}

impl LandmarkOracle for FaceMeshLandmarker {
    fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<LandmarkSet>, OracleError> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || frame.len() < w * h {
            return Err(OracleError::FrameSize {
                expected: w * h,
                actual: frame.len(),
            });
        }

        let (input, letterbox) = preprocess(frame, w, h, MESH_INPUT_SIZE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut mesh: Option<Vec<f32>> = None;
        let mut score: Option<f32> = None;
        for idx in 0..self.output_count {
            let (_, data) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| OracleError::InferenceFailed(format!("output {idx}: {e}")))?;
            if data.len() >= LANDMARK_COUNT * MESH_POINT_STRIDE && mesh.is_none() {
                mesh = Some(data.to_vec());
            } else if data.len() == 1 && score.is_none() {
                score = data.first().copied();
            }
        }

        let mesh = mesh.ok_or_else(|| OracleError::InferenceFailed("no landmark tensor in outputs".into()))?;
        Ok(decode_mesh(&mesh, score, &letterbox, w, h, self.presence_threshold)
            .into_iter()
            .collect())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Turn a raw `[x, y, z] × 468` tensor (model input pixels) into normalized
/// frame landmarks. `None` when the presence score is below threshold.
fn decode_mesh(
    mesh: &[f32],
    presence_logit: Option<f32>,
    letterbox: &Letterbox,
    width: usize,
    height: usize,
    threshold: f32,
) -> Option<LandmarkSet> {
    if let Some(logit) = presence_logit {
        let presence = sigmoid(logit);
        if presence < threshold {
            tracing::trace!(presence, "no face in frame");
            return None;
        }
    }
    if mesh.len() < LANDMARK_COUNT * MESH_POINT_STRIDE {
        return None;
    }

    let points = mesh
        .chunks_exact(MESH_POINT_STRIDE)
        .take(LANDMARK_COUNT)
        .map(|p| {
            let x = (p[0] - letterbox.pad_x) / letterbox.scale;
            let y = (p[1] - letterbox.pad_y) / letterbox.scale;
            Point::new(x / width as f32, y / height as f32)
        })
        .collect();
    Some(LandmarkSet::new(points))
}

/// Letterbox a grayscale frame into an NCHW `[0, 1]` tensor, replicating the
/// luma channel into RGB. Resizing is bilinear.
fn preprocess(frame: &[u8], width: usize, height: usize, size: usize) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(width, height, size);
    let new_w = ((width as f32 * letterbox.scale).round() as usize).min(size);
    let new_h = ((height as f32 * letterbox.scale).round() as usize).min(size);
    let pad_x = letterbox.pad_x as usize;
    let pad_y = letterbox.pad_y as usize;

    let inv_scale = 1.0 / letterbox.scale;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;
            let val = tl * (1.0 - fx) * (1.0 - fy) + tr * fx * (1.0 - fy) + bl * (1.0 - fx) * fy + br * fx * fy;

            let v = val.clamp(0.0, 255.0) / 255.0;
            let (ty, tx) = (y + pad_y, x + pad_x);
            if ty < size && tx < size {
                tensor[[0, 0, ty, tx]] = v;
                tensor[[0, 1, ty, tx]] = v;
                tensor[[0, 2, ty, tx]] = v;
            }
        }
    }
    (tensor, letterbox)
}
