//! ONNX Runtime ランドマークモデル
//!
//! 想定する入出力（MediaPipe のランドマークモデルを ONNX 変換したもの）:
//!
//! - 入力: [1, size, size, 3] の RGB、0.0〜1.0
//! - ハンド: ランドマーク [1, 21*3] (入力ピクセル座標 x, y, z)、
//!   存在確率 [1, 1]、右手確率 [1, 1]
//! - ポーズ: ランドマーク [1, N*5] (x, y, z, visibility ロジット, presence)、
//!   存在確率 [1, 1]
//!
//! 手のひら検出器は持たないので、1 フレームで返す手は最大 1 つ。
//! フレーム毎に独立して推論するため min_tracking_confidence は使わない。

use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use super::detector::{Detections, HandDetection, Handedness, LandmarkModel, ModelLoader, Task};
use super::landmark::{HandLandmark, Landmark, PoseLandmark};
use super::preprocess::{sigmoid, to_nhwc_tensor};
use crate::config::{DetectorConfig, ModelConfig};

const HAND_VALUES_PER_POINT: usize = 3;
const POSE_VALUES_PER_POINT: usize = 5;

fn open_session(path: &str) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load ONNX model {}", path))?;
    Ok(session)
}

/// ハンドランドマークモデル
pub struct OnnxHandModel {
    session: Session,
    input_size: u32,
    input_name: String,
    landmarks_output: String,
    presence_output: String,
    handedness_output: String,
    min_detection_confidence: f32,
}

impl OnnxHandModel {
    pub fn new(model: &ModelConfig, detector: &DetectorConfig) -> Result<Self> {
        Ok(Self {
            session: open_session(&model.hand_model)?,
            input_size: model.hand_input_size,
            input_name: model.input_name.clone(),
            landmarks_output: model.landmarks_output.clone(),
            presence_output: model.presence_output.clone(),
            handedness_output: model.handedness_output.clone(),
            min_detection_confidence: detector.min_detection_confidence,
        })
    }
}

impl LandmarkModel for OnnxHandModel {
    fn detect(&mut self, image: &RgbImage) -> Result<Detections> {
        let input = Tensor::from_array(to_nhwc_tensor(image, self.input_size))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("Hand landmark inference failed")?;

        let presence: ndarray::ArrayViewD<f32> = outputs[self.presence_output.as_str()]
            .try_extract_array()
            .context("Failed to extract hand presence")?;
        let presence = presence.iter().next().copied().unwrap_or(0.0);
        if presence < self.min_detection_confidence {
            return Ok(Detections::Hands(Vec::new()));
        }

        let right: ndarray::ArrayViewD<f32> = outputs[self.handedness_output.as_str()]
            .try_extract_array()
            .context("Failed to extract handedness")?;
        let right = right.iter().next().copied().unwrap_or(0.5);

        let raw: ndarray::ArrayViewD<f32> = outputs[self.landmarks_output.as_str()]
            .try_extract_array()
            .context("Failed to extract hand landmarks")?;
        let raw: Vec<f32> = raw.iter().copied().collect();
        anyhow::ensure!(
            raw.len() >= HandLandmark::COUNT * HAND_VALUES_PER_POINT,
            "hand landmark output too small: {} values",
            raw.len()
        );

        // 入力ピクセル座標 → 正規化座標
        let size = self.input_size as f32;
        let landmarks = raw
            .chunks_exact(HAND_VALUES_PER_POINT)
            .take(HandLandmark::COUNT)
            .map(|v| Landmark::new(v[0] / size, v[1] / size).with_z(v[2] / size))
            .collect();

        let (handedness, score) = if right >= 0.5 {
            (Handedness::Right, right)
        } else {
            (Handedness::Left, 1.0 - right)
        };

        Ok(Detections::Hands(vec![HandDetection {
            handedness,
            score,
            landmarks,
        }]))
    }
}

/// ポーズランドマークモデル
pub struct OnnxPoseModel {
    session: Session,
    input_size: u32,
    input_name: String,
    landmarks_output: String,
    presence_output: String,
    min_detection_confidence: f32,
}

impl OnnxPoseModel {
    pub fn new(model: &ModelConfig, detector: &DetectorConfig) -> Result<Self> {
        let path = model.pose_model(detector.model_complexity).with_context(|| {
            format!("no pose model configured for model_complexity {}", detector.model_complexity)
        })?;
        Ok(Self {
            session: open_session(path)?,
            input_size: model.pose_input_size,
            input_name: model.input_name.clone(),
            landmarks_output: model.landmarks_output.clone(),
            presence_output: model.presence_output.clone(),
            min_detection_confidence: detector.min_detection_confidence,
        })
    }
}

impl LandmarkModel for OnnxPoseModel {
    fn detect(&mut self, image: &RgbImage) -> Result<Detections> {
        let input = Tensor::from_array(to_nhwc_tensor(image, self.input_size))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("Pose landmark inference failed")?;

        let presence: ndarray::ArrayViewD<f32> = outputs[self.presence_output.as_str()]
            .try_extract_array()
            .context("Failed to extract pose presence")?;
        let presence = presence.iter().next().copied().unwrap_or(0.0);
        if presence < self.min_detection_confidence {
            return Ok(Detections::Pose(None));
        }

        let raw: ndarray::ArrayViewD<f32> = outputs[self.landmarks_output.as_str()]
            .try_extract_array()
            .context("Failed to extract pose landmarks")?;
        let raw: Vec<f32> = raw.iter().copied().collect();
        anyhow::ensure!(
            raw.len() >= PoseLandmark::COUNT * POSE_VALUES_PER_POINT,
            "pose landmark output too small: {} values",
            raw.len()
        );

        let size = self.input_size as f32;
        let landmarks = raw
            .chunks_exact(POSE_VALUES_PER_POINT)
            .take(PoseLandmark::COUNT)
            .map(|v| {
                Landmark::new(v[0] / size, v[1] / size)
                    .with_z(v[2] / size)
                    .with_visibility(sigmoid(v[3]))
            })
            .collect();

        Ok(Detections::Pose(Some(landmarks)))
    }
}

/// タスクに応じて ONNX モデルを開く
pub struct OnnxLoader {
    pub task: Task,
    pub model: ModelConfig,
}

impl ModelLoader for OnnxLoader {
    fn load(&self, config: &DetectorConfig) -> Result<Box<dyn LandmarkModel>> {
        let model: Box<dyn LandmarkModel> = match self.task {
            Task::Hand => Box::new(OnnxHandModel::new(&self.model, config)?),
            Task::Pose => Box::new(OnnxPoseModel::new(&self.model, config)?),
        };
        Ok(model)
    }
}
