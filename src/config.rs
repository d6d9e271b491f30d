use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::WorkerError;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

/// 検出セッションの設定。セッション生成後は変更しない
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DetectorConfig {
    /// 検出の信頼度閾値
    #[serde(default = "default_confidence")]
    pub min_detection_confidence: f32,
    /// トラッキングの信頼度閾値
    #[serde(default = "default_confidence")]
    pub min_tracking_confidence: f32,
    /// 最大検出ハンド数
    #[serde(default = "default_max_num_hands")]
    pub max_num_hands: u32,
    /// モデル複雑度 (0=lite, 1=full, 2=heavy)
    #[serde(default = "default_model_complexity")]
    pub model_complexity: u8,
}

fn default_confidence() -> f32 { 0.5 }
fn default_max_num_hands() -> u32 { 2 }
fn default_model_complexity() -> u8 { 1 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_detection_confidence: default_confidence(),
            min_tracking_confidence: default_confidence(),
            max_num_hands: default_max_num_hands(),
            model_complexity: default_model_complexity(),
        }
    }
}

/// `config` コマンドで送られる部分的な上書き
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct DetectorConfigPatch {
    pub min_detection_confidence: Option<f32>,
    pub min_tracking_confidence: Option<f32>,
    pub max_num_hands: Option<u32>,
    pub model_complexity: Option<u8>,
}

impl DetectorConfig {
    /// 上書きを適用した新しい設定を返す（self は変更しない）
    pub fn apply(&self, patch: &DetectorConfigPatch) -> Result<Self, WorkerError> {
        let next = Self {
            min_detection_confidence: patch
                .min_detection_confidence
                .unwrap_or(self.min_detection_confidence),
            min_tracking_confidence: patch
                .min_tracking_confidence
                .unwrap_or(self.min_tracking_confidence),
            max_num_hands: patch.max_num_hands.unwrap_or(self.max_num_hands),
            model_complexity: patch.model_complexity.unwrap_or(self.model_complexity),
        };
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        for (name, value) in [
            ("min_detection_confidence", self.min_detection_confidence),
            ("min_tracking_confidence", self.min_tracking_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(WorkerError::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.max_num_hands == 0 {
            return Err(WorkerError::InvalidConfig(
                "max_num_hands must be at least 1".to_string(),
            ));
        }
        if self.model_complexity > 2 {
            return Err(WorkerError::InvalidConfig(format!(
                "model_complexity must be 0, 1 or 2, got {}",
                self.model_complexity
            )));
        }
        Ok(())
    }
}

/// フレーミングの上限
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct ProtocolConfig {
    /// JSON ヘッダ（JSON Lines では 1 行）の最大バイト数
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// バイナリ画像ペイロードの最大バイト数
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_max_header_bytes() -> usize { 1024 * 1024 }
fn default_max_payload_bytes() -> usize { 64 * 1024 * 1024 }

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: default_max_header_bytes(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

/// ONNX ランドマークモデルの配置とテンソル名
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_hand_model")]
    pub hand_model: String,
    #[serde(default = "default_hand_input_size")]
    pub hand_input_size: u32,
    /// model_complexity 0/1/2 に対応するポーズモデル
    #[serde(default = "default_pose_models")]
    pub pose_models: Vec<String>,
    #[serde(default = "default_pose_input_size")]
    pub pose_input_size: u32,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default = "default_landmarks_output")]
    pub landmarks_output: String,
    #[serde(default = "default_presence_output")]
    pub presence_output: String,
    #[serde(default = "default_handedness_output")]
    pub handedness_output: String,
}

fn default_hand_model() -> String { "models/hand_landmark.onnx".to_string() }
fn default_hand_input_size() -> u32 { 224 }
fn default_pose_models() -> Vec<String> {
    vec![
        "models/pose_landmark_lite.onnx".to_string(),
        "models/pose_landmark_full.onnx".to_string(),
        "models/pose_landmark_heavy.onnx".to_string(),
    ]
}
fn default_pose_input_size() -> u32 { 256 }
fn default_input_name() -> String { "input_1".to_string() }
fn default_landmarks_output() -> String { "Identity".to_string() }
fn default_presence_output() -> String { "Identity_1".to_string() }
fn default_handedness_output() -> String { "Identity_2".to_string() }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hand_model: default_hand_model(),
            hand_input_size: default_hand_input_size(),
            pose_models: default_pose_models(),
            pose_input_size: default_pose_input_size(),
            input_name: default_input_name(),
            landmarks_output: default_landmarks_output(),
            presence_output: default_presence_output(),
            handedness_output: default_handedness_output(),
        }
    }
}

impl ModelConfig {
    /// model_complexity に対応するポーズモデルのパス
    pub fn pose_model(&self, complexity: u8) -> Option<&str> {
        self.pose_models.get(complexity as usize).map(String::as_str)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.detector.validate()?;
        Ok(config)
    }

    /// ファイルが無ければデフォルト、あれば読み込む（壊れていればエラー）
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("{} not found, using default config", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_detector_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.min_detection_confidence, 0.5);
        assert_eq!(config.min_tracking_confidence, 0.5);
        assert_eq!(config.max_num_hands, 2);
        assert_eq!(config.model_complexity, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_partial_patch() {
        let base = DetectorConfig::default();
        let patch: DetectorConfigPatch =
            serde_json::from_str(r#"{"max_num_hands": 1, "min_detection_confidence": 0.8}"#).unwrap();
        let next = base.apply(&patch).unwrap();

        assert_eq!(next.max_num_hands, 1);
        assert_eq!(next.min_detection_confidence, 0.8);
        assert_eq!(next.min_tracking_confidence, base.min_tracking_confidence);
        assert_eq!(next.model_complexity, base.model_complexity);
        // 元の設定は変わらない
        assert_eq!(base, DetectorConfig::default());
    }

    #[test]
    fn test_apply_empty_patch_is_identity() {
        let base = DetectorConfig {
            model_complexity: 2,
            ..DetectorConfig::default()
        };
        assert_eq!(base.apply(&DetectorConfigPatch::default()).unwrap(), base);
    }

    #[test]
    fn test_apply_rejects_out_of_range() {
        let base = DetectorConfig::default();
        let bad = [
            DetectorConfigPatch { min_detection_confidence: Some(1.5), ..Default::default() },
            DetectorConfigPatch { min_tracking_confidence: Some(-0.1), ..Default::default() },
            DetectorConfigPatch { max_num_hands: Some(0), ..Default::default() },
            DetectorConfigPatch { model_complexity: Some(3), ..Default::default() },
        ];
        for patch in &bad {
            assert!(matches!(base.apply(patch), Err(WorkerError::InvalidConfig(_))), "{:?}", patch);
        }
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[detector]\nmax_num_hands = 1\n\n[protocol]\nmax_payload_bytes = 1024\n\n[model]\npose_models = [\"a.onnx\"]"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.detector.max_num_hands, 1);
        assert_eq!(config.detector.model_complexity, 1);
        assert_eq!(config.protocol.max_payload_bytes, 1024);
        assert_eq!(config.protocol.max_header_bytes, default_max_header_bytes());
        assert_eq!(config.model.pose_model(0), Some("a.onnx"));
        assert_eq!(config.model.pose_model(1), None);
        assert_eq!(config.model.hand_model, default_hand_model());
    }

    #[test]
    fn test_load_rejects_invalid_detector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[detector]\nmodel_complexity = 7").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.detector, DetectorConfig::default());
        assert_eq!(config.protocol, ProtocolConfig::default());
    }
}
