use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::landmark::Landmark;
use crate::config::DetectorConfig;

/// ワーカーが扱うランドマークの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Task {
    /// 手のランドマークと V サイン
    Hand,
    /// 全身ランドマークと録画トリガー
    Pose,
}

/// 左右の手
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handedness {
    Left,
    Right,
}

/// ランドマークモデルが検出した 1 つの手
#[derive(Debug, Clone, PartialEq)]
pub struct HandDetection {
    pub handedness: Handedness,
    /// 左右判定の信頼度
    pub score: f32,
    /// 解析画像内の正規化座標（HandLandmark 順）
    pub landmarks: Vec<Landmark>,
}

/// 1 フレーム分のモデル出力
#[derive(Debug, Clone, PartialEq)]
pub enum Detections {
    Hands(Vec<HandDetection>),
    /// 人物が居なければ None
    Pose(Option<Vec<Landmark>>),
}

/// 外部ランドマークモデル（画像 → 順序付きランドマーク列）
pub trait LandmarkModel {
    fn detect(&mut self, image: &RgbImage) -> Result<Detections>;
}

/// 設定からモデルハンドルを生成する
pub trait ModelLoader {
    fn load(&self, config: &DetectorConfig) -> Result<Box<dyn LandmarkModel>>;
}

impl<F> ModelLoader for F
where
    F: Fn(&DetectorConfig) -> Result<Box<dyn LandmarkModel>>,
{
    fn load(&self, config: &DetectorConfig) -> Result<Box<dyn LandmarkModel>> {
        self(config)
    }
}

/// 設定とモデルハンドルの組
///
/// 設定は生成時に固定。設定変更は新しいセッションを作って差し替える。
pub struct DetectorSession {
    config: DetectorConfig,
    model: Box<dyn LandmarkModel>,
}

impl DetectorSession {
    pub fn open<L: ModelLoader + ?Sized>(config: DetectorConfig, loader: &L) -> Result<Self> {
        config.validate()?;
        let model = loader.load(&config)?;
        Ok(Self { config, model })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn detect(&mut self, image: &RgbImage) -> Result<Detections> {
        self.model.detect(image)
    }
}
