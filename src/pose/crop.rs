use image::DynamicImage;
use serde::Deserialize;

use super::landmark::Landmark;
use crate::error::WorkerError;

/// クロップ領域（正規化座標、画像幅・高さに対する割合）
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CropDescriptor {
    #[serde(rename = "offsetX")]
    pub offset_x: f64,
    #[serde(rename = "offsetY")]
    pub offset_y: f64,
    #[serde(rename = "scaleX")]
    pub scale_x: f64,
    #[serde(rename = "scaleY")]
    pub scale_y: f64,
}

impl CropDescriptor {
    pub fn new(offset_x: f64, offset_y: f64, scale_x: f64, scale_y: f64) -> Self {
        Self {
            offset_x,
            offset_y,
            scale_x,
            scale_y,
        }
    }

    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }
}

/// ピクセル座標の矩形（x2, y2 は含まない）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// CropDescriptor をピクセル矩形に変換し、画像内にクランプする
///
/// - 正規化値 × 画像サイズを 0 方向に切り捨て
/// - x1, y1 は [0, dim-1]、x2, y2 は [x1+1, dim] / [y1+1, dim] にクランプ
/// - 負値・範囲外・NaN でも空でない矩形を返す
///
/// 画像サイズが 0 の場合のみ None。
pub fn crop_rect(width: u32, height: u32, crop: &CropDescriptor) -> Option<PixelRect> {
    if width == 0 || height == 0 {
        return None;
    }
    let (x1, x2) = clamp_span(crop.offset_x, crop.scale_x, width);
    let (y1, y2) = clamp_span(crop.offset_y, crop.scale_y, height);
    Some(PixelRect { x1, y1, x2, y2 })
}

fn clamp_span(offset: f64, scale: f64, dim: u32) -> (u32, u32) {
    let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
    let (offset, scale) = (finite(offset), finite(scale));
    let dim_f = f64::from(dim);
    let dim = i64::from(dim);
    // `as i64` は 0 方向への切り捨て（範囲外は飽和）
    let start = (offset * dim_f) as i64;
    let end = ((offset + scale) * dim_f) as i64;

    let start = start.clamp(0, dim - 1);
    let end = end.min(dim).max(start + 1);
    (start as u32, end as u32)
}

/// 画像から矩形領域を切り出す
pub fn crop_image(image: &DynamicImage, rect: &PixelRect) -> DynamicImage {
    image.crop_imm(rect.x1, rect.y1, rect.width(), rect.height())
}

/// クロップ画像内の正規化座標をフレーム全体の正規化座標に変換
pub fn remap_landmarks(landmarks: &mut [Landmark], crop: &CropDescriptor) {
    for lm in landmarks.iter_mut() {
        lm.x = (crop.offset_x + f64::from(lm.x) * crop.scale_x) as f32;
        lm.y = (crop.offset_y + f64::from(lm.y) * crop.scale_y) as f32;
    }
}

/// 返却するランドマークの座標系
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    /// フレーム全体の正規化座標に戻す（remap）
    Frame,
    /// クロップ画像自身の正規化座標のまま
    Crop,
}

/// リクエスト毎のクロップ指定と座標系
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRequest {
    pub descriptor: CropDescriptor,
    pub space: CoordinateSpace,
}

impl CropRequest {
    /// ヘッダのクロップ指定から座標系を決める（唯一の判定箇所）
    ///
    /// - crop_info: デフォルトは Frame（remap）
    /// - roi_info: デフォルトは Crop（クロップ座標のまま）
    /// - coordinates が明示されていればそれを優先
    /// - 両方指定はエラー
    pub fn resolve(
        crop_info: Option<CropDescriptor>,
        roi_info: Option<CropDescriptor>,
        coordinates: Option<CoordinateSpace>,
    ) -> Result<Option<Self>, WorkerError> {
        let (descriptor, default_space) = match (crop_info, roi_info) {
            (Some(_), Some(_)) => return Err(WorkerError::ConflictingCrop),
            (Some(crop), None) => (crop, CoordinateSpace::Frame),
            (None, Some(roi)) => (roi, CoordinateSpace::Crop),
            (None, None) => return Ok(None),
        };
        Ok(Some(Self {
            descriptor,
            space: coordinates.unwrap_or(default_space),
        }))
    }

    /// モデル出力（クロップ座標）を要求された座標系に揃える
    pub fn to_output_space(&self, landmarks: &mut [Landmark]) {
        match self.space {
            CoordinateSpace::Frame => remap_landmarks(landmarks, &self.descriptor),
            CoordinateSpace::Crop => {}
        }
    }
}
