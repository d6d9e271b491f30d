use serde::Serialize;

use crate::pose::detector::{HandDetection, Handedness};
use crate::pose::landmark::{hand_point, BBox, Center, HandLandmark, Landmark};

/// 指が伸びているか（先端が MCP 関節より上、y は下向きが正）
fn finger_extended(landmarks: &[Landmark], tip: HandLandmark, mcp: HandLandmark) -> Option<bool> {
    let tip = hand_point(landmarks, tip)?;
    let mcp = hand_point(landmarks, mcp)?;
    Some(tip.y < mcp.y)
}

/// V サイン判定
///
/// 人差し指・中指が伸び、薬指・小指が曲がっていれば true。
/// ランドマークが欠けていれば false。
pub fn is_v_gesture(landmarks: &[Landmark]) -> bool {
    let check = || -> Option<bool> {
        let index = finger_extended(landmarks, HandLandmark::IndexTip, HandLandmark::IndexMcp)?;
        let middle = finger_extended(landmarks, HandLandmark::MiddleTip, HandLandmark::MiddleMcp)?;
        let ring = finger_extended(landmarks, HandLandmark::RingTip, HandLandmark::RingMcp)?;
        let pinky = finger_extended(landmarks, HandLandmark::PinkyTip, HandLandmark::PinkyMcp)?;
        Some(index && middle && !ring && !pinky)
    };
    check().unwrap_or(false)
}

/// レスポンスに載せる手の情報
#[derive(Debug, Clone, Serialize)]
pub struct HandResult {
    pub handedness: Handedness,
    pub confidence: f32,
    pub bbox: Option<BBox>,
    pub center: Option<Center>,
    pub landmarks: Vec<Landmark>,
    pub is_v_gesture: bool,
}

impl HandResult {
    /// ランドマークは出力座標系に変換済みであること
    pub fn from_detection(detection: HandDetection) -> Self {
        let bbox = BBox::enclosing(&detection.landmarks);
        Self {
            handedness: detection.handedness,
            confidence: detection.score,
            center: bbox.as_ref().map(BBox::center),
            bbox,
            is_v_gesture: is_v_gesture(&detection.landmarks),
            landmarks: detection.landmarks,
        }
    }
}
