use serde::Serialize;

use crate::pose::landmark::{pose_point, BBox, Landmark, PoseLandmark};

/// 全身判定に使う 9 点
pub const FULL_BODY_LANDMARKS: [PoseLandmark; 9] = [
    PoseLandmark::Nose,
    PoseLandmark::LeftShoulder,
    PoseLandmark::RightShoulder,
    PoseLandmark::LeftHip,
    PoseLandmark::RightHip,
    PoseLandmark::LeftKnee,
    PoseLandmark::RightKnee,
    PoseLandmark::LeftAnkle,
    PoseLandmark::RightAnkle,
];

/// 停止判定: 左半身 6 点
pub const LEFT_SIDE_LANDMARKS: [PoseLandmark; 6] = [
    PoseLandmark::LeftEye,
    PoseLandmark::LeftEar,
    PoseLandmark::LeftShoulder,
    PoseLandmark::LeftWrist,
    PoseLandmark::LeftHip,
    PoseLandmark::LeftKnee,
];

/// 停止判定: 右半身 6 点
pub const RIGHT_SIDE_LANDMARKS: [PoseLandmark; 6] = [
    PoseLandmark::RightEye,
    PoseLandmark::RightEar,
    PoseLandmark::RightShoulder,
    PoseLandmark::RightWrist,
    PoseLandmark::RightHip,
    PoseLandmark::RightKnee,
];

/// 背面判定: 顔まわり 11 点
pub const FRONT_LANDMARKS: [PoseLandmark; 11] = [
    PoseLandmark::Nose,
    PoseLandmark::LeftEye,
    PoseLandmark::RightEye,
    PoseLandmark::LeftEyeInner,
    PoseLandmark::RightEyeInner,
    PoseLandmark::LeftEyeOuter,
    PoseLandmark::RightEyeOuter,
    PoseLandmark::LeftEar,
    PoseLandmark::RightEar,
    PoseLandmark::MouthLeft,
    PoseLandmark::MouthRight,
];

/// 背面判定: 肩・腰 4 点
pub const BACK_LANDMARKS: [PoseLandmark; 4] = [
    PoseLandmark::LeftShoulder,
    PoseLandmark::RightShoulder,
    PoseLandmark::LeftHip,
    PoseLandmark::RightHip,
];

const FULL_BODY_VISIBILITY: f32 = 0.7;
const FULL_BODY_RATIO: f32 = 0.8;
const SIDE_INVISIBLE_VISIBILITY: f32 = 0.3;
const BBOX_VISIBILITY: f32 = 0.5;
const BACK_FRONT_WEIGHT: f32 = 0.7;
const BACK_BACK_WEIGHT: f32 = 0.3;
const BACK_VIEW_THRESHOLD: f32 = 0.6;

/// 指定点の可視性を並べる。1 点でも欠けていればその点を返す
fn visibilities<const N: usize>(
    landmarks: &[Landmark],
    points: &[PoseLandmark; N],
) -> Result<[f32; N], PoseLandmark> {
    let mut out = [0.0; N];
    for (slot, &point) in out.iter_mut().zip(points) {
        *slot = pose_point(landmarks, point)
            .ok_or(point)?
            .visibility_or_zero();
    }
    Ok(out)
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// 全身可視判定の結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FullBody {
    pub visible: bool,
    /// 9 点全体の平均可視性
    pub confidence: f32,
}

impl FullBody {
    pub const NOT_VISIBLE: FullBody = FullBody {
        visible: false,
        confidence: 0.0,
    };
}

/// 9 点のうち 80% 以上が可視性 0.7 超なら全身が映っている
pub fn check_full_body(landmarks: &[Landmark]) -> FullBody {
    let Ok(vis) = visibilities(landmarks, &FULL_BODY_LANDMARKS) else {
        return FullBody::NOT_VISIBLE;
    };
    let visible_count = vis.iter().filter(|&&v| v > FULL_BODY_VISIBILITY).count();
    let required = FULL_BODY_LANDMARKS.len() as f32 * FULL_BODY_RATIO;
    FullBody {
        visible: visible_count as f32 >= required,
        confidence: mean(&vis),
    }
}

/// 停止判定のデバッグ情報
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopDebug {
    pub left_invisible: usize,
    pub left_total: usize,
    pub right_invisible: usize,
    pub right_total: usize,
    pub left_gone: bool,
    pub right_gone: bool,
    pub should_stop: bool,
}

impl StopDebug {
    /// 判定不能時: 欠けた点は不可視扱いで両側とも消失
    pub const FAIL_SAFE: StopDebug = StopDebug {
        left_invisible: LEFT_SIDE_LANDMARKS.len(),
        left_total: LEFT_SIDE_LANDMARKS.len(),
        right_invisible: RIGHT_SIDE_LANDMARKS.len(),
        right_total: RIGHT_SIDE_LANDMARKS.len(),
        left_gone: true,
        right_gone: true,
        should_stop: true,
    };
}

/// 停止判定の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCheck {
    Measured(StopDebug),
    /// ランドマーク無し・欠損。常に停止
    FailSafe,
}

impl StopCheck {
    pub fn should_stop(&self) -> bool {
        match self {
            StopCheck::Measured(debug) => debug.should_stop,
            StopCheck::FailSafe => true,
        }
    }

    pub fn debug(&self) -> StopDebug {
        match self {
            StopCheck::Measured(debug) => *debug,
            StopCheck::FailSafe => StopDebug::FAIL_SAFE,
        }
    }
}

/// 左右どちらかの 6 点がすべて可視性 0.3 未満なら録画停止
pub fn check_stop_condition(landmarks: &[Landmark]) -> StopCheck {
    if landmarks.is_empty() {
        return StopCheck::FailSafe;
    }
    let (Ok(left), Ok(right)) = (
        visibilities(landmarks, &LEFT_SIDE_LANDMARKS),
        visibilities(landmarks, &RIGHT_SIDE_LANDMARKS),
    ) else {
        return StopCheck::FailSafe;
    };

    let invisible = |vis: &[f32]| vis.iter().filter(|&&v| v < SIDE_INVISIBLE_VISIBILITY).count();
    let left_invisible = invisible(&left[..]);
    let right_invisible = invisible(&right[..]);
    let left_gone = left_invisible == left.len();
    let right_gone = right_invisible == right.len();

    StopCheck::Measured(StopDebug {
        left_invisible,
        left_total: left.len(),
        right_invisible,
        right_total: right.len(),
        left_gone,
        right_gone,
        should_stop: left_gone || right_gone,
    })
}

/// 背面判定の結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackView {
    pub is_back_view: bool,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub front_visibility: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub back_visibility: Option<f32>,
    pub reason: String,
}

impl BackView {
    /// 判定できなかった場合の既定値（正面扱い、信頼度 0）
    pub fn undetermined(reason: impl Into<String>) -> Self {
        Self {
            is_back_view: false,
            confidence: 0.0,
            front_visibility: None,
            back_visibility: None,
            reason: reason.into(),
        }
    }
}

/// 顔が見えず肩・腰が見えていれば背面
///
/// score = 0.7 * (1 - 顔平均) + 0.3 * 肩腰平均、0.6 超で背面。
pub fn detect_back_view(landmarks: &[Landmark]) -> BackView {
    if landmarks.is_empty() {
        return BackView::undetermined("no_landmarks");
    }
    let front = match visibilities(landmarks, &FRONT_LANDMARKS) {
        Ok(v) => v,
        Err(missing) => return BackView::undetermined(format!("error:missing {:?}", missing)),
    };
    let back = match visibilities(landmarks, &BACK_LANDMARKS) {
        Ok(v) => v,
        Err(missing) => return BackView::undetermined(format!("error:missing {:?}", missing)),
    };

    let front_avg = mean(&front);
    let back_avg = mean(&back);
    let score = BACK_FRONT_WEIGHT * (1.0 - front_avg) + BACK_BACK_WEIGHT * back_avg;

    BackView {
        is_back_view: score > BACK_VIEW_THRESHOLD,
        confidence: score,
        front_visibility: Some(front_avg),
        back_visibility: Some(back_avg),
        reason: format!("front_vis:{:.2}_back_vis:{:.2}", front_avg, back_avg),
    }
}

/// 可視性 0.5 超の点だけで BBox を作る
pub fn body_bbox(landmarks: &[Landmark]) -> Option<BBox> {
    BBox::enclosing(
        landmarks
            .iter()
            .filter(|lm| lm.visibility_or_zero() > BBOX_VISIBILITY),
    )
}

/// レスポンスに載せるポーズ情報
#[derive(Debug, Clone, Serialize)]
pub struct PoseResult {
    pub detected: bool,
    pub full_body_visible: bool,
    pub confidence: f32,
    pub should_stop_recording: bool,
    pub stop_debug: StopDebug,
    pub back_view: BackView,
    pub bbox: Option<BBox>,
    pub landmarks: Vec<Landmark>,
}

impl PoseResult {
    /// ランドマークは出力座標系に変換済みであること。None は人物なし
    pub fn from_landmarks(landmarks: Option<Vec<Landmark>>) -> Self {
        let landmarks = landmarks.unwrap_or_default();
        let full_body = check_full_body(&landmarks);
        let stop = check_stop_condition(&landmarks);
        Self {
            detected: !landmarks.is_empty(),
            full_body_visible: full_body.visible,
            confidence: full_body.confidence,
            should_stop_recording: stop.should_stop(),
            stop_debug: stop.debug(),
            back_view: detect_back_view(&landmarks),
            bbox: body_bbox(&landmarks),
            landmarks,
        }
    }
}
