use serde::{Deserialize, Serialize};

/// ボディランドマークのインデックス（33点、MediaPipe Pose 準拠）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum PoseLandmark {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

impl PoseLandmark {
    pub const COUNT: usize = 33;
}

/// ハンドランドマークのインデックス（21点）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum HandLandmark {
    Wrist = 0,
    ThumbCmc = 1,
    ThumbMcp = 2,
    ThumbIp = 3,
    ThumbTip = 4,
    IndexMcp = 5,
    IndexPip = 6,
    IndexDip = 7,
    IndexTip = 8,
    MiddleMcp = 9,
    MiddlePip = 10,
    MiddleDip = 11,
    MiddleTip = 12,
    RingMcp = 13,
    RingPip = 14,
    RingDip = 15,
    RingTip = 16,
    PinkyMcp = 17,
    PinkyPip = 18,
    PinkyDip = 19,
    PinkyTip = 20,
}

impl HandLandmark {
    pub const COUNT: usize = 21;
}

/// 単一ランドマーク
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    /// 正規化されたX座標 (0.0〜1.0、解析した画像領域基準)
    pub x: f32,
    /// 正規化されたY座標 (0.0〜1.0、下向きが正)
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f32>,
    /// 可視性 (0.0〜1.0)。ハンドランドマークには無い
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f32>,
}

impl Landmark {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            z: None,
            visibility: None,
        }
    }

    pub fn with_z(mut self, z: f32) -> Self {
        self.z = Some(z);
        self
    }

    pub fn with_visibility(mut self, visibility: f32) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// 可視性（無ければ 0.0 扱い）
    pub fn visibility_or_zero(&self) -> f32 {
        self.visibility.unwrap_or(0.0)
    }
}

/// 名前付きインデックスでランドマークを引く。範囲外なら None
pub fn pose_point(landmarks: &[Landmark], index: PoseLandmark) -> Option<&Landmark> {
    landmarks.get(index as usize)
}

pub fn hand_point(landmarks: &[Landmark], index: HandLandmark) -> Option<&Landmark> {
    landmarks.get(index as usize)
}

/// 正規化座標の BBox
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// BBox の中心
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Center {
    pub x: f32,
    pub y: f32,
}

impl BBox {
    /// 点群の min/max から BBox を作る。点が無ければ None
    pub fn enclosing<'a, I>(landmarks: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Landmark>,
    {
        let mut bbox: Option<BBox> = None;
        for lm in landmarks {
            bbox = Some(match bbox {
                None => BBox {
                    x1: lm.x,
                    y1: lm.y,
                    x2: lm.x,
                    y2: lm.y,
                },
                Some(b) => BBox {
                    x1: b.x1.min(lm.x),
                    y1: b.y1.min(lm.y),
                    x2: b.x2.max(lm.x),
                    y2: b.y2.max(lm.y),
                },
            });
        }
        bbox
    }

    pub fn center(&self) -> Center {
        Center {
            x: (self.x1 + self.x2) / 2.0,
            y: (self.y1 + self.y2) / 2.0,
        }
    }
}
