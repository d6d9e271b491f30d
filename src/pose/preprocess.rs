use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// RGB 画像をランドマークモデル用の入力テンソルに変換
///
/// - size x size にリサイズ（アスペクト比は保持しない）
/// - [0, 255] → [0.0, 1.0] 正規化
/// - [1, size, size, 3] の NHWC f32 テンソル
pub fn to_nhwc_tensor(image: &RgbImage, size: u32) -> Array4<f32> {
    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    let s = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, s, s, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// ロジット → 確率
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
