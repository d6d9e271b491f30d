pub mod crop;
pub mod detector;
pub mod landmark;
#[cfg(feature = "onnx")]
pub mod onnx;
#[cfg(feature = "onnx")]
pub mod preprocess;

pub use crop::{crop_image, crop_rect, remap_landmarks, CoordinateSpace, CropDescriptor, CropRequest, PixelRect};
pub use detector::{
    DetectorSession, Detections, HandDetection, Handedness, LandmarkModel, ModelLoader, Task,
};
pub use landmark::{BBox, Center, HandLandmark, Landmark, PoseLandmark};
#[cfg(feature = "onnx")]
pub use onnx::{OnnxHandModel, OnnxLoader, OnnxPoseModel};
