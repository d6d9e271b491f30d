pub mod body;
pub mod hand;

pub use body::{
    body_bbox, check_full_body, check_stop_condition, detect_back_view, BackView, FullBody,
    PoseResult, StopCheck, StopDebug,
};
pub use hand::{is_v_gesture, HandResult};
