//! End-to-end tests: raw request bytes in, JSON response lines out.

use std::cell::Cell;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, ReadBuf};

use landmark_worker::config::{DetectorConfig, ProtocolConfig};
use landmark_worker::pose::{
    Detections, HandDetection, HandLandmark, Handedness, Landmark, LandmarkModel, PoseLandmark,
};
use landmark_worker::protocol::{encode_binary_message, Framing};
use landmark_worker::worker::{serve, Worker};

/// V サインの手を 2 つ返す
struct TwoPeaceHands;

fn peace_hand() -> Vec<Landmark> {
    let mut landmarks = vec![Landmark::new(0.5, 0.5); HandLandmark::COUNT];
    landmarks[HandLandmark::Wrist as usize] = Landmark::new(0.5, 0.9);
    landmarks[HandLandmark::IndexTip as usize] = Landmark::new(0.1, 0.1);
    landmarks[HandLandmark::MiddleTip as usize] = Landmark::new(0.3, 0.1);
    landmarks[HandLandmark::RingTip as usize] = Landmark::new(0.5, 0.7);
    landmarks[HandLandmark::PinkyTip as usize] = Landmark::new(0.7, 0.7);
    landmarks
}

impl LandmarkModel for TwoPeaceHands {
    fn detect(&mut self, _image: &RgbImage) -> anyhow::Result<Detections> {
        let hand = |handedness| HandDetection {
            handedness,
            score: 0.95,
            landmarks: peace_hand(),
        };
        Ok(Detections::Hands(vec![
            hand(Handedness::Left),
            hand(Handedness::Right),
        ]))
    }
}

/// 全点が見えている人物、または誰もいない
struct StandingPerson {
    present: bool,
}

impl LandmarkModel for StandingPerson {
    fn detect(&mut self, _image: &RgbImage) -> anyhow::Result<Detections> {
        if !self.present {
            return Ok(Detections::Pose(None));
        }
        let landmarks = (0..PoseLandmark::COUNT)
            .map(|i| Landmark::new(0.2 + 0.6 * i as f32 / 32.0, 0.5).with_visibility(0.9))
            .collect();
        Ok(Detections::Pose(Some(landmarks)))
    }
}

fn hand_worker(loads: Rc<Cell<u32>>) -> Worker {
    let loader = move |_: &DetectorConfig| -> anyhow::Result<Box<dyn LandmarkModel>> {
        loads.set(loads.get() + 1);
        Ok(Box::new(TwoPeaceHands))
    };
    Worker::new(Box::new(loader), DetectorConfig::default()).unwrap()
}

fn pose_worker(present: bool) -> Worker {
    let loader = move |_: &DetectorConfig| -> anyhow::Result<Box<dyn LandmarkModel>> {
        Ok(Box::new(StandingPerson { present }))
    };
    Worker::new(Box::new(loader), DetectorConfig::default()).unwrap()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn message(header: Value, payload: Option<&[u8]>) -> Vec<u8> {
    encode_binary_message(&header, payload).unwrap().to_vec()
}

fn frame(image: &[u8], extra: Value) -> Vec<u8> {
    let mut header = json!({
        "type": "process_frame",
        "format": "binary",
        "data_length": image.len(),
    });
    if let (Some(header), Value::Object(extra)) = (header.as_object_mut(), extra) {
        header.extend(extra);
    }
    message(header, Some(image))
}

fn ping() -> Vec<u8> {
    message(json!({"type": "ping"}), None)
}

async fn run_with(worker: &mut Worker, framing: Framing, limits: ProtocolConfig, input: &[u8]) -> Vec<Value> {
    let mut output = Vec::new();
    serve(input, &mut output, framing, limits, worker).await.unwrap();
    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// serve が失敗で終わる場合: 出力行と結果を両方返す
async fn run_failing<R: AsyncRead + Unpin>(worker: &mut Worker, input: R) -> (Vec<Value>, anyhow::Result<()>) {
    let mut output = Vec::new();
    let result = serve(input, &mut output, Framing::Binary, ProtocolConfig::default(), worker).await;
    let lines = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    (lines, result)
}

/// 先頭のバイト列を返した後、読み込みエラーになるパイプ
struct BrokenPipe {
    data: Vec<u8>,
}

impl AsyncRead for BrokenPipe {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.data.is_empty() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")));
        }
        let n = self.data.len().min(buf.remaining());
        let chunk: Vec<u8> = self.data.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

async fn run(worker: &mut Worker, input: &[u8]) -> Vec<Value> {
    run_with(worker, Framing::Binary, ProtocolConfig::default(), input).await
}

fn assert_close(value: &Value, expected: f64) {
    let actual = value.as_f64().unwrap();
    assert!((actual - expected).abs() < 1e-4, "{} != {}", actual, expected);
}

#[tokio::test]
async fn test_ping_is_idempotent() {
    let mut worker = pose_worker(true);
    let input = [ping(), ping()].concat();
    let responses = run(&mut worker, &input).await;
    assert_eq!(responses, vec![json!({"success": true, "message": "pong"}); 2]);
}

#[tokio::test]
async fn test_truncated_header_ends_stream_silently() {
    let mut worker = pose_worker(true);
    let responses = run(&mut worker, &[5, 0, 0, 0, b'{', b'"', b't']).await;
    assert!(responses.is_empty());
}

#[tokio::test]
async fn test_truncated_payload_after_valid_request() {
    let mut worker = pose_worker(true);
    let image = png(8, 8);
    let mut input = ping();
    let full = frame(&image, json!({}));
    input.extend_from_slice(&full[..full.len() - 3]);
    let responses = run(&mut worker, &input).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["message"], "pong");
}

#[tokio::test]
async fn test_invalid_header_then_ping() {
    let mut worker = pose_worker(true);
    let garbage = b"{not json";
    let mut input = (garbage.len() as u32).to_le_bytes().to_vec();
    input.extend_from_slice(garbage);
    input.extend(ping());

    let responses = run(&mut worker, &input).await;
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["success"], false);
    assert!(responses[0]["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid header JSON"));
    assert!(responses[0]["timestamp"].is_number());
    assert_eq!(responses[1]["message"], "pong");
}

#[tokio::test]
async fn test_unknown_command_type() {
    let mut worker = pose_worker(true);
    let input = message(json!({"type": "dance"}), None);
    let responses = run(&mut worker, &input).await;
    assert_eq!(responses[0]["success"], false);
    assert_eq!(responses[0]["error"], "Unknown command type: dance");
}

#[tokio::test]
async fn test_integral_float_data_length_keeps_sync() {
    let mut worker = pose_worker(true);
    let image = png(16, 16);
    let mut input = message(
        json!({"type": "process_frame", "format": "binary", "data_length": image.len() as f64}),
        Some(&image),
    );
    input.extend(ping());

    let responses = run(&mut worker, &input).await;
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["pose"]["detected"], true);
    assert_eq!(responses[1]["message"], "pong");
}

#[tokio::test]
async fn test_unusable_data_length_is_fatal() {
    let mut worker = pose_worker(true);
    let mut input = ping();
    input.extend(message(
        json!({"type": "process_frame", "format": "binary", "data_length": "lots"}),
        Some(&[1, 2, 3, 4]),
    ));
    input.extend(ping());

    let (responses, result) = run_failing(&mut worker, &input[..]).await;
    assert!(result.is_err());
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["message"], "pong");
    assert_eq!(responses[1]["success"], false);
    let error = responses[1]["error"].as_str().unwrap();
    assert!(error.starts_with("Fatal error:"), "{}", error);
    assert!(error.contains("Invalid data_length"), "{}", error);
}

#[tokio::test]
async fn test_read_failure_writes_one_fatal_line() {
    let mut worker = pose_worker(true);
    let (responses, result) = run_failing(&mut worker, BrokenPipe { data: ping() }).await;

    assert!(result.is_err());
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0], json!({"success": true, "message": "pong"}));
    assert_eq!(responses[1]["success"], false);
    assert!(responses[1]["error"]
        .as_str()
        .unwrap()
        .starts_with("Fatal error:"));
    assert!(responses[1]["timestamp"].is_number());
}

#[tokio::test]
async fn test_oversized_messages_are_skipped() {
    let mut worker = pose_worker(true);
    let limits = ProtocolConfig {
        max_header_bytes: 128,
        max_payload_bytes: 16,
    };
    let padding = "x".repeat(200);
    let mut input = message(json!({"type": "ping", "padding": padding}), None);
    input.extend(frame(&[0u8; 64], json!({})));
    input.extend(ping());

    let responses = run_with(&mut worker, Framing::Binary, limits, &input).await;
    assert_eq!(responses.len(), 3);
    assert!(responses[0]["error"].as_str().unwrap().contains("header"));
    assert!(responses[1]["error"].as_str().unwrap().contains("image payload"));
    assert_eq!(responses[2]["message"], "pong");
}

#[tokio::test]
async fn test_pose_frame_full_body() {
    let mut worker = pose_worker(true);
    let responses = run(&mut worker, &frame(&png(32, 32), json!({}))).await;
    let pose = &responses[0]["pose"];
    assert_eq!(responses[0]["success"], true);
    assert!(responses[0]["timestamp"].is_number());
    assert_eq!(pose["detected"], true);
    assert_eq!(pose["full_body_visible"], true);
    assert_close(&pose["confidence"], 0.9);
    assert_eq!(pose["should_stop_recording"], false);
    assert_eq!(pose["landmarks"].as_array().unwrap().len(), PoseLandmark::COUNT);
}

#[tokio::test]
async fn test_pose_frame_without_person_stops_recording() {
    let mut worker = pose_worker(false);
    let responses = run(&mut worker, &frame(&png(32, 32), json!({}))).await;
    let pose = &responses[0]["pose"];
    assert_eq!(pose["detected"], false);
    assert_eq!(pose["full_body_visible"], false);
    assert_eq!(pose["should_stop_recording"], true);
    assert_eq!(pose["back_view"]["is_back_view"], false);
    assert_eq!(pose["back_view"]["reason"], "no_landmarks");
    assert_eq!(pose["stop_debug"]["left_gone"], true);
    assert_eq!(pose["stop_debug"]["right_gone"], true);
}

#[tokio::test]
async fn test_hand_frame_crop_info_remaps_to_frame() {
    let mut worker = hand_worker(Rc::new(Cell::new(0)));
    let crop = json!({"crop_info": {"offsetX": 0.5, "offsetY": 0.5, "scaleX": 0.5, "scaleY": 0.5}});
    let responses = run(&mut worker, &frame(&png(100, 50), crop)).await;

    let hands = responses[0]["hands"].as_array().unwrap();
    assert_eq!(hands.len(), 2);
    assert_eq!(hands[0]["handedness"], "Left");
    assert_eq!(hands[0]["is_v_gesture"], true);
    let tip = &hands[0]["landmarks"][HandLandmark::IndexTip as usize];
    assert_close(&tip["x"], 0.55);
    assert_close(&tip["y"], 0.55);
}

#[tokio::test]
async fn test_hand_frame_roi_info_stays_in_crop() {
    let mut worker = hand_worker(Rc::new(Cell::new(0)));
    let roi = json!({"roi_info": {"offsetX": 0.5, "offsetY": 0.5, "scaleX": 0.5, "scaleY": 0.5}});
    let responses = run(&mut worker, &frame(&png(100, 50), roi)).await;

    let tip = &responses[0]["hands"][0]["landmarks"][HandLandmark::IndexTip as usize];
    assert_close(&tip["x"], 0.1);
    assert_close(&tip["y"], 0.1);
}

#[tokio::test]
async fn test_config_swaps_session_and_rejects_invalid() {
    let loads = Rc::new(Cell::new(0));
    let mut worker = hand_worker(Rc::clone(&loads));
    let image = png(16, 16);

    let mut input = frame(&image, json!({}));
    input.extend(message(json!({"type": "config", "config": {"max_num_hands": 1}}), None));
    input.extend(frame(&image, json!({})));
    input.extend(message(
        json!({"type": "config", "config": {"min_detection_confidence": 1.5}}),
        None,
    ));
    input.extend(frame(&image, json!({})));
    // 省略した項目は起動時の設定に戻る
    input.extend(message(
        json!({"type": "config", "config": {"min_detection_confidence": 0.7}}),
        None,
    ));
    input.extend(frame(&image, json!({})));

    let responses = run(&mut worker, &input).await;
    assert_eq!(responses.len(), 7);
    assert_eq!(responses[0]["hands"].as_array().unwrap().len(), 2);
    assert_eq!(responses[1], json!({"success": true, "message": "config updated"}));
    assert_eq!(responses[2]["hands"].as_array().unwrap().len(), 1);
    assert_eq!(responses[3]["success"], false);
    assert_eq!(responses[4]["hands"].as_array().unwrap().len(), 1);
    assert_eq!(responses[5]["message"], "config updated");
    assert_eq!(responses[6]["hands"].as_array().unwrap().len(), 2);

    assert_eq!(loads.get(), 3);
    assert_eq!(worker.config().max_num_hands, 2);
    assert_eq!(worker.config().min_detection_confidence, 0.7);
}

#[tokio::test]
async fn test_lines_framing_with_base64() {
    let mut worker = pose_worker(true);
    let request = json!({
        "type": "process_frame",
        "format": "base64",
        "image_data": BASE64.encode(png(16, 16)),
    });
    let input = format!(
        "{}\n\n{}\n{}\n",
        json!({"type": "ping"}),
        request,
        json!({"type": "process_frame", "format": "base64", "image_data": "%%%"})
    );

    let responses = run_with(&mut worker, Framing::Lines, ProtocolConfig::default(), input.as_bytes()).await;
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["message"], "pong");
    assert_eq!(responses[1]["pose"]["detected"], true);
    assert!(responses[2]["error"]
        .as_str()
        .unwrap()
        .starts_with("Base64 decode failed"));
}
