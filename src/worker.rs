//! Request dispatch and the read-process-respond loop.
//!
//! Strictly one request at a time: a message is decoded, handled and its
//! response flushed before the next message is read.

use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{DetectorConfig, DetectorConfigPatch, ProtocolConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::pose::crop::{crop_image, crop_rect, CropRequest};
use crate::pose::detector::{Detections, DetectorSession, ModelLoader};
use crate::pose::landmark::Landmark;
use crate::protocol::{
    request_stream, response_sink, send_response, Command, FrameRequest, Framing, Message,
    Response,
};
use crate::signals::{HandResult, PoseResult};

/// Owns the active detector session and the loader that builds new ones.
pub struct Worker {
    loader: Box<dyn ModelLoader>,
    /// Startup config; `config` requests are applied on top of this, not on
    /// top of the previous request.
    base: DetectorConfig,
    session: DetectorSession,
}

impl Worker {
    pub fn new(loader: Box<dyn ModelLoader>, config: DetectorConfig) -> Result<Self> {
        let session = DetectorSession::open(config.clone(), loader.as_ref())
            .context("failed to open detector session")?;
        Ok(Self {
            loader,
            base: config,
            session,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        self.session.config()
    }

    /// Turn one decoded message into exactly one response.
    pub fn handle(&mut self, message: Message) -> Response {
        let result = match message {
            Message::Malformed(e) => Err(e),
            Message::Request { header, payload } => {
                Command::from_header(header).and_then(|command| self.dispatch(command, payload))
            }
        };
        result.unwrap_or_else(|e| {
            warn!("request failed: {}", e);
            Response::error(e)
        })
    }

    fn dispatch(&mut self, command: Command, payload: Option<Bytes>) -> WorkerResult<Response> {
        match command {
            Command::Ping => Ok(Response::pong()),
            Command::Config(patch) => {
                self.reconfigure(&patch)?;
                Ok(Response::config_updated())
            }
            Command::ProcessFrame(frame) => self.process_frame(&frame, payload),
        }
    }

    /// Build a new session from the startup config plus `patch` and swap it in.
    /// Fields the patch leaves out fall back to the startup values.
    /// On failure the current session stays active.
    pub fn reconfigure(&mut self, patch: &DetectorConfigPatch) -> WorkerResult<()> {
        let config = self.base.apply(patch)?;
        let session =
            DetectorSession::open(config, self.loader.as_ref()).map_err(WorkerError::ModelLoad)?;
        info!("detector reconfigured: {:?}", session.config());
        self.session = session;
        Ok(())
    }

    fn process_frame(&mut self, frame: &FrameRequest, payload: Option<Bytes>) -> WorkerResult<Response> {
        let started = Instant::now();
        let crop = CropRequest::resolve(frame.crop_info, frame.roi_info, frame.coordinates)?;
        let bytes = frame.image_bytes(payload)?;
        let mut image = image::load_from_memory(&bytes)?;

        if let Some(crop) = &crop {
            let rect = crop_rect(image.width(), image.height(), &crop.descriptor)
                .ok_or(WorkerError::EmptyImage)?;
            debug!("crop {:?} -> {:?}", crop.descriptor, rect);
            image = crop_image(&image, &rect);
        }

        let detections = self
            .session
            .detect(&image.to_rgb8())
            .map_err(WorkerError::Processing)?;
        let max_hands = self.session.config().max_num_hands as usize;
        let response = build_response(detections, crop.as_ref(), max_hands);
        debug!("frame processed in {:?}", started.elapsed());
        Ok(response)
    }
}

fn build_response(detections: Detections, crop: Option<&CropRequest>, max_hands: usize) -> Response {
    let to_output_space = |landmarks: &mut Vec<Landmark>| {
        if let Some(crop) = crop {
            crop.to_output_space(landmarks);
        }
    };
    match detections {
        Detections::Hands(hands) => Response::hands(
            hands
                .into_iter()
                .take(max_hands)
                .map(|mut hand| {
                    to_output_space(&mut hand.landmarks);
                    HandResult::from_detection(hand)
                })
                .collect(),
        ),
        Detections::Pose(landmarks) => Response::pose(PoseResult::from_landmarks(landmarks.map(
            |mut landmarks| {
                to_output_space(&mut landmarks);
                landmarks
            },
        ))),
    }
}

/// Serve requests until the input closes.
///
/// Errors returned from here are fatal: one `Fatal error` line is written
/// (best effort) before the error is handed back to the caller.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    framing: Framing,
    limits: ProtocolConfig,
    worker: &mut Worker,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = request_stream(reader, framing, limits);
    let mut responses = response_sink(writer);
    let mut handled = 0u64;

    let result = async {
        while let Some(message) = requests.next().await {
            let message = message.context("failed to read request")?;
            let response = worker.handle(message);
            send_response(&mut responses, &response)
                .await
                .context("failed to write response")?;
            handled += 1;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    match &result {
        Ok(()) => info!("input closed after {} requests", handled),
        Err(e) => {
            error!("{:#}", e);
            let _ = send_response(&mut responses, &Response::fatal(e)).await;
        }
    }
    result
}
