//! Tick driver for the detection pipeline.
//!
//! The pipeline lives on a dedicated OS thread that pulls the newest frame
//! once per tick. Callers talk to it through a cloneable [`EngineHandle`]:
//! enrollment requests are answered over a oneshot channel, and every tick's
//! result is published on a `watch` channel for presentation.

use crate::capability::{FaceDetector, FaceEmbedder};
use crate::pipeline::{
    DetectionPipeline, EnrollmentFailure, EnrollmentOutcome, PipelineSettings, TickResult,
};
use sightline_core::Matcher;
use sightline_hw::FrameProvider;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Timing of the engine loop.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub tick_interval: Duration,
    /// Ticks an enrollment may wait for a face before failing.
    pub enrollment_timeout_ticks: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            enrollment_timeout_ticks: 50,
        }
    }
}

/// Latest tick result as seen by subscribers; `None` until the first processed frame.
pub type LatestResult = Option<Arc<TickResult>>;

/// Messages sent from handles to the engine thread.
enum EngineRequest {
    Enroll {
        name: String,
        reply: oneshot::Sender<EnrollmentOutcome>,
    },
    UpdateSettings(PipelineSettings),
    Shutdown,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<EngineRequest>,
    results: watch::Receiver<LatestResult>,
}

impl EngineHandle {
    /// Request enrollment of the next single face seen under `name`.
    ///
    /// Resolves once the pipeline accepts or rejects the face, or after
    /// `enrollment_timeout_ticks` ticks without a face.
    pub async fn enroll(&self, name: impl Into<String>) -> Result<EnrollmentOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                name: name.into(),
                reply: reply_tx,
            })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub fn update_settings(&self, settings: PipelineSettings) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::UpdateSettings(settings))
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Receiver that is notified after every processed frame.
    pub fn subscribe(&self) -> watch::Receiver<LatestResult> {
        self.results.clone()
    }

    pub fn latest(&self) -> LatestResult {
        self.results.borrow().clone()
    }

    /// Ask the engine thread to exit. Pending enrollments fail with
    /// [`EnrollmentFailure::EngineStopped`].
    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineRequest::Shutdown);
    }
}

struct PendingReply {
    name: String,
    reply: oneshot::Sender<EnrollmentOutcome>,
    ticks_waited: u32,
}

struct EngineLoop<D, E, M: Matcher> {
    pipeline: DetectionPipeline<D, E, M>,
    frames: Arc<dyn FrameProvider>,
    options: EngineOptions,
    results: watch::Sender<LatestResult>,
    pending: Option<PendingReply>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread runs until [`EngineHandle::shutdown`] is called or every
/// handle has been dropped.
pub fn spawn_engine<D, E, M>(
    frames: Arc<dyn FrameProvider>,
    pipeline: DetectionPipeline<D, E, M>,
    options: EngineOptions,
) -> Result<EngineHandle, EngineError>
where
    D: FaceDetector + 'static,
    E: FaceEmbedder + 'static,
    M: Matcher + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>();
    let (results_tx, results_rx) = watch::channel(None);

    let engine = EngineLoop {
        pipeline,
        frames,
        options,
        results: results_tx,
        pending: None,
    };

    std::thread::Builder::new()
        .name("sightline-engine".into())
        .spawn(move || engine.run(rx))?;

    Ok(EngineHandle {
        tx,
        results: results_rx,
    })
}

impl<D, E, M> EngineLoop<D, E, M>
where
    D: FaceDetector,
    E: FaceEmbedder,
    M: Matcher,
{
    fn run(mut self, rx: Receiver<EngineRequest>) {
        tracing::info!(
            tick_ms = self.options.tick_interval.as_millis() as u64,
            "engine thread started"
        );
        let mut next_tick = Instant::now();

        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(EngineRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(request) => {
                    self.handle(request);
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            self.tick();

            // Skip missed ticks instead of bursting to catch up
            next_tick += self.options.tick_interval;
            let now = Instant::now();
            if next_tick < now {
                next_tick = now;
            }
        }

        self.pipeline.cancel_enrollment();
        self.reply(|name| EnrollmentOutcome::Failed {
            name,
            reason: EnrollmentFailure::EngineStopped,
        });
        tracing::info!("engine thread exiting");
    }

    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Enroll { name, reply } => {
                self.reply(|old| EnrollmentOutcome::Failed {
                    name: old,
                    reason: EnrollmentFailure::Superseded,
                });
                self.pipeline.request_enrollment(name.clone());
                self.pending = Some(PendingReply {
                    name,
                    reply,
                    ticks_waited: 0,
                });
            }
            EngineRequest::UpdateSettings(settings) => {
                tracing::debug!(?settings, "pipeline settings updated");
                self.pipeline.set_settings(settings);
            }
            // Handled by the loop
            EngineRequest::Shutdown => {}
        }
    }

    fn tick(&mut self) {
        let Some(frame) = self.frames.get_frame() else {
            tracing::trace!("no frame available yet");
            self.age_enrollment();
            return;
        };

        let result = self.pipeline.process(&frame);
        match &result.enrollment {
            Some(outcome) => {
                let outcome = outcome.clone();
                self.reply(move |_| outcome);
            }
            None => self.age_enrollment(),
        }
        self.results.send_replace(Some(Arc::new(result)));
    }

    fn age_enrollment(&mut self) {
        let limit = self.options.enrollment_timeout_ticks;
        let expired = match self.pending.as_mut() {
            Some(pending) => {
                pending.ticks_waited += 1;
                pending.ticks_waited >= limit
            }
            None => false,
        };
        if !expired {
            return;
        }

        self.pipeline.cancel_enrollment();
        tracing::info!(ticks = limit, "enrollment timed out without a face");
        self.reply(|name| EnrollmentOutcome::Failed {
            name,
            reason: EnrollmentFailure::NoFaceFound,
        });
    }

    /// Answer and clear the pending requester, if any.
    fn reply(&mut self, outcome: impl FnOnce(String) -> EnrollmentOutcome) {
        if let Some(pending) = self.pending.take() {
            // The requester may have stopped waiting
            let _ = pending.reply.send(outcome(pending.name));
        }
    }
}
