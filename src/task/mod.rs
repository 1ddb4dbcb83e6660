//! The session orchestrator.
//!
//! A [`PipelineTask`] owns one pipeline instance and the session
//! lifecycle around it: it injects the `Start` frame carrying the
//! interruption policy, drains user-queued frames into the source,
//! converts upstream interruption requests into downstream broadcasts,
//! and reports lifecycle transitions over a broadcast channel.

use crate::config::SessionConfig;
use crate::error::{AgentError, Result};
use crate::frames::{Frame, FrameDirection, FramePayload};
use crate::interrupt::{InterruptStrategy, build_strategies};
use crate::pipeline::{Pipeline, TaskEnvelope};
use crate::processor::Processor;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the user-frame ingress queue.
const USER_QUEUE_CAPACITY: usize = 100;

/// Lifecycle notifications emitted by a running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The `Start` frame traversed the whole chain.
    Started,
    /// The session ended (graceful `End` or immediate `Cancel`).
    Finished,
    /// A stage pushed an error to the task.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Running,
    Finished,
}

/// Per-session policy injected through the `Start` frame.
#[derive(Debug, Clone, Default)]
pub struct TaskParams {
    /// Master interruption gate.
    pub allow_interruptions: bool,
    /// Ordered strategy list, evaluated OR-wise.
    pub strategies: Vec<Arc<dyn InterruptStrategy>>,
}

impl TaskParams {
    /// Build params from a session config, instantiating the configured
    /// strategies.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            allow_interruptions: config.interruption.allow_interruptions,
            strategies: build_strategies(&config.interruption.strategies),
        }
    }
}

/// Clonable handle for queueing frames into a running session.
#[derive(Clone)]
pub struct TaskHandle {
    user_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Queue a frame into the pipeline source.
    ///
    /// Supported entries: `End`, `Cancel`, `Interruption`, `Text`,
    /// `MessagesAppend`, `MessagesUpdate`. Anything else is rejected.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled` once the session has shut down, or with a
    /// pipeline error for unsupported frames.
    pub async fn queue_frame(&self, frame: Frame) -> Result<()> {
        if !is_supported_entry(&frame.payload) {
            return Err(AgentError::Pipeline(format!(
                "frame {} cannot be queued from outside the pipeline",
                frame.name()
            )));
        }
        tokio::select! {
            () = self.cancel.cancelled() => Err(AgentError::Cancelled),
            sent = self.user_tx.send(frame) => {
                sent.map_err(|_| AgentError::Cancelled)
            }
        }
    }
}

fn is_supported_entry(payload: &FramePayload) -> bool {
    matches!(
        payload,
        FramePayload::End
            | FramePayload::Cancel
            | FramePayload::Interruption
            | FramePayload::Text { .. }
            | FramePayload::MessagesAppend { .. }
            | FramePayload::MessagesUpdate { .. }
    )
}

/// Owns a session: pipeline, lifecycle, user ingress, event fan-out.
pub struct PipelineTask {
    pipeline: Arc<Pipeline>,
    params: TaskParams,
    state: SessionState,
    user_tx: mpsc::Sender<Frame>,
    user_rx: Option<mpsc::Receiver<Frame>>,
    bridge_rx: mpsc::UnboundedReceiver<TaskEnvelope>,
    events_tx: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    started_emitted: bool,
    finished_emitted: bool,
    error_emitted: bool,
    end_injected: bool,
}

impl PipelineTask {
    /// Build a task around an ordered list of stages.
    pub fn new(stages: Vec<Processor>, params: TaskParams) -> Self {
        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::channel(USER_QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(32);
        Self {
            pipeline: Arc::new(Pipeline::new(stages, bridge_tx)),
            params,
            state: SessionState::Idle,
            user_tx,
            user_rx: Some(user_rx),
            bridge_rx,
            events_tx,
            cancel: CancellationToken::new(),
            started_emitted: false,
            finished_emitted: false,
            error_emitted: false,
            end_injected: false,
        }
    }

    /// A clonable handle for queueing frames from outside.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            user_tx: self.user_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// The session cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session to completion.
    ///
    /// Starts the pipeline, emits `Start`, processes bridge traffic until
    /// an `End` or `Cancel` reaches the sink (or the token is cancelled),
    /// then stops the pipeline in reverse order.
    ///
    /// # Errors
    ///
    /// Fails if the task already ran or a stage refuses to start.
    pub async fn run(mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(AgentError::Pipeline("task already ran".into()));
        }
        self.state = SessionState::Running;
        info!("session starting");

        self.pipeline.start(&self.cancel).await?;

        // Drain user-queued frames into the source on a separate task so
        // a full source queue can never stall bridge processing.
        let drainer = {
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            let mut user_rx = self
                .user_rx
                .take()
                .ok_or_else(|| AgentError::Pipeline("user queue already taken".into()))?;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        received = user_rx.recv() => {
                            let Some(frame) = received else { break };
                            debug!(frame = %frame, "ingesting user frame");
                            if pipeline.queue_frame(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        self.pipeline
            .queue_frame(Frame::new(FramePayload::Start {
                allow_interruptions: self.params.allow_interruptions,
                strategies: self.params.strategies.clone(),
            }))
            .await?;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                envelope = self.bridge_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if self.handle_envelope(envelope).await {
                        break;
                    }
                }
            }
        }

        self.cancel.cancel();
        let _ = drainer.await;
        self.pipeline.stop().await;
        self.state = SessionState::Finished;
        self.emit_finished();
        info!("session finished");
        Ok(())
    }

    /// Handle one frame bridged from the pipeline ends. Returns true when
    /// the session is over.
    async fn handle_envelope(&mut self, envelope: TaskEnvelope) -> bool {
        match envelope.direction {
            FrameDirection::Upstream => self.handle_upstream(envelope.frame).await,
            FrameDirection::Downstream => self.handle_downstream(envelope.frame),
        }
    }

    async fn handle_upstream(&mut self, frame: Frame) -> bool {
        match frame.payload {
            FramePayload::InterruptionTask => {
                info!("broadcasting interruption");
                // The broadcast keeps the request's timestamp: stages use
                // it to tell pre-decision work (flush it) from work the
                // same interruption triggered (keep it).
                let mut interruption = Frame::new(FramePayload::Interruption);
                interruption.created_at = frame.created_at;
                if let Err(e) = self.pipeline.queue_frame(interruption).await
                    && !e.is_cancelled()
                {
                    warn!("failed to broadcast interruption: {e}");
                }
            }
            FramePayload::Error { message, fatal } => {
                self.emit_error(&message);
                if fatal && !self.end_injected {
                    self.end_injected = true;
                    warn!("fatal stage error, ending session: {message}");
                    let _ = self.pipeline.queue_frame(Frame::new(FramePayload::End)).await;
                }
            }
            _ => {
                debug!(frame = %frame, "unhandled upstream frame at source");
            }
        }
        false
    }

    fn handle_downstream(&mut self, frame: Frame) -> bool {
        match frame.payload {
            FramePayload::Start { .. } => {
                if !self.started_emitted {
                    self.started_emitted = true;
                    let _ = self.events_tx.send(SessionEvent::Started);
                }
                false
            }
            FramePayload::End => {
                info!("end frame reached the sink");
                true
            }
            FramePayload::Cancel => {
                info!("cancel frame reached the sink");
                // Immediate shutdown: cancel first so queued work is
                // abandoned rather than drained.
                self.cancel.cancel();
                true
            }
            FramePayload::Error { message, .. } => {
                self.emit_error(&message);
                false
            }
            _ => false,
        }
    }

    fn emit_error(&mut self, message: &str) {
        warn!("session error: {message}");
        if !self.error_emitted {
            self.error_emitted = true;
            let _ = self.events_tx.send(SessionEvent::Error(message.to_owned()));
        }
    }

    fn emit_finished(&mut self) {
        if !self.finished_emitted {
            self.finished_emitted = true;
            let _ = self.events_tx.send(SessionEvent::Finished);
        }
    }
}
