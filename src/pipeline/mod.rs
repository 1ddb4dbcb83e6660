//! The processor chain.
//!
//! A [`Pipeline`] strings user stages between two synthetic processors:
//! `source` at the head and `sink` at the tail. Frames that reach either
//! end are bridged to the owning task — downstream frames at the sink,
//! upstream frames at the source — so no stage ever needs to know the
//! chain topology.

use crate::error::Result;
use crate::frames::{Frame, FrameDirection};
use crate::processor::{FrameHandler, Processor, ProcessorContext};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A frame that fell off one end of the chain, bound for the task.
#[derive(Debug)]
pub(crate) struct TaskEnvelope {
    pub frame: Frame,
    pub direction: FrameDirection,
}

/// Head of the chain: passes downstream traffic into the chain and hands
/// upstream arrivals to the task.
struct SourceHandler {
    to_task: mpsc::UnboundedSender<TaskEnvelope>,
}

#[async_trait]
impl FrameHandler for SourceHandler {
    fn name(&self) -> &str {
        "source"
    }

    async fn handle_frame(
        &self,
        ctx: &ProcessorContext,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match direction {
            FrameDirection::Downstream => ctx.forward(frame, direction).await,
            FrameDirection::Upstream => {
                let _ = self.to_task.send(TaskEnvelope { frame, direction });
                Ok(())
            }
        }
    }
}

/// Tail of the chain: hands downstream arrivals to the task and passes
/// upstream traffic back into the chain.
struct SinkHandler {
    to_task: mpsc::UnboundedSender<TaskEnvelope>,
}

#[async_trait]
impl FrameHandler for SinkHandler {
    fn name(&self) -> &str {
        "sink"
    }

    async fn handle_frame(
        &self,
        ctx: &ProcessorContext,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match direction {
            FrameDirection::Downstream => {
                let _ = self.to_task.send(TaskEnvelope { frame, direction });
                Ok(())
            }
            FrameDirection::Upstream => ctx.forward(frame, direction).await,
        }
    }
}

/// An ordered chain of processors with synthetic source and sink.
pub struct Pipeline {
    /// All processors, source first and sink last.
    processors: Vec<Processor>,
}

impl Pipeline {
    pub(crate) fn new(
        stages: Vec<Processor>,
        to_task: mpsc::UnboundedSender<TaskEnvelope>,
    ) -> Self {
        let source = Processor::new(SourceHandler {
            to_task: to_task.clone(),
        });
        let sink = Processor::new(SinkHandler { to_task });

        let mut processors = Vec::with_capacity(stages.len() + 2);
        processors.push(source);
        processors.extend(stages);
        processors.push(sink);

        for index in 0..processors.len() - 1 {
            processors[index].link(&processors[index + 1]);
        }

        let names: Vec<&str> = processors.iter().map(Processor::name).collect();
        info!("pipeline chain: {}", names.join(" -> "));
        Self { processors }
    }

    /// Start every processor in chain order.
    ///
    /// # Errors
    ///
    /// Propagates the first stage `on_start` failure.
    pub(crate) async fn start(&self, parent: &CancellationToken) -> Result<()> {
        for processor in &self.processors {
            processor.start(parent).await?;
        }
        Ok(())
    }

    /// Stop every processor in reverse chain order.
    pub(crate) async fn stop(&self) {
        for processor in self.processors.iter().rev() {
            processor.stop().await;
        }
        debug!("pipeline stopped");
    }

    /// Enqueue a frame at the source, travelling downstream.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled` once the session is shutting down.
    pub(crate) async fn queue_frame(&self, frame: Frame) -> Result<()> {
        self.processors[0]
            .queue_frame(frame, FrameDirection::Downstream)
            .await
    }
}
