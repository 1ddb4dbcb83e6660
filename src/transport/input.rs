//! Inbound transport stage.
//!
//! Pumps provider messages through a [`WireDeserializer`] and pushes the
//! resulting frames downstream. Sits at the head of the chain; everything
//! else passes through untouched.

use super::{WireDeserializer, WireMessage};
use crate::error::Result;
use crate::frames::{Frame, FrameDirection};
use crate::processor::{FrameHandler, ProcessorContext};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Pipeline stage feeding provider traffic into the session.
pub struct TransportInput {
    deserializer: Arc<dyn WireDeserializer>,
    wire_rx: Mutex<Option<mpsc::Receiver<WireMessage>>>,
}

impl TransportInput {
    /// Create the stage; the caller keeps the sender half of `wire_rx`.
    pub fn new(
        deserializer: Arc<dyn WireDeserializer>,
        wire_rx: mpsc::Receiver<WireMessage>,
    ) -> Self {
        Self {
            deserializer,
            wire_rx: Mutex::new(Some(wire_rx)),
        }
    }
}

#[async_trait]
impl FrameHandler for TransportInput {
    fn name(&self) -> &str {
        "transport-in"
    }

    async fn on_start(&self, ctx: &ProcessorContext) -> Result<()> {
        let receiver = match self.wire_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut wire_rx) = receiver else {
            return Ok(());
        };
        let deserializer = Arc::clone(&self.deserializer);
        let ctx = ctx.clone();
        let cancel = ctx.cancellation();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = wire_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                match deserializer.deserialize(message) {
                    Some(frame) => {
                        if ctx.push_downstream(frame).await.is_err() {
                            break;
                        }
                    }
                    None => debug!("ignoring unrecognized wire message"),
                }
            }
        });
        Ok(())
    }

    async fn handle_frame(
        &self,
        ctx: &ProcessorContext,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        ctx.forward(frame, direction).await
    }
}
