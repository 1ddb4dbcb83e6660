//! Speech-to-text service stage.
//!
//! The vendor wire protocol lives behind [`SttClient`]/[`SttConnection`];
//! the stage owns the connection lifecycle, forwards inbound audio to the
//! vendor, and turns vendor events into `Transcription` frames. Transient
//! connection failures get one reconnect with a short jittered back-off;
//! a second failure is fatal to the session.

use crate::config::SttConfig;
use crate::error::Result;
use crate::frames::{Frame, FrameDirection, FramePayload};
use crate::processor::{FrameHandler, ProcessorContext};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 64;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);

/// Events pushed by an STT connection.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// A partial hypothesis, subject to revision.
    Interim(String),
    /// A final segment.
    Final(String),
    /// The connection closed.
    Closed,
    /// The connection failed.
    Error(String),
}

/// A live streaming connection to an STT vendor.
#[async_trait]
pub trait SttConnection: Send {
    /// Send raw audio bytes to the vendor.
    ///
    /// # Errors
    ///
    /// Returns an STT error if the connection is broken.
    async fn send_audio(&mut self, data: &[u8]) -> Result<()>;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns an STT error if the close handshake fails.
    async fn close(&mut self) -> Result<()>;
}

/// Factory for STT connections.
#[async_trait]
pub trait SttClient: Send + Sync {
    /// Open a streaming connection; events flow through `events`.
    ///
    /// # Errors
    ///
    /// Returns an STT error if the vendor is unreachable.
    async fn connect(
        &self,
        config: &SttConfig,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Box<dyn SttConnection>>;
}

struct SttInner {
    client: Arc<dyn SttClient>,
    config: SttConfig,
    connection: Mutex<Option<Box<dyn SttConnection>>>,
    events_tx: mpsc::Sender<SttEvent>,
    closing: AtomicBool,
}

impl SttInner {
    /// Reconnect once after a failure. A second failure surfaces a fatal
    /// error so the task can end the session.
    async fn recover(&self, ctx: &ProcessorContext, reason: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        warn!("STT connection lost ({reason}), reconnecting once");
        let mut connection = self.connection.lock().await;
        if let Some(mut old) = connection.take() {
            let _ = old.close().await;
        }

        let jitter = rand::thread_rng().gen_range(0..250);
        tokio::time::sleep(RECONNECT_BASE_DELAY + Duration::from_millis(jitter)).await;

        match self
            .client
            .connect(&self.config, self.events_tx.clone())
            .await
        {
            Ok(fresh) => {
                info!("STT reconnected");
                *connection = Some(fresh);
            }
            Err(e) => {
                let _ = ctx
                    .push_error(format!("STT reconnect failed: {e}"), true)
                    .await;
            }
        }
    }
}

/// Pipeline stage bridging inbound audio to a streaming STT vendor.
pub struct SttService {
    inner: Arc<SttInner>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<SttEvent>>>,
}

impl SttService {
    /// Create the stage over a vendor client.
    pub fn new(client: Arc<dyn SttClient>, config: SttConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(SttInner {
                client,
                config,
                connection: Mutex::new(None),
                events_tx,
                closing: AtomicBool::new(false),
            }),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        }
    }
}

#[async_trait]
impl FrameHandler for SttService {
    fn name(&self) -> &str {
        "stt"
    }

    async fn on_start(&self, ctx: &ProcessorContext) -> Result<()> {
        let connection = self
            .inner
            .client
            .connect(&self.inner.config, self.inner.events_tx.clone())
            .await?;
        *self.inner.connection.lock().await = Some(connection);
        info!(
            sample_rate = self.inner.config.sample_rate,
            "STT connected"
        );

        let Some(mut events_rx) = take_receiver(&self.events_rx) else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let cancel = ctx.cancellation();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    SttEvent::Interim(text) => {
                        let _ = ctx
                            .push_downstream(Frame::new(FramePayload::Transcription {
                                text,
                                is_final: false,
                            }))
                            .await;
                    }
                    SttEvent::Final(text) => {
                        debug!("final transcript: {text:?}");
                        let _ = ctx
                            .push_downstream(Frame::new(FramePayload::Transcription {
                                text,
                                is_final: true,
                            }))
                            .await;
                    }
                    SttEvent::Closed => {
                        if inner.closing.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.recover(&ctx, "closed by vendor").await;
                    }
                    SttEvent::Error(message) => {
                        inner.recover(&ctx, &message).await;
                    }
                }
            }
        });
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        if let Some(mut connection) = self.inner.connection.lock().await.take() {
            let _ = connection.close().await;
        }
        Ok(())
    }

    async fn handle_frame(
        &self,
        ctx: &ProcessorContext,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match &frame.payload {
            FramePayload::Audio(audio) if direction == FrameDirection::Downstream => {
                let failed = {
                    let mut connection = self.inner.connection.lock().await;
                    match connection.as_mut() {
                        Some(conn) => conn.send_audio(&audio.data).await.err(),
                        None => None,
                    }
                };
                if let Some(e) = failed {
                    // The chunk is lost; recovery decides whether the
                    // session survives.
                    self.inner.recover(ctx, &e.to_string()).await;
                }
                ctx.forward(frame, direction).await
            }
            FramePayload::End => {
                self.inner.closing.store(true, Ordering::SeqCst);
                if let Some(mut connection) = self.inner.connection.lock().await.take() {
                    let _ = connection.close().await;
                }
                ctx.forward(frame, direction).await
            }
            _ => ctx.forward(frame, direction).await,
        }
    }
}

fn take_receiver(
    slot: &std::sync::Mutex<Option<mpsc::Receiver<SttEvent>>>,
) -> Option<mpsc::Receiver<SttEvent>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}
