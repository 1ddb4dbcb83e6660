//! Text-to-speech service stage.
//!
//! The stage aggregates streamed LLM text into sentences, submits them to
//! a long-lived vendor connection under a per-generation context id, and
//! relays inbound audio downstream as `TtsAudio` frames. Audio whose
//! context id is neither current nor live in the [`AudioContextTable`] is
//! discarded — that is the only correct way to keep post-interruption
//! audio out of the call.

mod audio_context;

pub use audio_context::{AudioContext, AudioContextTable, WordTimestamp};

use crate::config::TtsConfig;
use crate::error::Result;
use crate::frames::{AudioData, Frame, FrameDirection, FramePayload};
use crate::processor::{FrameHandler, ProcessorContext};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 64;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);

/// Events pushed by a TTS connection.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// Synthesized audio for a context.
    Audio {
        /// Context the audio belongs to.
        context_id: String,
        /// The audio payload.
        audio: AudioData,
    },
    /// A word boundary for a context.
    WordBoundary {
        /// Context the word belongs to.
        context_id: String,
        /// The spoken word.
        word: String,
        /// Offset from the start of the synthesis.
        start_time: Duration,
    },
    /// The vendor finished flushing a context.
    Flushed {
        /// Context that completed.
        context_id: String,
    },
    /// The connection closed.
    Closed,
    /// The connection failed.
    Error(String),
}

/// A live streaming connection to a TTS vendor.
#[async_trait]
pub trait TtsConnection: Send {
    /// Submit text for synthesis under a context id. `continues` is false
    /// for the final message of a context.
    ///
    /// # Errors
    ///
    /// Returns a TTS error if the connection is broken.
    async fn synthesize(&mut self, context_id: &str, text: &str, continues: bool) -> Result<()>;

    /// Ask the vendor to finalize a context and emit its remaining audio.
    ///
    /// # Errors
    ///
    /// Returns a TTS error if the connection is broken.
    async fn flush(&mut self, context_id: &str) -> Result<()>;

    /// Cancel a context on the vendor side, discarding queued synthesis.
    /// Required after interruptions even if nothing played yet, so the
    /// remote side does not accumulate contexts.
    ///
    /// # Errors
    ///
    /// Returns a TTS error if the connection is broken.
    async fn cancel(&mut self, context_id: &str) -> Result<()>;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns a TTS error if the close handshake fails.
    async fn close(&mut self) -> Result<()>;
}

/// Factory for TTS connections.
#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Open a streaming connection; events flow through `events`.
    ///
    /// # Errors
    ///
    /// Returns a TTS error if the vendor is unreachable.
    async fn connect(
        &self,
        config: &TtsConfig,
        events: mpsc::Sender<TtsEvent>,
    ) -> Result<Box<dyn TtsConnection>>;
}

/// Slice complete sentences off the front of `buffer`.
///
/// A sentence ends at `.`, `!`, `?` or `;` followed by whitespace or the
/// end of the buffer; the unfinished remainder stays behind.
fn drain_complete_sentences(buffer: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = buffer.char_indices().collect();
    for (position, &(index, c)) in chars.iter().enumerate() {
        if !matches!(c, '.' | '!' | '?' | ';') {
            continue;
        }
        let boundary = match chars.get(position + 1) {
            None => true,
            Some(&(_, next)) => next.is_whitespace(),
        };
        if boundary {
            let end = index + c.len_utf8();
            let sentence = buffer[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
            start = end;
        }
    }
    if start > 0 {
        *buffer = buffer[start..].trim_start().to_owned();
    }
    sentences
}

#[derive(Default)]
struct TtsState {
    /// Current generation id; `None` between responses.
    context_id: Option<String>,
    sentence_buffer: String,
    /// Whether `TtsStarted` was emitted for the current utterance.
    started: bool,
    /// Inside an `LlmResponseStart`/`End` bracket.
    response_active: bool,
    /// Set when the first text of a context is submitted, cleared when
    /// its first audio arrives.
    ttfb_start: Option<Instant>,
}

struct TtsInner {
    client: Arc<dyn TtsClient>,
    config: TtsConfig,
    connection: Mutex<Option<Box<dyn TtsConnection>>>,
    contexts: AudioContextTable,
    state: std::sync::Mutex<TtsState>,
    events_tx: mpsc::Sender<TtsEvent>,
    closing: AtomicBool,
}

impl TtsInner {
    /// Submit one piece of text, creating the context and announcing the
    /// utterance on first use.
    async fn speak(&self, ctx: &ProcessorContext, text: &str) -> Result<()> {
        let (context_id, announce) = {
            let mut state = lock(&self.state);
            let context_id = match &state.context_id {
                Some(id) => id.clone(),
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    debug!(context_id = %id, "new synthesis context");
                    self.contexts.create(&id);
                    state.context_id = Some(id.clone());
                    state.ttfb_start = Some(Instant::now());
                    id
                }
            };
            let announce = !state.started;
            state.started = true;
            (context_id, announce)
        };

        if announce {
            // Upstream so the aggregators track bot speech, downstream so
            // the paced sink unblocks.
            ctx.push_upstream(Frame::new(FramePayload::TtsStarted)).await?;
            ctx.push_downstream(Frame::new(FramePayload::TtsStarted))
                .await?;
        }

        let mut connection = self.connection.lock().await;
        if let Some(conn) = connection.as_mut() {
            conn.synthesize(&context_id, text, true).await?;
        }
        Ok(())
    }

    /// Finalize the current context on the vendor side.
    async fn flush_current(&self) -> Result<()> {
        let context_id = lock(&self.state).context_id.clone();
        if let Some(id) = context_id {
            let mut connection = self.connection.lock().await;
            if let Some(conn) = connection.as_mut() {
                conn.flush(&id).await?;
            }
        }
        Ok(())
    }

    /// The interruption contract: clear local state, cancel the vendor
    /// context, drop it from the table, and retract the speaking flag.
    async fn handle_interruption(&self, ctx: &ProcessorContext) {
        let (old, was_started) = {
            let mut state = lock(&self.state);
            let old = state.context_id.take();
            state.sentence_buffer.clear();
            state.ttfb_start = None;
            let was_started = state.started;
            state.started = false;
            (old, was_started)
        };

        if let Some(old_id) = &old {
            let mut connection = self.connection.lock().await;
            if let Some(conn) = connection.as_mut()
                && let Err(e) = conn.cancel(old_id).await
            {
                warn!("failed to cancel vendor context: {e}");
            }
        }
        if let Some(old_id) = &old {
            self.contexts.remove(old_id);
            info!(context_id = %old_id, "synthesis interrupted");
        }
        if was_started {
            let _ = ctx
                .push_upstream(Frame::new(FramePayload::TtsStopped))
                .await;
        }
    }

    /// Reconnect once after a failure; a second failure is fatal.
    async fn recover(&self, ctx: &ProcessorContext, reason: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        warn!("TTS connection lost ({reason}), reconnecting once");
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
                info!("TTS reconnected");
                *connection = Some(fresh);
            }
            Err(e) => {
                let _ = ctx
                    .push_error(format!("TTS reconnect failed: {e}"), true)
                    .await;
            }
        }
    }
}

/// Pipeline stage driving a streaming TTS vendor.
pub struct TtsService {
    inner: Arc<TtsInner>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<TtsEvent>>>,
}

impl TtsService {
    /// Create the stage over a vendor client.
    pub fn new(client: Arc<dyn TtsClient>, config: TtsConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(TtsInner {
                client,
                config,
                connection: Mutex::new(None),
                contexts: AudioContextTable::new(),
                state: std::sync::Mutex::new(TtsState::default()),
                events_tx,
                closing: AtomicBool::new(false),
            }),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        }
    }
}

#[async_trait]
impl FrameHandler for TtsService {
    fn name(&self) -> &str {
        "tts"
    }

    async fn on_start(&self, ctx: &ProcessorContext) -> Result<()> {
        let connection = self
            .inner
            .client
            .connect(&self.inner.config, self.inner.events_tx.clone())
            .await?;
        *self.inner.connection.lock().await = Some(connection);
        info!(sample_rate = self.inner.config.sample_rate, "TTS connected");

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
                    TtsEvent::Audio { context_id, audio } => {
                        let current = lock(&inner.state).context_id.clone();
                        let live = current.as_deref() == Some(context_id.as_str())
                            || inner.contexts.contains(&context_id);
                        if !live {
                            debug!(context_id = %context_id, "discarding stale audio chunk");
                            continue;
                        }
                        if let Some(t0) = lock(&inner.state).ttfb_start.take() {
                            info!(
                                ttfb_ms = t0.elapsed().as_millis() as u64,
                                "first audio byte"
                            );
                        }
                        inner.contexts.record_chunk(&context_id, audio.data.len());
                        let _ = ctx
                            .push_downstream(Frame::new(FramePayload::TtsAudio(audio)))
                            .await;
                    }
                    TtsEvent::WordBoundary {
                        context_id,
                        word,
                        start_time,
                    } => {
                        inner.contexts.add_word(&context_id, &word, start_time);
                    }
                    TtsEvent::Flushed { context_id } => {
                        debug!(context_id = %context_id, "synthesis flushed");
                        let mut state = lock(&inner.state);
                        if state.context_id.as_deref() == Some(context_id.as_str()) {
                            state.context_id = None;
                        }
                        drop(state);
                        inner.contexts.remove(&context_id);
                    }
                    TtsEvent::Closed => {
                        if inner.closing.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.recover(&ctx, "closed by vendor").await;
                    }
                    TtsEvent::Error(message) => {
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
            FramePayload::LlmResponseStart if direction == FrameDirection::Downstream => {
                lock(&self.inner.state).response_active = true;
                ctx.forward(frame, direction).await
            }
            FramePayload::Text { text } if direction == FrameDirection::Downstream => {
                let (sentences, flush_now) = {
                    let mut state = lock(&self.inner.state);
                    state.sentence_buffer.push_str(text);
                    let sentences = drain_complete_sentences(&mut state.sentence_buffer);
                    // Bare text outside a response speaks immediately.
                    (sentences, !state.response_active)
                };
                for sentence in sentences {
                    self.inner.speak(ctx, &sentence).await?;
                }
                if flush_now {
                    let remainder = std::mem::take(&mut lock(&self.inner.state).sentence_buffer);
                    let remainder = remainder.trim().to_owned();
                    if !remainder.is_empty() {
                        self.inner.speak(ctx, &remainder).await?;
                    }
                    self.inner.flush_current().await?;
                }
                ctx.forward(frame, direction).await
            }
            FramePayload::LlmResponseEnd if direction == FrameDirection::Downstream => {
                let remainder = {
                    let mut state = lock(&self.inner.state);
                    state.response_active = false;
                    std::mem::take(&mut state.sentence_buffer)
                };
                let remainder = remainder.trim().to_owned();
                if !remainder.is_empty() {
                    self.inner.speak(ctx, &remainder).await?;
                }
                self.inner.flush_current().await?;
                ctx.forward(frame, direction).await
            }
            FramePayload::Interruption => {
                self.inner.handle_interruption(ctx).await;
                ctx.forward(frame, direction).await
            }
            FramePayload::TtsStopped if direction == FrameDirection::Upstream => {
                // The paced sink declared end of speech; the next response
                // re-announces the utterance.
                lock(&self.inner.state).started = false;
                ctx.forward(frame, direction).await
            }
            FramePayload::End => {
                self.inner.closing.store(true, Ordering::SeqCst);
                let _ = self.inner.flush_current().await;
                if let Some(mut connection) = self.inner.connection.lock().await.take() {
                    let _ = connection.close().await;
                }
                ctx.forward(frame, direction).await
            }
            _ => ctx.forward(frame, direction).await,
        }
    }
}

fn lock(state: &std::sync::Mutex<TtsState>) -> std::sync::MutexGuard<'_, TtsState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn take_receiver(
    slot: &std::sync::Mutex<Option<mpsc::Receiver<TtsEvent>>>,
) -> Option<mpsc::Receiver<TtsEvent>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}
