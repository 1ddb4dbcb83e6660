//! User-side context aggregation.
//!
//! Collects final transcripts into one user message, decides whether the
//! user is interrupting the bot, and triggers LLM generation. Interim
//! transcripts and microphone audio feed the interruption strategies but
//! never the aggregation.

use crate::config::UserAggregationConfig;
use crate::context::{ConversationContext, Message};
use crate::error::Result;
use crate::frames::{Frame, FrameDirection, FramePayload};
use crate::processor::{FrameHandler, ProcessorContext};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct UserAggState {
    aggregation: Vec<String>,
    bot_speaking: bool,
    user_speaking: bool,
    interim_pending: bool,
}

enum PushOutcome {
    Nothing,
    Discarded,
    Interrupt { text: String },
    Deliver { text: String },
}

struct UserAggInner {
    context: Arc<ConversationContext>,
    timeout: Duration,
    state: Mutex<UserAggState>,
    poke_tx: mpsc::UnboundedSender<()>,
}

impl UserAggInner {
    /// Flush the aggregation into the context, applying the interruption
    /// decision when the bot is speaking.
    async fn push_aggregation(&self, ctx: &ProcessorContext) -> Result<()> {
        let settings = ctx.interruption_settings();
        let outcome = {
            let mut state = lock(&self.state);
            if state.aggregation.is_empty() {
                PushOutcome::Nothing
            } else if state.bot_speaking && !settings.strategies.is_empty() {
                let fired = settings
                    .strategies
                    .iter()
                    .find(|strategy| strategy.should_interrupt());
                let outcome = match fired {
                    None => {
                        // The user mumbled over the bot without meeting any
                        // strategy; the input is dropped by design.
                        info!(
                            "discarding user aggregation: no interruption strategy fired"
                        );
                        state.aggregation.clear();
                        PushOutcome::Discarded
                    }
                    Some(strategy) if !settings.allow_interruptions => {
                        info!(
                            strategy = strategy.name(),
                            "strategy fired but interruptions are disabled"
                        );
                        state.aggregation.clear();
                        PushOutcome::Discarded
                    }
                    Some(strategy) => {
                        info!(strategy = strategy.name(), "user is interrupting the bot");
                        let text = state.aggregation.join(" ");
                        state.aggregation.clear();
                        PushOutcome::Interrupt { text }
                    }
                };
                for strategy in &settings.strategies {
                    strategy.reset();
                }
                outcome
            } else {
                // Evidence from completed turns must not count toward a
                // later barge-in.
                for strategy in &settings.strategies {
                    strategy.reset();
                }
                let text = state.aggregation.join(" ");
                state.aggregation.clear();
                PushOutcome::Deliver { text }
            }
        };

        match outcome {
            PushOutcome::Nothing | PushOutcome::Discarded => Ok(()),
            PushOutcome::Interrupt { text } => {
                ctx.request_interruption().await?;
                self.context.push_message(Message::user(text));
                // The Interruption broadcast carries the request's decision
                // time, so the generation this frame triggers survives it.
                ctx.push_downstream(Frame::new(FramePayload::LlmContext(Arc::clone(
                    &self.context,
                ))))
                .await
            }
            PushOutcome::Deliver { text } => {
                self.context.push_message(Message::user(text));
                ctx.push_downstream(Frame::new(FramePayload::LlmContext(Arc::clone(
                    &self.context,
                ))))
                .await
            }
        }
    }

    /// Idle-timer flush: only when the user has actually gone quiet.
    async fn timeout_flush(&self, ctx: &ProcessorContext) {
        let should_flush = {
            let state = lock(&self.state);
            !state.aggregation.is_empty() && !state.user_speaking
        };
        if should_flush {
            debug!("aggregation idle timeout fired");
            if let Err(e) = self.push_aggregation(ctx).await
                && !e.is_cancelled()
            {
                warn!("idle flush failed: {e}");
            }
        }
    }
}

/// Pipeline stage aggregating user transcripts into the shared context.
pub struct UserContextAggregator {
    inner: Arc<UserAggInner>,
    poke_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl UserContextAggregator {
    /// Create the stage over the shared context.
    pub fn new(context: Arc<ConversationContext>, config: &UserAggregationConfig) -> Self {
        let (poke_tx, poke_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(UserAggInner {
                context,
                timeout: Duration::from_millis(config.timeout_ms),
                state: Mutex::new(UserAggState::default()),
                poke_tx,
            }),
            poke_rx: Mutex::new(Some(poke_rx)),
        }
    }

    /// Strategies only collect evidence while the bot holds the turn.
    fn feed_strategy_text(&self, ctx: &ProcessorContext, text: &str) {
        if !lock(&self.inner.state).bot_speaking {
            return;
        }
        for strategy in &ctx.interruption_settings().strategies {
            strategy.append_text(text);
        }
    }
}

#[async_trait]
impl FrameHandler for UserContextAggregator {
    fn name(&self) -> &str {
        "user-aggregator"
    }

    async fn on_start(&self, ctx: &ProcessorContext) -> Result<()> {
        let Some(mut poke_rx) = lock(&self.poke_rx).take() else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let cancel = ctx.cancellation();
        tokio::spawn(async move {
            loop {
                // Wait until a final transcript arms the timer.
                tokio::select! {
                    () = cancel.cancelled() => return,
                    armed = poke_rx.recv() => {
                        if armed.is_none() {
                            return;
                        }
                    }
                }
                // Re-arm on every signal; flush once quiet long enough.
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        again = poke_rx.recv() => {
                            if again.is_none() {
                                return;
                            }
                        }
                        () = tokio::time::sleep(inner.timeout) => {
                            inner.timeout_flush(&ctx).await;
                            break;
                        }
                    }
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
        match &frame.payload {
            FramePayload::TtsStarted => {
                lock(&self.inner.state).bot_speaking = true;
                ctx.forward(frame, direction).await
            }
            FramePayload::TtsStopped => {
                lock(&self.inner.state).bot_speaking = false;
                ctx.forward(frame, direction).await
            }
            FramePayload::UserStartedSpeaking => {
                lock(&self.inner.state).user_speaking = true;
                ctx.forward(frame, direction).await
            }
            FramePayload::UserStoppedSpeaking => {
                lock(&self.inner.state).user_speaking = false;
                let _ = self.inner.poke_tx.send(());
                ctx.forward(frame, direction).await
            }
            FramePayload::Audio(audio) => {
                if lock(&self.inner.state).bot_speaking
                    && let Some(samples) = audio.linear16_samples()
                {
                    for strategy in &ctx.interruption_settings().strategies {
                        strategy.append_audio(&samples, audio.sample_rate);
                    }
                }
                ctx.forward(frame, direction).await
            }
            FramePayload::Transcription { text, is_final } => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Ok(());
                }
                self.feed_strategy_text(ctx, trimmed);
                if !is_final {
                    lock(&self.inner.state).interim_pending = true;
                    return Ok(());
                }
                let push_now = {
                    let mut state = lock(&self.inner.state);
                    state.aggregation.push(trimmed.to_owned());
                    state.interim_pending = false;
                    !state.user_speaking
                };
                let _ = self.inner.poke_tx.send(());
                if push_now {
                    self.inner.push_aggregation(ctx).await?;
                }
                // The raw transcription is consumed; LlmContext is the
                // downstream signal.
                Ok(())
            }
            FramePayload::MessagesAppend { messages, run_llm } => {
                self.inner.context.append_messages(messages.clone());
                if *run_llm {
                    ctx.push_downstream(Frame::new(FramePayload::LlmContext(Arc::clone(
                        &self.inner.context,
                    ))))
                    .await?;
                }
                Ok(())
            }
            FramePayload::MessagesUpdate { messages, run_llm } => {
                self.inner.context.set_messages(messages.clone());
                if *run_llm {
                    ctx.push_downstream(Frame::new(FramePayload::LlmContext(Arc::clone(
                        &self.inner.context,
                    ))))
                    .await?;
                }
                Ok(())
            }
            _ => ctx.forward(frame, direction).await,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
