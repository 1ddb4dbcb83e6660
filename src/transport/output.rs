//! The paced audio sink.
//!
//! Synthesized audio is rechunked to the codec's wire size and metered
//! out at real time by one long-lived sender loop. The stage also owns
//! two pieces of turn-taking truth: the post-interruption blocked state
//! (pre-interruption audio already in flight must not play) and quiet-
//! timer end-of-speech detection.

use super::{AudioTransport, WireSerializer};
use crate::config::TransportConfig;
use crate::error::Result;
use crate::frames::{AudioCodec, AudioData, Frame, FrameDirection, FramePayload};
use crate::processor::{BoundedQueue, FrameHandler, ProcessorContext};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const CHUNK_QUEUE_CAPACITY: usize = 1000;
/// Pacing never sleeps less than this.
const MIN_PACING_INTERVAL: Duration = Duration::from_millis(1);
/// Wire chunk size for 8 kHz telephony codecs.
const TELEPHONY_CHUNK_BYTES: usize = 160;
/// Wire chunk size for wideband linear PCM.
const WIDEBAND_CHUNK_BYTES: usize = 320;

fn chunk_bytes(codec: AudioCodec) -> usize {
    match codec {
        AudioCodec::Mulaw | AudioCodec::Alaw => TELEPHONY_CHUNK_BYTES,
        AudioCodec::Linear16 => WIDEBAND_CHUNK_BYTES,
    }
}

fn pacing_interval(audio: &AudioData) -> Duration {
    let bytes_per_second =
        audio.sample_rate.max(1) as usize * audio.codec.bytes_per_sample().max(1);
    let interval = Duration::from_secs_f64(audio.data.len() as f64 / bytes_per_second as f64);
    interval.max(MIN_PACING_INTERVAL)
}

#[derive(Default)]
struct OutputState {
    /// Set by `Interruption`, cleared by the next `TtsStarted`. While set,
    /// every incoming `TtsAudio` is discarded.
    interrupted: bool,
    /// Partial-chunk accumulation buffer.
    buffer: Vec<u8>,
    /// The bot has an announced utterance in progress.
    speaking: bool,
    /// The LLM response bracket has closed.
    response_ended: bool,
}

struct OutputInner {
    transport: Arc<dyn AudioTransport>,
    serializer: Arc<dyn WireSerializer>,
    quiet_timeout: Duration,
    chunks: BoundedQueue<AudioData>,
    state: Mutex<OutputState>,
}

/// Pipeline stage sending synthesized audio to the provider at real time.
pub struct TransportOutput {
    inner: Arc<OutputInner>,
}

impl TransportOutput {
    /// Create the stage over an outbound connection and serializer.
    pub fn new(
        transport: Arc<dyn AudioTransport>,
        serializer: Arc<dyn WireSerializer>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OutputInner {
                transport,
                serializer,
                quiet_timeout: Duration::from_millis(config.speech_quiet_timeout_ms),
                chunks: BoundedQueue::new(CHUNK_QUEUE_CAPACITY),
                state: Mutex::new(OutputState::default()),
            }),
        }
    }
}

#[async_trait]
impl FrameHandler for TransportOutput {
    fn name(&self) -> &str {
        "transport-out"
    }

    async fn on_start(&self, ctx: &ProcessorContext) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let cancel = ctx.cancellation();
        tokio::spawn(async move {
            run_sender(inner, ctx, cancel).await;
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
            FramePayload::TtsAudio(audio) if direction == FrameDirection::Downstream => {
                let ready = {
                    let mut state = lock(&self.inner.state);
                    if state.interrupted {
                        debug!("discarding synthesized audio while interrupted");
                        return Ok(());
                    }
                    state.buffer.extend_from_slice(&audio.data);
                    let size = chunk_bytes(audio.codec);
                    let mut ready = Vec::new();
                    while state.buffer.len() >= size {
                        let data: Vec<u8> = state.buffer.drain(..size).collect();
                        ready.push(AudioData {
                            data,
                            sample_rate: audio.sample_rate,
                            channels: audio.channels,
                            codec: audio.codec,
                        });
                    }
                    ready
                };
                for chunk in ready {
                    self.inner.chunks.push(chunk, &ctx.cancellation()).await?;
                }
                // Synthesized audio terminates here; only events continue
                // to the sink.
                Ok(())
            }
            FramePayload::Audio(_) if direction == FrameDirection::Downstream => {
                // Microphone audio flowed through only so VAD and the
                // strategies could see it.
                Ok(())
            }
            FramePayload::TtsStarted if direction == FrameDirection::Downstream => {
                {
                    let mut state = lock(&self.inner.state);
                    state.interrupted = false;
                    state.speaking = true;
                }
                ctx.forward(frame, direction).await
            }
            FramePayload::LlmResponseStart if direction == FrameDirection::Downstream => {
                lock(&self.inner.state).response_ended = false;
                ctx.forward(frame, direction).await
            }
            FramePayload::LlmResponseEnd if direction == FrameDirection::Downstream => {
                lock(&self.inner.state).response_ended = true;
                ctx.forward(frame, direction).await
            }
            FramePayload::Interruption => {
                let drained = {
                    let mut state = lock(&self.inner.state);
                    state.interrupted = true;
                    state.buffer.clear();
                    self.inner.chunks.drain()
                };
                if drained > 0 {
                    debug!(drained, "dropped queued outbound chunks");
                }
                for message in self.inner.serializer.serialize_interruption() {
                    if let Err(e) = self.inner.transport.send(message).await {
                        warn!("failed to send interruption command: {e}");
                    }
                }
                ctx.forward(frame, direction).await
            }
            _ => ctx.forward(frame, direction).await,
        }
    }
}

async fn run_sender(
    inner: Arc<OutputInner>,
    ctx: ProcessorContext,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        match inner.chunks.pop_timeout(inner.quiet_timeout, &cancel).await {
            Err(_) => break,
            Ok(Some(chunk)) => {
                let interval = pacing_interval(&chunk);
                match inner.serializer.serialize_audio(&chunk) {
                    Ok(messages) => {
                        for message in messages {
                            if let Err(e) = inner.transport.send(message).await {
                                warn!("outbound audio send failed: {e}");
                            }
                        }
                    }
                    Err(e) => warn!("failed to serialize audio chunk: {e}"),
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            Ok(None) => {
                // Queue has been quiet for the threshold. Only call the
                // turn over once the LLM finished producing; otherwise the
                // timer re-arms on the next pop.
                let finished = {
                    let mut state = lock(&inner.state);
                    if state.speaking && state.response_ended {
                        state.speaking = false;
                        true
                    } else {
                        false
                    }
                };
                if finished {
                    info!("bot finished speaking");
                    let _ = ctx
                        .push_upstream(Frame::new(FramePayload::TtsStopped))
                        .await;
                }
            }
        }
    }
}

fn lock(state: &Mutex<OutputState>) -> std::sync::MutexGuard<'_, OutputState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
