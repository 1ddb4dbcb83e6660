//! The VAD input stage.
//!
//! Accumulates incoming audio bytes, slices fixed-size chunks through the
//! [`VadEngine`], and emits turn-boundary frames. Every input `Audio`
//! frame is also forwarded downstream — STT needs the raw samples.

use super::{VadEngine, VadTransition, VoiceAnalyzer};
use crate::config::VadConfig;
use crate::error::Result;
use crate::frames::{AudioCodec, Frame, FrameDirection, FramePayload};
use crate::processor::{FrameHandler, ProcessorContext};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{debug, warn};

struct VadInputState {
    engine: VadEngine,
    buffer: Vec<u8>,
}

/// Pipeline stage running voice activity detection over inbound audio.
pub struct VadInputProcessor {
    state: Mutex<VadInputState>,
}

impl VadInputProcessor {
    /// Create the stage for the given analyzer and expected sample rate.
    ///
    /// # Errors
    ///
    /// Returns a config error for unsupported sample rates.
    pub fn new(
        analyzer: Box<dyn VoiceAnalyzer>,
        params: &VadConfig,
        sample_rate: u32,
    ) -> Result<Self> {
        let engine = VadEngine::new(analyzer, params, sample_rate)?;
        Ok(Self {
            state: Mutex::new(VadInputState {
                engine,
                buffer: Vec::new(),
            }),
        })
    }

    /// Feed audio bytes through the engine, collecting transitions.
    fn analyze(&self, data: &[u8], sample_rate: u32, codec: AudioCodec) -> Vec<VadTransition> {
        let mut transitions = Vec::new();
        let mut state = lock(&self.state);

        if codec != AudioCodec::Linear16 {
            debug!("VAD skipping non-linear16 audio");
            return transitions;
        }
        if sample_rate != state.engine.sample_rate() {
            if let Err(e) = state.engine.set_sample_rate(sample_rate) {
                warn!("dropping audio for VAD: {e}");
                return transitions;
            }
            state.buffer.clear();
        }

        state.buffer.extend_from_slice(data);
        let chunk_bytes = state.engine.chunk_bytes();
        while state.buffer.len() >= chunk_bytes {
            let chunk_data: Vec<u8> = state.buffer.drain(..chunk_bytes).collect();
            let samples: Vec<i16> = chunk_data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            match state.engine.process_chunk(&samples) {
                Ok(Some(transition)) => transitions.push(transition),
                Ok(None) => {}
                Err(e) => {
                    warn!("VAD chunk analysis failed: {e}");
                }
            }
        }
        transitions
    }
}

#[async_trait]
impl FrameHandler for VadInputProcessor {
    fn name(&self) -> &str {
        "vad-input"
    }

    async fn handle_frame(
        &self,
        ctx: &ProcessorContext,
        frame: Frame,
        direction: FrameDirection,
    ) -> Result<()> {
        match (&frame.payload, direction) {
            (FramePayload::Audio(audio), FrameDirection::Downstream) => {
                let transitions = self.analyze(&audio.data, audio.sample_rate, audio.codec);
                ctx.forward(frame, direction).await?;
                for transition in transitions {
                    let payload = match transition {
                        VadTransition::SpeechStarted => {
                            debug!("user started speaking");
                            FramePayload::UserStartedSpeaking
                        }
                        VadTransition::SpeechStopped => {
                            debug!("user stopped speaking");
                            FramePayload::UserStoppedSpeaking
                        }
                    };
                    ctx.push_downstream(Frame::new(payload)).await?;
                }
                Ok(())
            }
            (FramePayload::End, _) => {
                // Fresh detection for whatever comes after the drain.
                {
                    let mut state = lock(&self.state);
                    state.engine.reset();
                    state.buffer.clear();
                }
                ctx.forward(frame, direction).await
            }
            _ => ctx.forward(frame, direction).await,
        }
    }
}

fn lock(state: &Mutex<VadInputState>) -> std::sync::MutexGuard<'_, VadInputState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::frames::AudioData;
    use crate::processor::Processor;
    use crate::vad::VadState;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Confidence 0.9 for loud chunks, 0.0 for quiet ones.
    struct Threshold;

    impl VoiceAnalyzer for Threshold {
        fn confidence(&mut self, chunk: &[i16]) -> Result<f32> {
            Ok(if super::super::rms_i16(chunk) > 0.05 {
                0.9
            } else {
                0.0
            })
        }
    }

    struct Collector {
        tx: mpsc::UnboundedSender<&'static str>,
    }

    #[async_trait]
    impl FrameHandler for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        async fn handle_frame(
            &self,
            _ctx: &ProcessorContext,
            frame: Frame,
            _direction: FrameDirection,
        ) -> Result<()> {
            let _ = self.tx.send(frame.name());
            Ok(())
        }
    }

    fn params() -> VadConfig {
        VadConfig {
            confidence: 0.7,
            start_secs: 0.2,
            stop_secs: 0.8,
            min_volume: 0.0,
        }
    }

    fn pcm(amplitude: i16, samples: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            data.extend_from_slice(&amplitude.to_le_bytes());
        }
        data
    }

    #[tokio::test]
    async fn voice_burst_produces_one_start_and_one_stop() {
        let vad = Processor::new(
            VadInputProcessor::new(Box::new(Threshold), &params(), 16_000).unwrap(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Processor::new(Collector { tx });
        vad.link(&sink);
        let cancel = CancellationToken::new();
        vad.start(&cancel).await.unwrap();
        sink.start(&cancel).await.unwrap();

        // 1.0 s silence, 0.3 s voice, 1.0 s silence, in 512-sample frames.
        let silence_chunks = 16_000 / 512 * 1;
        let voice_chunks = (16_000.0 * 0.3 / 512.0) as usize;
        let mut feed = Vec::new();
        feed.extend(std::iter::repeat_n(pcm(0, 512), silence_chunks));
        feed.extend(std::iter::repeat_n(pcm(20_000, 512), voice_chunks));
        feed.extend(std::iter::repeat_n(pcm(0, 512), silence_chunks + 2));

        for data in feed {
            vad.queue_frame(
                Frame::new(FramePayload::Audio(AudioData::linear16(data, 16_000))),
                FrameDirection::Downstream,
            )
            .await
            .unwrap();
        }

        let mut starts = 0;
        let mut stops = 0;
        let mut audio = 0;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while stops == 0 {
            let Ok(Some(name)) =
                tokio::time::timeout_at(deadline, rx.recv()).await
            else {
                break;
            };
            match name {
                "UserStartedSpeaking" => starts += 1,
                "UserStoppedSpeaking" => stops += 1,
                "Audio" => audio += 1,
                _ => {}
            }
        }
        assert_eq!(starts, 1);
        assert_eq!(stops, 1);
        // All input audio was forwarded downstream for STT.
        assert!(audio > silence_chunks);

        sink.stop().await;
        vad.stop().await;
    }

    #[tokio::test]
    async fn buffer_slices_across_frame_boundaries() {
        // 512-sample chunks delivered as 300-sample frames still analyze.
        let processor =
            VadInputProcessor::new(Box::new(Threshold), &params(), 16_000).unwrap();
        for _ in 0..40 {
            processor.analyze(&pcm(20_000, 300), 16_000, AudioCodec::Linear16);
        }
        let state = lock(&processor.state);
        assert!(state.buffer.len() < state.engine.chunk_bytes());
        assert_ne!(state.engine.state(), VadState::Quiet);
    }

    #[tokio::test]
    async fn sample_rate_switch_resets_buffer() {
        let processor =
            VadInputProcessor::new(Box::new(Threshold), &params(), 16_000).unwrap();
        processor.analyze(&pcm(0, 100), 16_000, AudioCodec::Linear16);
        processor.analyze(&pcm(0, 100), 8_000, AudioCodec::Linear16);
        let state = lock(&processor.state);
        assert_eq!(state.engine.sample_rate(), 8_000);
        assert_eq!(state.engine.frames_per_chunk(), 256);
    }

    #[tokio::test]
    async fn unsupported_rate_drops_audio_but_keeps_engine() {
        let processor =
            VadInputProcessor::new(Box::new(Threshold), &params(), 16_000).unwrap();
        processor.analyze(&pcm(0, 100), 44_100, AudioCodec::Linear16);
        let state = lock(&processor.state);
        assert_eq!(state.engine.sample_rate(), 16_000);
    }
}
