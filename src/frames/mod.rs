//! Frame types that flow through the pipeline.
//!
//! Every message between stages is a [`Frame`]: a small header (id,
//! timestamps, open metadata) around a typed [`FramePayload`]. Frames fall
//! into three categories with different queueing behavior:
//!
//! - [`FrameCategory::System`] frames preempt pending data (separate queue)
//!   and carry lifecycle and interruption events.
//! - [`FrameCategory::Data`] frames are strictly ordered: audio,
//!   transcriptions, streamed text.
//! - [`FrameCategory::Control`] frames are ordered with data: response
//!   brackets, context triggers, tool-call lifecycle.

use crate::context::{ConversationContext, Message};
use crate::interrupt::InterruptStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static FRAME_ID: AtomicU64 = AtomicU64::new(1);

fn next_frame_id() -> u64 {
    FRAME_ID.fetch_add(1, Ordering::Relaxed)
}

/// Queueing category of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCategory {
    /// Preemptive lifecycle/interruption events.
    System,
    /// Ordered payload data.
    Data,
    /// Ordered coordination events.
    Control,
}

/// Direction a frame travels through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// Source → sink (the data path).
    Downstream,
    /// Sink → source (signals back toward the task).
    Upstream,
}

/// Audio codec identifiers used in frame metadata and configs.
///
/// The coding tables themselves live behind the transport seam; the core
/// only needs to know chunk arithmetic per codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// 16-bit little-endian linear PCM.
    Linear16,
    /// G.711 µ-law, 8-bit.
    Mulaw,
    /// G.711 A-law, 8-bit.
    Alaw,
}

impl AudioCodec {
    /// Bytes per sample for this codec.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Linear16 => 2,
            Self::Mulaw | Self::Alaw => 1,
        }
    }
}

/// A chunk of audio flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct AudioData {
    /// Raw encoded bytes.
    pub data: Vec<u8>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1 = mono).
    pub channels: u16,
    /// Codec of `data`.
    pub codec: AudioCodec,
}

impl AudioData {
    /// Mono 16-bit linear PCM audio.
    pub fn linear16(data: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            data,
            sample_rate,
            channels: 1,
            codec: AudioCodec::Linear16,
        }
    }

    /// Decode the byte buffer as i16 little-endian samples.
    ///
    /// Returns `None` unless the codec is [`AudioCodec::Linear16`]; other
    /// codecs are decoded at the transport seam.
    pub fn linear16_samples(&self) -> Option<Vec<i16>> {
        if self.codec != AudioCodec::Linear16 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect(),
        )
    }

    /// Duration of this chunk at its sample rate.
    pub fn duration(&self) -> Duration {
        let samples = self.data.len() / self.codec.bytes_per_sample().max(1);
        let per_channel = samples / self.channels.max(1) as usize;
        Duration::from_secs_f64(per_channel as f64 / self.sample_rate.max(1) as f64)
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone)]
pub struct FunctionCallRequest {
    /// Unique identifier for this call.
    pub call_id: String,
    /// Function name.
    pub function_name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
}

/// The typed payload of a frame.
#[derive(Debug, Clone)]
pub enum FramePayload {
    // ── System ──────────────────────────────────────────────────────
    /// Session init; first frame down the pipeline. Carries the
    /// interruption policy every stage stores.
    Start {
        /// Master interruption gate.
        allow_interruptions: bool,
        /// Ordered strategy list, evaluated OR-wise.
        strategies: Vec<Arc<dyn InterruptStrategy>>,
    },
    /// Graceful drain and shutdown.
    End,
    /// Immediate shutdown, skipping drains.
    Cancel,
    /// Downstream broadcast: the user has taken the turn, flush.
    Interruption,
    /// VAD turn boundary: voice detected.
    UserStartedSpeaking,
    /// VAD turn boundary: silence detected.
    UserStoppedSpeaking,
    /// Fault propagation toward the task.
    Error {
        /// Human-readable description.
        message: String,
        /// Whether the session must end because of this fault.
        fatal: bool,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// Microphone audio from the inbound transport.
    Audio(AudioData),
    /// Synthesized speech headed for the outbound transport.
    TtsAudio(AudioData),
    /// STT output.
    Transcription {
        /// Transcribed text (may be empty).
        text: String,
        /// Whether the vendor marked this segment final.
        is_final: bool,
    },
    /// A generic text unit (LLM token stream, injected text).
    Text {
        /// The text.
        text: String,
    },

    // ── Control ─────────────────────────────────────────────────────
    /// Sent upstream by any stage that decided to interrupt; the task
    /// converts it to a downstream [`FramePayload::Interruption`].
    InterruptionTask,
    /// Triggers LLM generation against the shared conversation context.
    LlmContext(Arc<ConversationContext>),
    /// Opens one logical LLM response (may nest across tool-call loops).
    LlmResponseStart,
    /// Closes one logical LLM response.
    LlmResponseEnd,
    /// The bot started speaking.
    TtsStarted,
    /// The bot finished (or was cut off) speaking.
    TtsStopped,
    /// Externally append messages to the conversation context.
    MessagesAppend {
        /// Messages to append.
        messages: Vec<Message>,
        /// Whether to trigger a new LLM run afterwards.
        run_llm: bool,
    },
    /// Externally replace the conversation context messages.
    MessagesUpdate {
        /// Replacement message list.
        messages: Vec<Message>,
        /// Whether to trigger a new LLM run afterwards.
        run_llm: bool,
    },
    /// The LLM requested one or more tool calls.
    FunctionCallsStarted(Vec<FunctionCallRequest>),
    /// A tool call is executing.
    FunctionCallInProgress {
        /// Identifier of the running call.
        call_id: String,
        /// Function name.
        function_name: String,
        /// Parsed JSON arguments.
        arguments: serde_json::Value,
        /// Whether an interruption should cancel the call.
        cancel_on_interruption: bool,
    },
    /// A tool call finished.
    FunctionCallResult {
        /// Identifier of the finished call.
        call_id: String,
        /// Function name.
        function_name: String,
        /// The tool's output.
        result: serde_json::Value,
        /// Explicit re-run directive; `None` means re-run once no calls
        /// remain in flight.
        run_llm: Option<bool>,
    },
    /// A tool call was cancelled before completion.
    FunctionCallCancel {
        /// Identifier of the cancelled call.
        call_id: String,
    },
}

impl FramePayload {
    /// Human-readable frame name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "Start",
            Self::End => "End",
            Self::Cancel => "Cancel",
            Self::Interruption => "Interruption",
            Self::UserStartedSpeaking => "UserStartedSpeaking",
            Self::UserStoppedSpeaking => "UserStoppedSpeaking",
            Self::Error { .. } => "Error",
            Self::Audio(_) => "Audio",
            Self::TtsAudio(_) => "TtsAudio",
            Self::Transcription { .. } => "Transcription",
            Self::Text { .. } => "Text",
            Self::InterruptionTask => "InterruptionTask",
            Self::LlmContext(_) => "LlmContext",
            Self::LlmResponseStart => "LlmResponseStart",
            Self::LlmResponseEnd => "LlmResponseEnd",
            Self::TtsStarted => "TtsStarted",
            Self::TtsStopped => "TtsStopped",
            Self::MessagesAppend { .. } => "MessagesAppend",
            Self::MessagesUpdate { .. } => "MessagesUpdate",
            Self::FunctionCallsStarted(_) => "FunctionCallsStarted",
            Self::FunctionCallInProgress { .. } => "FunctionCallInProgress",
            Self::FunctionCallResult { .. } => "FunctionCallResult",
            Self::FunctionCallCancel { .. } => "FunctionCallCancel",
        }
    }

    /// Queueing category of this payload.
    pub fn category(&self) -> FrameCategory {
        match self {
            Self::Start { .. }
            | Self::End
            | Self::Cancel
            | Self::Interruption
            | Self::UserStartedSpeaking
            | Self::UserStoppedSpeaking
            | Self::Error { .. } => FrameCategory::System,
            Self::Audio(_) | Self::TtsAudio(_) | Self::Transcription { .. } | Self::Text { .. } => {
                FrameCategory::Data
            }
            Self::InterruptionTask
            | Self::LlmContext(_)
            | Self::LlmResponseStart
            | Self::LlmResponseEnd
            | Self::TtsStarted
            | Self::TtsStopped
            | Self::MessagesAppend { .. }
            | Self::MessagesUpdate { .. }
            | Self::FunctionCallsStarted(_)
            | Self::FunctionCallInProgress { .. }
            | Self::FunctionCallResult { .. }
            | Self::FunctionCallCancel { .. } => FrameCategory::Control,
        }
    }
}

/// A typed, timestamped message flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing id (process-global).
    pub id: u64,
    /// When the frame was created.
    pub created_at: Instant,
    /// Presentation timestamp relative to session start, when known.
    pub pts: Option<Duration>,
    /// Open metadata attached by stages.
    pub metadata: HashMap<String, serde_json::Value>,
    /// The typed payload.
    pub payload: FramePayload,
}

impl Frame {
    /// Create a frame around a payload, assigning the next id.
    pub fn new(payload: FramePayload) -> Self {
        Self {
            id: next_frame_id(),
            created_at: Instant::now(),
            pts: None,
            metadata: HashMap::new(),
            payload,
        }
    }

    /// Attach a presentation timestamp.
    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Human-readable frame name.
    pub fn name(&self) -> &'static str {
        self.payload.name()
    }

    /// Queueing category.
    pub fn category(&self) -> FrameCategory {
        self.payload.category()
    }

    /// Whether this is a system-class frame.
    pub fn is_system(&self) -> bool {
        self.category() == FrameCategory::System
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name(), self.id)
    }
}
