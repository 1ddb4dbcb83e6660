//! Lyrebird: real-time voice-agent pipeline runtime for telephony.
//!
//! A live audio session flows through a linear chain of stages as typed
//! frames:
//!
//! Transport → VAD → STT → user aggregation → LLM → assistant
//! aggregation → TTS → transport
//!
//! # Architecture
//!
//! The pipeline is built from independent [`Processor`]s connected by
//! per-stage dual-priority queues: ordered data on one queue, preemptive
//! system events on the other. A [`PipelineTask`] owns the session — it
//! injects the `Start` frame carrying the interruption policy, ingests
//! user-queued frames, and converts upstream interruption requests into
//! the downstream broadcast that flushes every stage mid-utterance.
//!
//! STT, LLM and TTS vendors stay behind client traits ([`stt::SttClient`],
//! [`llm::LlmClient`], [`tts::TtsClient`]); the telephony wire protocol
//! stays behind the [`transport`] serializer seams. The core never learns
//! either.
//!
//! [`Processor`]: processor::Processor
//! [`PipelineTask`]: task::PipelineTask

pub mod aggregators;
pub mod config;
pub mod context;
pub mod error;
pub mod frames;
pub mod interrupt;
pub mod llm;
pub mod pipeline;
pub mod processor;
pub mod stt;
pub mod task;
pub mod transport;
pub mod tts;
pub mod vad;

pub use config::SessionConfig;
pub use context::ConversationContext;
pub use error::{AgentError, Result};
pub use frames::{Frame, FrameDirection, FramePayload};
pub use processor::{FrameHandler, Processor, ProcessorContext};
pub use task::{PipelineTask, SessionEvent, TaskHandle, TaskParams};
