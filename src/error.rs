//! Error types for the lyrebird pipeline.

/// Top-level error type for the voice-agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Transport send/receive error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech-to-text error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Pipeline wiring or dispatch error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Frame queue send/receive error.
    #[error("queue error: {0}")]
    Queue(String),

    /// The session context was cancelled while an operation was blocked.
    #[error("cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether this error is the benign result of session cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
