//! Configuration types for a voice-agent session.

use crate::error::{AgentError, Result};
use crate::frames::AudioCodec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for one pipeline session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interruption (barge-in) behavior while the bot is speaking.
    pub interruption: InterruptionConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// User-side transcript aggregation settings.
    pub user_aggregation: UserAggregationConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Outbound transport pacing settings.
    pub transport: TransportConfig,
}

impl SessionConfig {
    /// Parse a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a config error if the TOML is malformed.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| AgentError::Config(format!("invalid TOML config: {e}")))
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Interruption (barge-in) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    /// Master gate: when false, strategies are still evaluated but their
    /// decisions are ignored and the bot keeps the turn.
    pub allow_interruptions: bool,
    /// Ordered strategy list, evaluated OR-wise (first to fire wins).
    pub strategies: Vec<StrategyConfig>,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            strategies: Vec::new(),
        }
    }
}

/// Declarative form of an interruption strategy, for TOML configs.
///
/// [`crate::interrupt::build_strategies`] turns a list of these into live
/// strategy objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Interrupt once the user has spoken at least `min_words` words.
    MinWords {
        /// Word count threshold.
        min_words: usize,
    },
    /// Interrupt when enough recent audio frames exceed a volume threshold.
    Volume {
        /// Normalized RMS threshold in \[0, 1\].
        threshold: f32,
        /// Number of most-recent RMS samples considered.
        window_size: usize,
        /// How many samples in the window must exceed the threshold.
        min_frames: usize,
    },
    /// Interrupt on sustained detected voice.
    Vad {
        /// Required continuous voice duration in ms.
        min_duration_ms: u64,
        /// Normalized RMS energy floor in \[0, 1\].
        energy_threshold: f32,
        /// Zero-crossing-rate floor (crossings per sample).
        zcr_threshold: f32,
    },
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Voice confidence threshold in \[0, 1\].
    ///
    /// Chunks whose analyzer confidence reaches this value count toward a
    /// speech start; chunks below it count toward a speech stop.
    pub confidence: f32,
    /// Seconds of continuous voice required to emit a speech start.
    pub start_secs: f32,
    /// Seconds of continuous silence required to emit a speech stop.
    pub stop_secs: f32,
    /// Smoothed-volume floor in \[0, 1\]. Below it, confidence is coerced
    /// to zero so distant chatter does not trip the detector.
    pub min_volume: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            confidence: 0.7,
            start_secs: 0.2,
            stop_secs: 0.8,
            min_volume: 0.6,
        }
    }
}

/// User-side transcript aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAggregationConfig {
    /// Idle period in ms after a final transcript before the aggregation
    /// is flushed into the conversation context.
    pub timeout_ms: u64,
}

impl Default for UserAggregationConfig {
    fn default() -> Self {
        Self { timeout_ms: 500 }
    }
}

/// Speech-to-text stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Sample rate of the audio handed to the vendor, in Hz.
    pub sample_rate: u32,
    /// Codec of the audio handed to the vendor.
    pub codec: AudioCodec,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            codec: AudioCodec::Linear16,
        }
    }
}

/// Language model stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Vendor model identifier.
    pub model: String,
    /// System prompt installed as the first context message.
    pub system_prompt: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: None,
            temperature: 0.7,
        }
    }
}

/// Text-to-speech stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Sample rate of the synthesized audio, in Hz.
    pub sample_rate: u32,
    /// Codec of the synthesized audio.
    pub codec: AudioCodec,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8_000,
            codec: AudioCodec::Mulaw,
        }
    }
}

/// Outbound transport pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Quiet period in ms on the outbound chunk queue, after the LLM
    /// response has ended, before the bot is considered done speaking.
    pub speech_quiet_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            speech_quiet_timeout_ms: 350,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SessionConfig::default();
        assert!(config.interruption.allow_interruptions);
        assert!(config.interruption.strategies.is_empty());
        assert_eq!(config.user_aggregation.timeout_ms, 500);
        assert_eq!(config.transport.speech_quiet_timeout_ms, 350);
        assert!((config.vad.confidence - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn toml_roundtrip() {
        let config = SessionConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = SessionConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.stt.sample_rate, config.stt.sample_rate);
        assert_eq!(parsed.tts.codec, config.tts.codec);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed = SessionConfig::from_toml_str(
            r#"
            [vad]
            confidence = 0.5

            [[interruption.strategies]]
            kind = "min_words"
            min_words = 3
            "#,
        )
        .unwrap();
        assert!((parsed.vad.confidence - 0.5).abs() < f32::EPSILON);
        assert!((parsed.vad.start_secs - 0.2).abs() < f32::EPSILON);
        assert_eq!(parsed.interruption.strategies.len(), 1);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = SessionConfig::from_toml_str("vad = 3").unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
