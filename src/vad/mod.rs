//! Voice activity detection.
//!
//! A pluggable per-chunk confidence model ([`VoiceAnalyzer`]) feeds a
//! 4-state hysteresis machine ([`VadEngine`]) that turns raw acoustic
//! samples into turn boundaries. The default analyzer is energy-based;
//! any model that scores a chunk in \[0, 1\] plugs in.

mod processor;

pub use processor::VadInputProcessor;

use crate::config::VadConfig;
use crate::error::{AgentError, Result};
use std::time::Duration;
use tracing::debug;

/// Chunk size in samples for 8 kHz input.
const CHUNK_SAMPLES_8K: usize = 256;
/// Chunk size in samples for 16 kHz input.
const CHUNK_SAMPLES_16K: usize = 512;
/// How much audio to run through a recurrent model before resetting its
/// hidden state.
const MODEL_RESET_INTERVAL: Duration = Duration::from_secs(5);

/// RMS energy of 16-bit samples, normalized to \[0, 1\].
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|s| {
            let v = f64::from(*s) / f64::from(i16::MAX);
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Perceptual loudness of 16-bit samples, normalized to \[0, 1\].
///
/// Maps the dBFS range \[-40, 0\] linearly onto \[0, 1\]; -40 dBFS and
/// quieter score zero. Raw RMS would compress all of normal speech into
/// the bottom fifth of the scale, making volume floors hard to tune.
pub fn normalized_volume(samples: &[i16]) -> f32 {
    let rms = rms_i16(samples);
    if rms <= 0.0 {
        return 0.0;
    }
    let dbfs = 20.0 * rms.log10();
    ((40.0 + dbfs) / 40.0).clamp(0.0, 1.0)
}

/// Zero-crossing rate: sign changes per sample, in \[0, 1\].
pub fn zero_crossing_rate(samples: &[i16]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
        .count();
    crossings as f32 / (samples.len() - 1) as f32
}

/// A per-chunk voice confidence model.
///
/// Implementations may keep internal recurrent state; [`reset`] clears it
/// and is called on a cadence and on sample-rate changes.
///
/// [`reset`]: VoiceAnalyzer::reset
pub trait VoiceAnalyzer: Send {
    /// Voice confidence for one chunk, in \[0, 1\].
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn confidence(&mut self, chunk: &[i16]) -> Result<f32>;

    /// Drop internal model state.
    fn reset(&mut self) {}

    /// Analyzer name for logging.
    fn name(&self) -> &'static str {
        "analyzer"
    }
}

/// Stateless energy-based analyzer.
///
/// Confidence is the chunk RMS scaled against a reference level: quiet
/// room noise scores near zero, normal speech saturates to one.
#[derive(Debug)]
pub struct EnergyAnalyzer {
    reference_rms: f32,
}

impl EnergyAnalyzer {
    /// Analyzer saturating at `reference_rms` (normalized RMS).
    pub fn new(reference_rms: f32) -> Self {
        Self {
            reference_rms: reference_rms.max(f32::EPSILON),
        }
    }
}

impl Default for EnergyAnalyzer {
    fn default() -> Self {
        // Normal speech at arm's length lands well above this; keyboard
        // noise and room tone land well below.
        Self::new(0.04)
    }
}

impl VoiceAnalyzer for EnergyAnalyzer {
    fn confidence(&mut self, chunk: &[i16]) -> Result<f32> {
        Ok((rms_i16(chunk) / self.reference_rms).clamp(0.0, 1.0))
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

/// Hysteresis machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No voice.
    Quiet,
    /// Voice seen, not yet long enough to count.
    Starting,
    /// The user is speaking.
    Speaking,
    /// Silence seen, not yet long enough to count.
    Stopping,
}

/// A confirmed turn boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    /// Sustained voice crossed the start threshold.
    SpeechStarted,
    /// Sustained silence crossed the stop threshold.
    SpeechStopped,
}

/// Per-chunk voice detection with start/stop hysteresis.
pub struct VadEngine {
    analyzer: Box<dyn VoiceAnalyzer>,
    params: VadConfig,
    sample_rate: u32,
    frames_per_chunk: usize,
    start_threshold: usize,
    stop_threshold: usize,
    state: VadState,
    start_frames: usize,
    stop_frames: usize,
    smoothed_volume: f32,
    samples_since_model_reset: usize,
}

impl std::fmt::Debug for VadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VadEngine")
            .field("params", &self.params)
            .field("sample_rate", &self.sample_rate)
            .field("frames_per_chunk", &self.frames_per_chunk)
            .field("start_threshold", &self.start_threshold)
            .field("stop_threshold", &self.stop_threshold)
            .field("state", &self.state)
            .field("start_frames", &self.start_frames)
            .field("stop_frames", &self.stop_frames)
            .field("smoothed_volume", &self.smoothed_volume)
            .field("samples_since_model_reset", &self.samples_since_model_reset)
            .finish()
    }
}

impl VadEngine {
    /// Create an engine for 16-bit LE PCM at 8 or 16 kHz.
    ///
    /// # Errors
    ///
    /// Returns a config error for any other sample rate.
    pub fn new(
        analyzer: Box<dyn VoiceAnalyzer>,
        params: &VadConfig,
        sample_rate: u32,
    ) -> Result<Self> {
        let frames_per_chunk = chunk_samples(sample_rate)?;
        let mut engine = Self {
            analyzer,
            params: params.clone(),
            sample_rate,
            frames_per_chunk,
            start_threshold: 0,
            stop_threshold: 0,
            state: VadState::Quiet,
            start_frames: 0,
            stop_frames: 0,
            smoothed_volume: 0.0,
            samples_since_model_reset: 0,
        };
        engine.recompute_thresholds();
        Ok(engine)
    }

    fn recompute_thresholds(&mut self) {
        let chunks_for = |secs: f32| -> usize {
            ((secs * self.sample_rate as f32) / self.frames_per_chunk as f32).ceil() as usize
        };
        self.start_threshold = chunks_for(self.params.start_secs).max(1);
        self.stop_threshold = chunks_for(self.params.stop_secs).max(1);
    }

    /// Required chunk size in samples.
    pub fn frames_per_chunk(&self) -> usize {
        self.frames_per_chunk
    }

    /// Required chunk size in bytes of 16-bit PCM.
    pub fn chunk_bytes(&self) -> usize {
        self.frames_per_chunk * 2
    }

    /// Configured sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current machine state.
    pub fn state(&self) -> VadState {
        self.state
    }

    /// Exponentially smoothed volume in \[0, 1\].
    pub fn smoothed_volume(&self) -> f32 {
        self.smoothed_volume
    }

    /// Switch to a new sample rate, dropping model state.
    ///
    /// # Errors
    ///
    /// Returns a config error for unsupported rates.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate == self.sample_rate {
            return Ok(());
        }
        self.frames_per_chunk = chunk_samples(sample_rate)?;
        self.sample_rate = sample_rate;
        self.recompute_thresholds();
        self.analyzer.reset();
        self.samples_since_model_reset = 0;
        debug!(sample_rate, "VAD sample rate changed, model state dropped");
        Ok(())
    }

    /// Restart detection: model state dropped, machine back to quiet.
    pub fn reset(&mut self) {
        self.analyzer.reset();
        self.state = VadState::Quiet;
        self.start_frames = 0;
        self.stop_frames = 0;
        self.smoothed_volume = 0.0;
        self.samples_since_model_reset = 0;
    }

    /// Run one chunk through the analyzer and the hysteresis machine.
    ///
    /// # Errors
    ///
    /// Returns a VAD error for wrong-size chunks or analyzer failures.
    pub fn process_chunk(&mut self, chunk: &[i16]) -> Result<Option<VadTransition>> {
        if chunk.len() != self.frames_per_chunk {
            return Err(AgentError::Vad(format!(
                "chunk must be {} samples at {} Hz, got {}",
                self.frames_per_chunk,
                self.sample_rate,
                chunk.len()
            )));
        }

        // Recurrent models accumulate hidden state; drop it periodically.
        self.samples_since_model_reset += chunk.len();
        let reset_after =
            (MODEL_RESET_INTERVAL.as_secs_f64() * f64::from(self.sample_rate)) as usize;
        if self.samples_since_model_reset >= reset_after {
            self.analyzer.reset();
            self.samples_since_model_reset = 0;
        }

        let mut confidence = self.analyzer.confidence(chunk)?;

        let raw_volume = normalized_volume(chunk);
        self.smoothed_volume = 0.2 * raw_volume + 0.8 * self.smoothed_volume;
        if self.smoothed_volume < self.params.min_volume {
            confidence = 0.0;
        }

        let voiced = confidence >= self.params.confidence;
        let transition = match self.state {
            VadState::Quiet => {
                if voiced {
                    self.state = VadState::Starting;
                    self.start_frames = 1;
                }
                None
            }
            VadState::Starting => {
                if voiced {
                    self.start_frames += 1;
                    if self.start_frames >= self.start_threshold {
                        self.state = VadState::Speaking;
                        self.start_frames = 0;
                        self.stop_frames = 0;
                        Some(VadTransition::SpeechStarted)
                    } else {
                        None
                    }
                } else {
                    self.state = VadState::Quiet;
                    self.start_frames = 0;
                    None
                }
            }
            VadState::Speaking => {
                if !voiced {
                    self.state = VadState::Stopping;
                    self.stop_frames = 1;
                }
                None
            }
            VadState::Stopping => {
                if voiced {
                    self.state = VadState::Speaking;
                    self.stop_frames = 0;
                    None
                } else {
                    self.stop_frames += 1;
                    if self.stop_frames >= self.stop_threshold {
                        self.state = VadState::Quiet;
                        self.start_frames = 0;
                        self.stop_frames = 0;
                        Some(VadTransition::SpeechStopped)
                    } else {
                        None
                    }
                }
            }
        };
        Ok(transition)
    }
}

fn chunk_samples(sample_rate: u32) -> Result<usize> {
    match sample_rate {
        8_000 => Ok(CHUNK_SAMPLES_8K),
        16_000 => Ok(CHUNK_SAMPLES_16K),
        other => Err(AgentError::Config(format!(
            "unsupported VAD sample rate {other} (expected 8000 or 16000)"
        ))),
    }
}
