//! Pluggable interruption predicates.
//!
//! A strategy accumulates evidence (transcribed words, microphone audio)
//! while the bot is speaking and answers one question: should the user
//! take the turn? Strategies compose OR-wise in the order configured;
//! the first to fire wins and is reset before its next evaluation.

use crate::config::StrategyConfig;
use crate::vad::{rms_i16, zero_crossing_rate};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Decides whether accumulated user activity warrants interrupting the bot.
///
/// Implementations serialize their own state; all methods take `&self` so
/// strategies can ride inside [`Start`](crate::frames::FramePayload::Start)
/// frames as shared trait objects.
pub trait InterruptStrategy: std::fmt::Debug + Send + Sync {
    /// Strategy name for logging.
    fn name(&self) -> &'static str;

    /// Feed transcribed text (interim or final).
    fn append_text(&self, _text: &str) {}

    /// Feed microphone audio as 16-bit samples.
    fn append_audio(&self, _samples: &[i16], _sample_rate: u32) {}

    /// Whether the accumulated evidence warrants an interruption.
    fn should_interrupt(&self) -> bool;

    /// Clear accumulated state.
    fn reset(&self);
}

/// Build live strategy objects from their declarative configuration.
pub fn build_strategies(configs: &[StrategyConfig]) -> Vec<Arc<dyn InterruptStrategy>> {
    configs
        .iter()
        .map(|config| match *config {
            StrategyConfig::MinWords { min_words } => {
                Arc::new(MinWordsStrategy::new(min_words)) as Arc<dyn InterruptStrategy>
            }
            StrategyConfig::Volume {
                threshold,
                window_size,
                min_frames,
            } => Arc::new(VolumeStrategy::new(threshold, window_size, min_frames)),
            StrategyConfig::Vad {
                min_duration_ms,
                energy_threshold,
                zcr_threshold,
            } => Arc::new(VadStrategy::new(
                Duration::from_millis(min_duration_ms),
                energy_threshold,
                zcr_threshold,
            )),
        })
        .collect()
}

/// Interrupts once the user has spoken a minimum number of words.
#[derive(Debug)]
pub struct MinWordsStrategy {
    min_words: usize,
    text: Mutex<String>,
}

impl MinWordsStrategy {
    /// Create a strategy firing at `min_words` whitespace-separated words.
    pub fn new(min_words: usize) -> Self {
        Self {
            min_words: min_words.max(1),
            text: Mutex::new(String::new()),
        }
    }
}

impl InterruptStrategy for MinWordsStrategy {
    fn name(&self) -> &'static str {
        "min_words"
    }

    fn append_text(&self, text: &str) {
        let mut buffer = lock(&self.text);
        if !buffer.is_empty() {
            buffer.push(' ');
        }
        buffer.push_str(text);
    }

    fn should_interrupt(&self) -> bool {
        let words = lock(&self.text).split_whitespace().count();
        let fire = words >= self.min_words;
        if fire {
            debug!(words, min_words = self.min_words, "min-words strategy firing");
        }
        fire
    }

    fn reset(&self) {
        lock(&self.text).clear();
    }
}

/// Interrupts when enough recent audio frames exceed a volume threshold.
#[derive(Debug)]
pub struct VolumeStrategy {
    threshold: f32,
    window_size: usize,
    min_frames: usize,
    window: Mutex<VecDeque<f32>>,
}

impl VolumeStrategy {
    /// Create a strategy over a ring of the last `window_size` RMS values.
    pub fn new(threshold: f32, window_size: usize, min_frames: usize) -> Self {
        Self {
            threshold,
            window_size: window_size.max(1),
            min_frames: min_frames.max(1),
            window: Mutex::new(VecDeque::new()),
        }
    }
}

impl InterruptStrategy for VolumeStrategy {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn append_audio(&self, samples: &[i16], _sample_rate: u32) {
        let rms = rms_i16(samples);
        let mut window = lock(&self.window);
        window.push_back(rms);
        while window.len() > self.window_size {
            let _ = window.pop_front();
        }
    }

    fn should_interrupt(&self) -> bool {
        let window = lock(&self.window);
        let loud = window.iter().filter(|rms| **rms > self.threshold).count();
        loud >= self.min_frames
    }

    fn reset(&self) {
        lock(&self.window).clear();
    }
}

/// Interrupts on sustained detected voice.
///
/// Voice means energy and zero-crossing rate both above their floors;
/// the run must stay continuous for the configured duration.
#[derive(Debug)]
pub struct VadStrategy {
    min_duration: Duration,
    energy_threshold: f32,
    zcr_threshold: f32,
    voiced: Mutex<Duration>,
}

impl VadStrategy {
    /// Create a strategy requiring `min_duration` of continuous voice.
    pub fn new(min_duration: Duration, energy_threshold: f32, zcr_threshold: f32) -> Self {
        Self {
            min_duration,
            energy_threshold,
            zcr_threshold,
            voiced: Mutex::new(Duration::ZERO),
        }
    }
}

impl InterruptStrategy for VadStrategy {
    fn name(&self) -> &'static str {
        "vad"
    }

    fn append_audio(&self, samples: &[i16], sample_rate: u32) {
        if samples.is_empty() || sample_rate == 0 {
            return;
        }
        let energy = rms_i16(samples);
        let zcr = zero_crossing_rate(samples);
        let chunk = Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64);
        let mut voiced = lock(&self.voiced);
        if energy >= self.energy_threshold && zcr >= self.zcr_threshold {
            *voiced += chunk;
        } else {
            *voiced = Duration::ZERO;
        }
    }

    fn should_interrupt(&self) -> bool {
        *lock(&self.voiced) >= self.min_duration
    }

    fn reset(&self) {
        *lock(&self.voiced) = Duration::ZERO;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn voice_chunk(amplitude: i16, len: usize) -> Vec<i16> {
        // Alternating-sign samples: loud AND high zero-crossing rate.
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    // ── min-words ───────────────────────────────────────────────────

    #[test]
    fn min_words_fires_at_threshold() {
        let strategy = MinWordsStrategy::new(3);
        strategy.append_text("wait hold");
        assert!(!strategy.should_interrupt());
        strategy.append_text("on");
        assert!(strategy.should_interrupt());
    }

    #[test]
    fn min_words_counts_across_appends() {
        let strategy = MinWordsStrategy::new(2);
        strategy.append_text("no");
        strategy.append_text("stop");
        assert!(strategy.should_interrupt());
    }

    #[test]
    fn min_words_reset_is_idempotent() {
        let strategy = MinWordsStrategy::new(1);
        strategy.append_text("hey");
        strategy.reset();
        strategy.reset();
        assert!(!strategy.should_interrupt());
    }

    // ── volume ──────────────────────────────────────────────────────

    #[test]
    fn volume_needs_min_frames_over_threshold() {
        let strategy = VolumeStrategy::new(0.2, 4, 2);
        strategy.append_audio(&voice_chunk(16_000, 160), 8_000);
        assert!(!strategy.should_interrupt());
        strategy.append_audio(&voice_chunk(16_000, 160), 8_000);
        assert!(strategy.should_interrupt());
    }

    #[test]
    fn volume_window_slides() {
        let strategy = VolumeStrategy::new(0.2, 2, 2);
        strategy.append_audio(&voice_chunk(16_000, 160), 8_000);
        strategy.append_audio(&voice_chunk(0, 160), 8_000);
        strategy.append_audio(&voice_chunk(0, 160), 8_000);
        // Loud frame fell out of the 2-slot window.
        assert!(!strategy.should_interrupt());
    }

    // ── vad ─────────────────────────────────────────────────────────

    #[test]
    fn vad_requires_continuous_voice() {
        let strategy = VadStrategy::new(Duration::from_millis(40), 0.1, 0.1);
        // 20 ms voiced chunks at 8 kHz.
        strategy.append_audio(&voice_chunk(16_000, 160), 8_000);
        assert!(!strategy.should_interrupt());
        strategy.append_audio(&voice_chunk(16_000, 160), 8_000);
        assert!(strategy.should_interrupt());
    }

    #[test]
    fn vad_silence_breaks_the_run() {
        let strategy = VadStrategy::new(Duration::from_millis(40), 0.1, 0.1);
        strategy.append_audio(&voice_chunk(16_000, 160), 8_000);
        strategy.append_audio(&voice_chunk(0, 160), 8_000);
        strategy.append_audio(&voice_chunk(16_000, 160), 8_000);
        assert!(!strategy.should_interrupt());
    }

    // ── building ────────────────────────────────────────────────────

    #[test]
    fn build_from_config_preserves_order() {
        let built = build_strategies(&[
            StrategyConfig::Volume {
                threshold: 0.5,
                window_size: 10,
                min_frames: 3,
            },
            StrategyConfig::MinWords { min_words: 3 },
        ]);
        assert_eq!(built.len(), 2);
        assert_eq!(built[0].name(), "volume");
        assert_eq!(built[1].name(), "min_words");
    }
}
