//! Energy-based voice activity detection with hysteresis.
//!
//! Each ~100 ms batch is classified by RMS energy against a fixed threshold.
//! [`VadGate`] wraps that per-batch check in a hysteresis state machine:
//!
//! ```text
//!            above-threshold ×N                 below-threshold run
//!  Idle ───────────────────────────▶ Active ──────────────────────▶ Idle
//!   │  (debounce: N consecutive)       │     (trailing hold: run must
//!   │                                  │      outlast the hold duration)
//!   └── below-threshold batches        └── batches keep emitting during
//!       are dropped (idle noise)           the hold (mid-utterance pause)
//! ```
//!
//! The gate is pure sample-in/decision-out state, so the real-time capture
//! path and the off-thread fallback drive the identical logic.

use crate::audio::pcm::BATCH_MS;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// RMS energy above which a batch counts as speech.
pub const RMS_SPEECH_THRESHOLD: f32 = 0.015;

/// Consecutive above-threshold batches required before onset fires.
pub const REQUIRED_SPEECH_CHUNKS: u32 = 3;

/// Silence that must persist before speech is declared ended (ms).
pub const SILENCE_HOLD_MS: u64 = 800;

// ---------------------------------------------------------------------------
// RMS
// ---------------------------------------------------------------------------

/// Root-mean-square energy of normalized samples. Zero for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_sq: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    mean_sq.sqrt()
}

// ---------------------------------------------------------------------------
// VadConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VadConfig {
    pub rms_threshold: f32,
    pub required_speech_chunks: u32,
    pub silence_hold_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            rms_threshold: RMS_SPEECH_THRESHOLD,
            required_speech_chunks: REQUIRED_SPEECH_CHUNKS,
            silence_hold_ms: SILENCE_HOLD_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// VadGate
// ---------------------------------------------------------------------------

/// State change produced by a batch, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    None,
    /// Entered active state; fires once per utterance.
    SpeechStart,
    /// Trailing hold expired; fires once per utterance.
    SilenceEnd,
}

/// Verdict for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDecision {
    /// Whether this batch should be emitted to the transport.
    pub emit: bool,
    pub transition: VadTransition,
}

/// Hysteresis gate; see the module docs for the state machine.
pub struct VadGate {
    config: VadConfig,
    /// Hold duration converted to whole batches (rounded up, at least one).
    hold_batches: u32,
    active: bool,
    consecutive_speech: u32,
    silence_run: u32,
}

impl VadGate {
    pub fn new(config: VadConfig) -> Self {
        let hold_batches = (config.silence_hold_ms.div_ceil(BATCH_MS)).max(1) as u32;
        Self {
            config,
            hold_batches,
            active: false,
            consecutive_speech: 0,
            silence_run: 0,
        }
    }

    /// Classify one batch and advance the state machine.
    pub fn push_batch(&mut self, samples: &[f32]) -> BatchDecision {
        let above = rms(samples) > self.config.rms_threshold;

        if !self.active {
            if !above {
                self.consecutive_speech = 0;
                // idle-channel noise: dropped entirely
                return BatchDecision {
                    emit: false,
                    transition: VadTransition::None,
                };
            }
            self.consecutive_speech += 1;
            if self.consecutive_speech < self.config.required_speech_chunks {
                return BatchDecision {
                    emit: false,
                    transition: VadTransition::None,
                };
            }
            self.active = true;
            self.silence_run = 0;
            log::debug!("vad: speech onset");
            return BatchDecision {
                emit: true,
                transition: VadTransition::SpeechStart,
            };
        }

        if above {
            self.silence_run = 0;
            return BatchDecision {
                emit: true,
                transition: VadTransition::None,
            };
        }

        self.silence_run += 1;
        if self.silence_run < self.hold_batches {
            // trailing hold: still emitting so short pauses are not clipped
            return BatchDecision {
                emit: true,
                transition: VadTransition::None,
            };
        }

        self.active = false;
        self.consecutive_speech = 0;
        self.silence_run = 0;
        log::debug!("vad: silence after hold");
        BatchDecision {
            emit: false,
            transition: VadTransition::SilenceEnd,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Back to idle without emitting a silence transition (capture torn
    /// down mid-utterance).
    pub fn reset(&mut self) {
        self.active = false;
        self.consecutive_speech = 0;
        self.silence_run = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(required: u32, hold_ms: u64) -> VadConfig {
        VadConfig {
            rms_threshold: 0.1,
            required_speech_chunks: required,
            silence_hold_ms: hold_ms,
        }
    }

    fn loud() -> Vec<f32> {
        vec![0.5; 160]
    }

    fn quiet() -> Vec<f32> {
        vec![0.01; 160]
    }

    // ---- RMS ---------------------------------------------------------------

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0.0; 100]), 0.0);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5; 100]) - 0.5).abs() < 1e-6);
        // sign does not matter
        assert!((rms(&[-0.5; 100]) - 0.5).abs() < 1e-6);
    }

    // ---- Onset debounce ----------------------------------------------------

    #[test]
    fn single_loud_batch_does_not_trigger_onset() {
        let mut gate = VadGate::new(config(3, 800));
        let d = gate.push_batch(&loud());
        assert!(!d.emit);
        assert_eq!(d.transition, VadTransition::None);
        assert!(!gate.is_active());
    }

    #[test]
    fn required_consecutive_batches_trigger_onset_once() {
        let mut gate = VadGate::new(config(3, 800));
        assert_eq!(gate.push_batch(&loud()).transition, VadTransition::None);
        assert_eq!(gate.push_batch(&loud()).transition, VadTransition::None);

        let d = gate.push_batch(&loud());
        assert_eq!(d.transition, VadTransition::SpeechStart);
        assert!(d.emit);
        assert!(gate.is_active());

        // further speech emits without re-firing onset
        let d = gate.push_batch(&loud());
        assert_eq!(d.transition, VadTransition::None);
        assert!(d.emit);
    }

    #[test]
    fn quiet_batch_resets_debounce_counter() {
        let mut gate = VadGate::new(config(3, 800));
        gate.push_batch(&loud());
        gate.push_batch(&loud());
        gate.push_batch(&quiet()); // run broken
        gate.push_batch(&loud());
        gate.push_batch(&loud());
        assert!(!gate.is_active());

        assert_eq!(
            gate.push_batch(&loud()).transition,
            VadTransition::SpeechStart
        );
    }

    #[test]
    fn idle_quiet_batches_are_dropped() {
        let mut gate = VadGate::new(config(2, 800));
        for _ in 0..10 {
            let d = gate.push_batch(&quiet());
            assert!(!d.emit);
            assert_eq!(d.transition, VadTransition::None);
        }
    }

    // ---- Trailing hold -----------------------------------------------------

    #[test]
    fn short_pause_keeps_emitting() {
        // 300 ms hold = 3 batches at 100 ms each
        let mut gate = VadGate::new(config(1, 300));
        gate.push_batch(&loud());

        // two quiet batches: still inside the hold, still emitting
        assert!(gate.push_batch(&quiet()).emit);
        assert!(gate.push_batch(&quiet()).emit);
        assert!(gate.is_active());

        // speech resumes, hold resets
        assert!(gate.push_batch(&loud()).emit);
        assert!(gate.push_batch(&quiet()).emit);
        assert!(gate.is_active());
    }

    #[test]
    fn silence_past_hold_fires_once_and_stops_emitting() {
        let mut gate = VadGate::new(config(1, 300));
        gate.push_batch(&loud());

        gate.push_batch(&quiet());
        gate.push_batch(&quiet());
        let d = gate.push_batch(&quiet()); // third quiet batch: hold expired
        assert_eq!(d.transition, VadTransition::SilenceEnd);
        assert!(!d.emit);
        assert!(!gate.is_active());

        // back to idle: quiet batches dropped, no repeated silence event
        let d = gate.push_batch(&quiet());
        assert_eq!(d.transition, VadTransition::None);
        assert!(!d.emit);
    }

    #[test]
    fn full_utterance_cycle_can_repeat() {
        let mut gate = VadGate::new(config(2, 100));

        for _ in 0..2 {
            gate.push_batch(&loud());
            assert_eq!(
                gate.push_batch(&loud()).transition,
                VadTransition::SpeechStart
            );
            assert_eq!(
                gate.push_batch(&quiet()).transition,
                VadTransition::SilenceEnd
            );
        }
    }

    #[test]
    fn hold_rounds_up_to_whole_batches() {
        // 250 ms rounds up to 3 batches
        let gate = VadGate::new(config(1, 250));
        assert_eq!(gate.hold_batches, 3);
        // zero hold still keeps one batch of grace
        let gate = VadGate::new(config(1, 0));
        assert_eq!(gate.hold_batches, 1);
    }

    #[test]
    fn reset_returns_to_idle_silently() {
        let mut gate = VadGate::new(config(1, 800));
        gate.push_batch(&loud());
        assert!(gate.is_active());

        gate.reset();
        assert!(!gate.is_active());
        assert!(!gate.push_batch(&quiet()).emit);
    }
}
