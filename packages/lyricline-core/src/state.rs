//! Core application configuration.
//!
//! Tunable runtime knobs grouped into a single `Config` with `Default`,
//! split from `protocol_constants.rs` (fixed, never overridden) — `Config`
//! holds the values that are env/CLI-overridable (see
//! `apps/lyricline-server::config`).

use serde::{Deserialize, Serialize};

/// Runtime-tunable configuration for the session server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sliding window length for the control-message rate limiter, in
    /// milliseconds.
    pub control_rate_window_ms: u64,
    /// Control-message budget per window.
    pub control_rate_limit: usize,

    /// Sliding window length for the audio-frame rate limiter, in
    /// milliseconds.
    pub audio_rate_window_ms: u64,
    /// Audio-frame budget per window.
    pub audio_rate_limit: usize,

    /// Accept floor for line matches.
    pub matcher_similarity_threshold: f64,
    /// Minimum cleaned-buffer word count before the matcher runs.
    pub matcher_min_buffer_words: usize,
    /// Recent-word window retained in the rolling buffer for matching.
    pub matcher_buffer_window: usize,
    /// Enable matching attempts on non-final ("partial") transcripts.
    pub allow_partial_matching: bool,
    /// Enable the end-of-slide bigram repeating-phrase safeguard.
    pub use_bigram_end_of_slide: bool,

    /// STT watchdog: no-transcript duration (ms) that triggers a restart.
    pub stt_stale_ms: u64,
    /// STT watchdog: minimum spacing between restarts (ms).
    pub stt_restart_cooldown_ms: u64,

    /// Consecutive same-target sightings required before an automatic song
    /// switch is debounced through.
    pub song_switch_debounce_matches: usize,
    /// Quiet period after a switch during which new switches are suppressed
    /// (ms).
    pub song_switch_cooldown_ms: u64,
    /// Confidence floor at which a debounced candidate is auto-switched
    /// rather than only suggested.
    pub song_switch_auto_floor: f64,

    /// Consecutive end-words hits required to confirm an end-trigger
    /// advance.
    pub end_trigger_debounce_matches: usize,
    /// Window (ms) within which those hits must occur.
    pub end_trigger_debounce_window_ms: u64,

    /// When the configured setlist loader is unavailable, fall back to an
    /// in-memory mock loader instead of failing every `START_SESSION`.
    pub fallback_to_mock_setlist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_rate_window_ms: 10_000,
            control_rate_limit: 30,
            audio_rate_window_ms: 10_000,
            audio_rate_limit: 120,

            matcher_similarity_threshold: 0.85,
            matcher_min_buffer_words: 2,
            matcher_buffer_window: 15,
            allow_partial_matching: true,
            use_bigram_end_of_slide: true,

            stt_stale_ms: 10_000,
            stt_restart_cooldown_ms: 15_000,

            song_switch_debounce_matches: 2,
            song_switch_cooldown_ms: 3_000,
            song_switch_auto_floor: 0.50,

            end_trigger_debounce_matches: 2,
            end_trigger_debounce_window_ms: 1_800,

            fallback_to_mock_setlist: false,
        }
    }
}

impl Config {
    /// Clamp all values to valid ranges. Called once at load time so a
    /// malformed YAML/env override can't produce a nonsensical runtime (e.g.
    /// a zero-length rate window).
    pub fn validate(&mut self) {
        self.control_rate_window_ms = self.control_rate_window_ms.max(1);
        self.audio_rate_window_ms = self.audio_rate_window_ms.max(1);
        self.matcher_similarity_threshold = self.matcher_similarity_threshold.clamp(0.0, 1.0);
        self.matcher_min_buffer_words = self.matcher_min_buffer_words.max(1);
        self.matcher_buffer_window = self.matcher_buffer_window.max(1);
        self.song_switch_auto_floor = self.song_switch_auto_floor.clamp(0.0, 1.0);
        self.song_switch_debounce_matches = self.song_switch_debounce_matches.max(1);
        self.end_trigger_debounce_matches = self.end_trigger_debounce_matches.max(1);
    }
}
