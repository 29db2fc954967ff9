//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the live-lyric-follow session protocol itself
//! and changing them would change the meaning of the wire
//! format or the matcher's algorithm, not just its sensitivity. Tunable knobs
//! (rate limits, thresholds, cooldowns) live in [`crate::state::Config`]
//! instead.

// ─────────────────────────────────────────────────────────────────────────────
// Wire message types
// ─────────────────────────────────────────────────────────────────────────────

/// Client-originated frame `type` strings.
pub mod client_message_type {
    pub const START_SESSION: &str = "START_SESSION";
    pub const UPDATE_EVENT_SETTINGS: &str = "UPDATE_EVENT_SETTINGS";
    pub const AUDIO_DATA: &str = "AUDIO_DATA";
    pub const MANUAL_OVERRIDE: &str = "MANUAL_OVERRIDE";
    pub const STOP_SESSION: &str = "STOP_SESSION";
    pub const PING: &str = "PING";
}

/// Server-originated frame `type` strings.
pub mod server_message_type {
    pub const SESSION_STARTED: &str = "SESSION_STARTED";
    pub const EVENT_SETTINGS_UPDATED: &str = "EVENT_SETTINGS_UPDATED";
    pub const TRANSCRIPT_UPDATE: &str = "TRANSCRIPT_UPDATE";
    pub const DISPLAY_UPDATE: &str = "DISPLAY_UPDATE";
    pub const SONG_CHANGED: &str = "SONG_CHANGED";
    pub const SONG_SUGGESTION: &str = "SONG_SUGGESTION";
    pub const SESSION_ENDED: &str = "SESSION_ENDED";
    pub const ERROR: &str = "ERROR";
    pub const PONG: &str = "PONG";
}

// ─────────────────────────────────────────────────────────────────────────────
// Fuzzy matcher
// ─────────────────────────────────────────────────────────────────────────────

/// Recent-word window the matcher trims the cleaned buffer to before
/// comparison ("trimmed to the most recent N words (default 15)").
pub const MATCH_WORD_WINDOW: usize = 15;

/// Number of subsequent lines considered beyond the current line in
/// `find_best_match` ("default lookAhead = 3").
pub const LOOK_AHEAD_LINES: usize = 3;

/// Word count used for the end-of-buffer-vs-line comparison ("the last 6
/// words").
pub const END_OF_BUFFER_WORDS: usize = 6;

/// Multiplier applied to the end-of-buffer similarity for non-current lines
/// ("boosted 1.2x for non-current lines").
pub const NON_CURRENT_LINE_BOOST: f64 = 1.2;

/// Fraction of the configured similarity threshold used as the end-words
/// secondary trigger threshold ("0.5 of the configured threshold").
pub const END_TRIGGER_THRESHOLD_FRACTION: f64 = 0.5;

/// Fraction of combined text used for the end-of-slide bigram target and the
/// single-line end-trigger comparison ("last-40%-of-combined-text").
pub const END_TRIGGER_TAIL_FRACTION: f64 = 0.4;

/// Multiplier applied to an other-song candidate line when the buffer is not
/// a prefix of that line, normalised (scenario 4: "with the 0.5 penalty").
pub const INITIAL_WORD_PENALTY: f64 = 0.5;

/// Confidence floor attributed to a title-boosted other-song candidate
/// ("confidence >= 0.75 regardless of line text similarity").
pub const TITLE_MATCH_CONFIDENCE: f64 = 0.75;

/// Maximum rolling-buffer size for delta (non-cumulative) STT providers, in
/// words ("appended and trimmed to the last 100 words").
pub const DELTA_BUFFER_MAX_WORDS: usize = 100;

/// [SUPPLEMENT, open question (a), resolved in DESIGN.md] Margin by which an
/// other-song candidate's confidence must exceed the current-song confidence
/// before it is surfaced at all as a `suggestedSongSwitch` candidate.
pub const SONG_SWITCH_SUGGESTION_MARGIN: f64 = 0.05;

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Tick interval for the per-connection `tokio::select!` loop's heartbeat
/// branch, used for rate-limiter window bookkeeping. Not a stale-connection
/// timeout — spec.md places no such requirement on this transport; liveness
/// is purely the client-initiated PING/PONG exchange in spec §4.1.
pub const HEARTBEAT_TICK_SECS: u64 = 5;

