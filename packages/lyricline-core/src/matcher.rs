//! Fuzzy matcher.
//!
//! Stateless pure functions: given a cleaned transcript buffer and a
//! [`SongContext`], decide which line the operator is on and whether to
//! advance. `find_best_match_across_all_songs` additionally ranks every other
//! song in the setlist as a candidate switch target. Nothing here touches the
//! session registry or the network — it is tested purely by value.

use serde::Serialize;

use crate::protocol_constants::{
    END_OF_BUFFER_WORDS, END_TRIGGER_TAIL_FRACTION, END_TRIGGER_THRESHOLD_FRACTION,
    INITIAL_WORD_PENALTY, LOOK_AHEAD_LINES, MATCH_WORD_WINDOW, NON_CURRENT_LINE_BOOST,
    SONG_SWITCH_SUGGESTION_MARGIN, TITLE_MATCH_CONFIDENCE,
};
use crate::slides::Song;

/// Word-level filler tokens stripped from the buffer before matching (spec
/// §4.4).
const FILLER_WORDS: &[&str] = &["um", "uh", "oh", "ah", "hmm", "erm", "mm", "uhh", "umm"];

/// Thresholds and windows governing the matcher (spec §3, entity
/// "MatcherConfig"). All values are clamped to valid ranges on construction.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub similarity_threshold: f64,
    pub min_buffer_words: usize,
    pub buffer_window: usize,
    pub use_bigram_end_of_slide: bool,
    pub debug: bool,
}

impl MatcherConfig {
    pub fn new(
        similarity_threshold: f64,
        min_buffer_words: usize,
        buffer_window: usize,
        use_bigram_end_of_slide: bool,
        debug: bool,
    ) -> Self {
        Self {
            similarity_threshold: similarity_threshold.clamp(0.0, 1.0),
            min_buffer_words: min_buffer_words.max(1),
            buffer_window: buffer_window.max(1),
            use_bigram_end_of_slide,
            debug,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self::new(0.85, 2, MATCH_WORD_WINDOW, true, false)
    }
}

/// Per-session-per-song-in-focus matching context (spec §3, entity
/// "SongContext"). Invariant: `0 <= current_line_index < lines.len()`.
#[derive(Debug, Clone)]
pub struct SongContext {
    pub song_id: String,
    pub song_title: String,
    /// Normalised (lowercased, punctuation-stripped) copies of the song's
    /// lines — comparison-ready, never shown to a client. Display text comes
    /// from `Song::lines` directly, not from here.
    pub lines: Vec<String>,
    pub line_to_slide_index: Vec<usize>,
    /// Normalised copies of each slide's lines, same rationale as `lines`.
    pub slide_texts: Vec<Vec<String>>,
    pub current_line_index: usize,
    /// Concatenation of the current slide's last-two-line tail, populated
    /// only when `current_line_index` is the slide's last line. Already
    /// normalised, since it is built from `slide_texts`.
    pub end_of_slide_bigram_target: Option<String>,
}

impl SongContext {
    /// Build a context for `song` with focus on `line_index`, deriving the
    /// end-of-slide bigram target from the song's compiled slides. Lines and
    /// slide text are normalised here (spec §4.4) so every later similarity
    /// comparison — against the already-normalised transcript buffer — sees
    /// both sides on equal footing.
    pub fn new(song: &Song, line_index: usize) -> Self {
        let lines: Vec<String> = song.lines.iter().map(|l| normalize_words(l)).collect();
        let line_index = line_index.min(lines.len().saturating_sub(1));
        let line_to_slide_index = song
            .line_to_slide_index
            .clone()
            .unwrap_or_else(|| (0..lines.len()).collect());
        let slide_texts: Vec<Vec<String>> = song
            .slides
            .as_ref()
            .map(|slides| slides.iter().map(|s| s.lines.iter().map(|l| normalize_words(l)).collect()).collect())
            .unwrap_or_else(|| lines.iter().map(|l| vec![l.clone()]).collect());

        let end_of_slide_bigram_target = Self::bigram_target(&lines, &line_to_slide_index, &slide_texts, line_index);

        Self {
            song_id: song.id.clone(),
            song_title: song.title.clone(),
            lines,
            line_to_slide_index,
            slide_texts,
            current_line_index: line_index,
            end_of_slide_bigram_target,
        }
    }

    /// Move focus to a new line within the same song, recomputing the bigram
    /// target.
    pub fn with_line_index(&self, line_index: usize) -> Self {
        let line_index = line_index.min(self.lines.len().saturating_sub(1));
        let end_of_slide_bigram_target =
            Self::bigram_target(&self.lines, &self.line_to_slide_index, &self.slide_texts, line_index);
        Self {
            current_line_index: line_index,
            end_of_slide_bigram_target,
            ..self.clone()
        }
    }

    fn bigram_target(
        lines: &[String],
        line_to_slide_index: &[usize],
        slide_texts: &[Vec<String>],
        line_index: usize,
    ) -> Option<String> {
        if line_index >= lines.len() {
            return None;
        }
        let slide_idx = *line_to_slide_index.get(line_index)?;
        let slide_lines = slide_texts.get(slide_idx)?;
        let is_last_line_of_slide = slide_lines.last().map(|l| l.as_str()) == Some(lines[line_index].as_str());
        if !is_last_line_of_slide {
            return None;
        }
        let tail: Vec<&String> = slide_lines.iter().rev().take(2).collect();
        let combined = tail.into_iter().rev().cloned().collect::<Vec<_>>().join(" ");
        Some(tail_fraction(&combined, END_TRIGGER_TAIL_FRACTION))
    }

    pub fn current_line(&self) -> &str {
        &self.lines[self.current_line_index]
    }

    pub fn current_slide_index(&self) -> usize {
        self.line_to_slide_index
            .get(self.current_line_index)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvanceReason {
    Jump,
    EndWords,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub match_found: bool,
    pub line_index: usize,
    pub confidence: f64,
    pub is_line_end: bool,
    pub next_line_index: Option<usize>,
    pub advance_reason: Option<AdvanceReason>,
    pub end_trigger_score: Option<f64>,
}

impl MatchResult {
    fn no_match(line_index: usize, confidence: f64) -> Self {
        Self {
            match_found: false,
            line_index,
            confidence,
            is_line_end: false,
            next_line_index: None,
            advance_reason: None,
            end_trigger_score: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuggestedSongSwitch {
    pub song_id: String,
    pub song_index: usize,
    pub matched_line_index: usize,
    pub matched_line: String,
    pub confidence: f64,
    pub song_title: String,
}

#[derive(Debug, Clone)]
pub struct MultiSongMatchResult {
    pub current: MatchResult,
    pub suggested_song_switch: Option<SuggestedSongSwitch>,
}

/// Similarity in `[0, 1]`: symmetric, `sim(x, x) = 1`, roughly monotone under
/// added noise. Backed by `strsim::normalized_levenshtein`.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b)
}

/// Lowercase, collapse whitespace, strip punctuation except apostrophes
/// within contractions.
fn normalize_words(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let chars: Vec<char> = lowered.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() || c.is_whitespace() {
            out.push(c);
        } else if c == '\'' {
            let prev_alnum = i > 0 && chars[i - 1].is_alphanumeric();
            let next_alnum = i + 1 < chars.len() && chars[i + 1].is_alphanumeric();
            if prev_alnum && next_alnum {
                out.push(c);
            }
        } else {
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Full buffer preprocessing: normalise, strip filler words, collapse
/// consecutive duplicate words, then trim to the most recent
/// [`MATCH_WORD_WINDOW`] words.
pub fn clean_buffer(raw: &str) -> String {
    let normalized = normalize_words(raw);
    let mut words: Vec<&str> = normalized
        .split_whitespace()
        .filter(|w| !FILLER_WORDS.contains(w))
        .collect();

    let mut deduped: Vec<&str> = Vec::with_capacity(words.len());
    for w in words.drain(..) {
        if deduped.last().copied() != Some(w) {
            deduped.push(w);
        }
    }

    let start = deduped.len().saturating_sub(MATCH_WORD_WINDOW);
    deduped[start..].join(" ")
}

/// Last `n` words of `text`.
fn last_n_words(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(n);
    words[start..].join(" ")
}

/// Last `fraction` (by word count) of `text`, rounded up so a non-empty text
/// always yields at least one word.
fn tail_fraction(text: &str, fraction: f64) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return String::new();
    }
    let take = ((words.len() as f64 * fraction).ceil() as usize).max(1).min(words.len());
    words[words.len() - take..].join(" ")
}

/// True when `line`'s words (normalised) start with `buffer`'s words, i.e.
/// the buffer is a literal prefix of the candidate line (spec §4.4, "initial
/// word penalty").
fn is_prefix_of(buffer_norm: &str, line_norm: &str) -> bool {
    let buffer_words: Vec<&str> = buffer_norm.split_whitespace().collect();
    let line_words: Vec<&str> = line_norm.split_whitespace().collect();
    if buffer_words.is_empty() || buffer_words.len() > line_words.len() {
        return false;
    }
    buffer_words.iter().zip(line_words.iter()).all(|(a, b)| a == b)
}

/// Single-song match (spec §4.4, `findBestMatch`). `buffer` must already be
/// cleaned via [`clean_buffer`].
pub fn find_best_match(buffer: &str, ctx: &SongContext, config: &MatcherConfig) -> MatchResult {
    let word_count = buffer.split_whitespace().count();
    if word_count < config.min_buffer_words {
        return MatchResult::no_match(ctx.current_line_index, 0.0);
    }

    let look_ahead_end = (ctx.current_line_index + LOOK_AHEAD_LINES - 1).min(ctx.lines.len() - 1);
    let end_of_buffer = last_n_words(buffer, END_OF_BUFFER_WORDS);

    let mut best_idx = ctx.current_line_index;
    let mut best_score = -1.0f64;

    for idx in ctx.current_line_index..=look_ahead_end {
        let line = &ctx.lines[idx];
        let full_sim = similarity(buffer, line);
        let mut end_sim = similarity(&end_of_buffer, line);
        if idx != ctx.current_line_index {
            end_sim = (end_sim * NON_CURRENT_LINE_BOOST).min(1.0);
        }
        let score = full_sim.max(end_sim);
        if score > best_score {
            best_score = score;
            best_idx = idx;
        }
    }

    if best_score < config.similarity_threshold {
        return MatchResult::no_match(best_idx, best_score);
    }

    if best_idx > ctx.current_line_index {
        return MatchResult {
            match_found: true,
            line_index: best_idx,
            confidence: best_score,
            is_line_end: true,
            next_line_index: Some(best_idx),
            advance_reason: Some(AdvanceReason::Jump),
            end_trigger_score: None,
        };
    }

    // best_idx == current_line_index: test the end-words trigger.
    let is_last_line_of_slide = ctx.end_of_slide_bigram_target.is_some();
    let target = if config.use_bigram_end_of_slide && is_last_line_of_slide {
        ctx.end_of_slide_bigram_target.clone().unwrap_or_default()
    } else {
        tail_fraction(ctx.current_line(), END_TRIGGER_TAIL_FRACTION)
    };
    let end_trigger_score = similarity(buffer, &target);
    let secondary_threshold = config.similarity_threshold * END_TRIGGER_THRESHOLD_FRACTION;

    if end_trigger_score > secondary_threshold {
        return MatchResult {
            match_found: true,
            line_index: best_idx,
            confidence: best_score,
            is_line_end: true,
            next_line_index: Some(ctx.current_line_index + 1),
            advance_reason: Some(AdvanceReason::EndWords),
            end_trigger_score: Some(end_trigger_score),
        };
    }

    MatchResult {
        match_found: true,
        line_index: best_idx,
        confidence: best_score,
        is_line_end: false,
        next_line_index: None,
        advance_reason: None,
        end_trigger_score: None,
    }
}

/// Multi-song match (spec §4.4, `findBestMatchAcrossAllSongs`). `others` is
/// the setlist's remaining songs paired with their setlist index.
pub fn find_best_match_across_all_songs(
    buffer: &str,
    current_ctx: &SongContext,
    others: &[(&Song, usize)],
    config: &MatcherConfig,
) -> MultiSongMatchResult {
    let current = find_best_match(buffer, current_ctx, config);
    let buffer_norm = normalize_words(buffer);

    let mut best_other: Option<SuggestedSongSwitch> = None;

    for &(song, song_index) in others {
        if song.lines.is_empty() {
            continue;
        }

        let mut best_line_idx = 0usize;
        let mut best_line_score = -1.0f64;
        for (i, line) in song.lines.iter().enumerate() {
            let line_norm = normalize_words(line);
            let mut score = similarity(&buffer_norm, &line_norm);
            if !is_prefix_of(&buffer_norm, &line_norm) {
                score *= INITIAL_WORD_PENALTY;
            }
            if score > best_line_score {
                best_line_score = score;
                best_line_idx = i;
            }
        }

        let title_norm = normalize_words(&song.title);
        let title_sim = similarity(&buffer_norm, &title_norm);
        let (final_score, final_idx) = if title_sim >= config.similarity_threshold {
            (best_line_score.max(TITLE_MATCH_CONFIDENCE), 0)
        } else {
            (best_line_score, best_line_idx)
        };

        let better = best_other.as_ref().map(|o| final_score > o.confidence).unwrap_or(true);
        if better {
            best_other = Some(SuggestedSongSwitch {
                song_id: song.id.clone(),
                song_index,
                matched_line_index: final_idx,
                matched_line: song.lines.get(final_idx).cloned().unwrap_or_default(),
                confidence: final_score,
                song_title: song.title.clone(),
            });
        }
    }

    let suggested_song_switch = best_other.filter(|o| o.confidence > current.confidence + SONG_SWITCH_SUGGESTION_MARGIN);

    MultiSongMatchResult {
        current,
        suggested_song_switch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slides::{compile, SlideCompileConfig};

    fn song(id: &str, title: &str, lyrics: &str) -> Song {
        compile(id.to_string(), title.to_string(), None, lyrics, &SlideCompileConfig::default())
    }

    #[test]
    fn exact_match_on_current_line_has_high_confidence() {
        let amazing_grace = song(
            "s1",
            "Amazing Grace",
            "Amazing grace how sweet the sound\nThat saved a wretch like me",
        );
        let ctx = SongContext::new(&amazing_grace, 0);
        let config = MatcherConfig::new(0.85, 2, MATCH_WORD_WINDOW, true, false);
        let buffer = clean_buffer("Amazing grace how sweet the sound");
        let result = find_best_match(&buffer, &ctx, &config);
        assert!(result.match_found);
        assert!(result.confidence > 0.95);
        assert_eq!(result.line_index, 0);
    }

    #[test]
    fn matching_next_line_advances_with_jump_reason() {
        let amazing_grace = song(
            "s1",
            "Amazing Grace",
            "Amazing grace how sweet the sound\nThat saved a wretch like me",
        );
        let ctx = SongContext::new(&amazing_grace, 0);
        let config = MatcherConfig::default();
        let buffer = clean_buffer("that saved a wretch like me");
        let result = find_best_match(&buffer, &ctx, &config);
        assert!(result.match_found);
        assert!(result.is_line_end);
        assert_eq!(result.next_line_index, Some(1));
        assert_eq!(result.advance_reason, Some(AdvanceReason::Jump));
    }

    #[test]
    fn case_and_punctuation_are_normalised_away() {
        let amazing_grace = song(
            "s1",
            "Amazing Grace",
            "Amazing grace how sweet the sound\nThat saved a wretch like me",
        );
        let ctx = SongContext::new(&amazing_grace, 0);
        let config = MatcherConfig::default();
        let buffer = clean_buffer("AMAZING GRACE, HOW SWEET THE SOUND!");
        let result = find_best_match(&buffer, &ctx, &config);
        assert!(result.match_found);
        assert!(result.confidence > 0.90);
    }

    #[test]
    fn punctuated_mixed_case_lyric_line_still_matches_plain_buffer() {
        // The lyric line itself carries real punctuation and mixed case, not
        // just the buffer — exercises normalisation on the `SongContext` side
        // of the comparison, not only the transcript side.
        let amazing_grace = song(
            "s1",
            "Amazing Grace",
            "Amazing Grace, how SWEET the sound!\nThat saved a wretch like me.",
        );
        let ctx = SongContext::new(&amazing_grace, 0);
        let config = MatcherConfig::default();
        let buffer = clean_buffer("amazing grace how sweet the sound");
        let result = find_best_match(&buffer, &ctx, &config);
        assert!(result.match_found);
        assert!(result.confidence > 0.95);
        assert_eq!(result.line_index, 0);
    }

    #[test]
    fn too_short_buffer_is_no_match() {
        let amazing_grace = song("s1", "Amazing Grace", "Amazing grace how sweet the sound");
        let ctx = SongContext::new(&amazing_grace, 0);
        let config = MatcherConfig::new(0.85, 5, MATCH_WORD_WINDOW, true, false);
        let result = find_best_match("one two", &ctx, &config);
        assert!(!result.match_found);
    }

    #[test]
    fn initial_word_penalty_suppresses_mid_phrase_substring_match() {
        let holy_forever = song("s1", "Holy Forever", "A thousand generations falling down in worship");
        let worthy = song("s2", "Worthy", "Worthy is your name");
        let ctx = SongContext::new(&holy_forever, 0);
        let config = MatcherConfig::default();
        let buffer = clean_buffer("your name");

        let unpenalized = similarity(&normalize_words(&buffer), &normalize_words(&worthy.lines[0]));
        let result = find_best_match_across_all_songs(&buffer, &ctx, &[(&worthy, 1)], &config);

        let suggestion_confidence = result
            .suggested_song_switch
            .as_ref()
            .map(|s| s.confidence)
            .unwrap_or(0.0);
        assert!(suggestion_confidence <= unpenalized * INITIAL_WORD_PENALTY + f64::EPSILON);
    }

    #[test]
    fn title_match_boosts_confidence_above_floor() {
        let holy_forever = song("s1", "Holy Forever", "A thousand generations falling down in worship");
        let other_current = song("s2", "Some Other Song", "lines that do not matter at all today");
        let ctx = SongContext::new(&other_current, 0);
        let config = MatcherConfig::default();
        let buffer = clean_buffer("holy forever");

        let result = find_best_match_across_all_songs(&buffer, &ctx, &[(&holy_forever, 0)], &config);
        let suggestion = result.suggested_song_switch.expect("expected a suggested switch");
        assert_eq!(suggestion.song_id, "s1");
        assert!(suggestion.confidence >= TITLE_MATCH_CONFIDENCE);
    }

    #[test]
    fn repeating_phrase_across_slide_boundary_requires_full_bigram() {
        let lyrics = "All honour and praise we give to you\nWorthy is your name\nWorthy is your name\nForever we will sing";
        let config_compile = SlideCompileConfig {
            lines_per_slide: 2,
            respect_stanza_breaks: false,
            explicit_breaks: Vec::new(),
        };
        let s = compile("s1".to_string(), "Repeating".to_string(), None, lyrics, &config_compile);
        assert_eq!(s.slides.as_ref().unwrap().len(), 2);

        let ctx = SongContext::new(&s, 1);
        assert!(ctx.end_of_slide_bigram_target.is_some());

        let config = MatcherConfig::default();

        let short_buffer = clean_buffer("worthy is your name");
        let short_result = find_best_match(&short_buffer, &ctx, &config);
        assert!(!short_result.is_line_end || short_result.advance_reason != Some(AdvanceReason::EndWords));

        let full_buffer = clean_buffer("all honour and praise we give to you worthy is your name");
        let full_result = find_best_match(&full_buffer, &ctx, &config);
        assert!(full_result.match_found);
    }

    #[test]
    fn clean_buffer_strips_filler_and_dedups() {
        let cleaned = clean_buffer("um the the lord is um my shepherd");
        assert!(!cleaned.contains("um"));
        assert!(!cleaned.contains("the the"));
    }

    #[test]
    fn clean_buffer_is_idempotent() {
        let once = clean_buffer("Um hello HELLO world");
        let twice = clean_buffer(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn similarity_is_symmetric_and_reflexive() {
        assert_eq!(similarity("hello world", "hello world"), 1.0);
        assert_eq!(similarity("abc", "xyz"), similarity("xyz", "abc"));
    }
}
