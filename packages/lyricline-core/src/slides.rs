//! Slide compiler.
//!
//! A deterministic pure function: given raw lyrics text and a
//! [`SlideCompileConfig`], produces the ordered non-empty line list, the
//! ordered slide list, and a line→slide index mapping. No I/O, no shared
//! state — this module is pure transformation, tested purely by value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A compiled song: lines, slides (contiguous line ranges), and the
/// line→slide mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    pub lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slides: Option<Vec<Slide>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_to_slide_index: Option<Vec<usize>>,
}

/// A single slide: a contiguous `[start_line, end_line]` range, its composed
/// display text, and its ordered lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    pub start_line: usize,
    pub end_line: usize,
    pub slide_text: String,
    pub lines: Vec<String>,
}

/// Config governing slide compilation.
#[derive(Debug, Clone)]
pub struct SlideCompileConfig {
    pub lines_per_slide: usize,
    pub respect_stanza_breaks: bool,
    /// Zero-indexed line indices after which a slide break is forced,
    /// independent of stanza breaks.
    pub explicit_breaks: Vec<usize>,
}

impl Default for SlideCompileConfig {
    fn default() -> Self {
        Self {
            lines_per_slide: 2,
            respect_stanza_breaks: true,
            explicit_breaks: Vec::new(),
        }
    }
}

/// Compile raw lyrics text into (lines, slides, line_to_slide_index).
///
/// Normalises line endings, trims each line, and drops empty lines while
/// still tracking where blank lines occurred (for stanza-break detection)
/// before they're dropped. A song with no resulting slides (e.g. because
/// `lines_per_slide` was effectively 1) is one-line-per-slide.
pub fn compile_song(raw_lyrics: &str, config: &SlideCompileConfig) -> (Vec<String>, Vec<Slide>, Vec<usize>) {
    let normalized = raw_lyrics.replace("\r\n", "\n").replace('\r', "\n");

    let mut lines = Vec::new();
    let mut stanza_break_after: BTreeSet<usize> = BTreeSet::new();

    for raw_line in normalized.split('\n') {
        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            if config.respect_stanza_breaks {
                if let Some(last) = lines.len().checked_sub(1) {
                    stanza_break_after.insert(last);
                }
            }
            continue;
        }
        lines.push(trimmed.to_string());
    }

    if lines.is_empty() {
        return (lines, Vec::new(), Vec::new());
    }

    let lines_per_slide = config.lines_per_slide.max(1);
    let mut breaks: BTreeSet<usize> = stanza_break_after;
    for &idx in &config.explicit_breaks {
        if idx < lines.len() {
            breaks.insert(idx);
        }
    }

    let mut slides = Vec::new();
    let mut line_to_slide_index = vec![0usize; lines.len()];
    let mut slide_start = 0usize;

    for i in 0..lines.len() {
        line_to_slide_index[i] = slides.len();
        let filled = i - slide_start + 1;
        let forced_break = breaks.contains(&i);
        let is_last_line = i == lines.len() - 1;

        if forced_break || filled >= lines_per_slide || is_last_line {
            let slide_lines = lines[slide_start..=i].to_vec();
            slides.push(Slide {
                start_line: slide_start,
                end_line: i,
                slide_text: slide_lines.join("\n"),
                lines: slide_lines,
            });
            slide_start = i + 1;
        }
    }

    (lines, slides, line_to_slide_index)
}

/// Compile a [`Song`] in place from its raw lyrics, filling `lines`, `slides`,
/// and `line_to_slide_index`.
pub fn compile(id: String, title: String, artist: Option<String>, raw_lyrics: &str, config: &SlideCompileConfig) -> Song {
    let (lines, slides, line_to_slide_index) = compile_song(raw_lyrics, config);
    Song {
        id,
        title,
        artist,
        lines,
        slides: Some(slides),
        line_to_slide_index: Some(line_to_slide_index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(lines_per_slide: usize, respect_stanza_breaks: bool) -> SlideCompileConfig {
        SlideCompileConfig {
            lines_per_slide,
            respect_stanza_breaks,
            explicit_breaks: Vec::new(),
        }
    }

    #[test]
    fn empty_lyrics_yields_no_lines_or_slides() {
        let (lines, slides, mapping) = compile_song("", &cfg(2, true));
        assert!(lines.is_empty());
        assert!(slides.is_empty());
        assert!(mapping.is_empty());
    }

    #[test]
    fn blank_lines_are_dropped() {
        let (lines, _, _) = compile_song("line one\n\n\nline two\n", &cfg(2, false));
        assert_eq!(lines, vec!["line one", "line two"]);
    }

    #[test]
    fn single_line_song_is_one_line_per_slide() {
        let (lines, slides, mapping) = compile_song("only line", &cfg(2, true));
        assert_eq!(lines.len(), 1);
        assert_eq!(slides.len(), 1);
        assert_eq!(mapping, vec![0]);
    }

    #[test]
    fn greedy_fill_up_to_lines_per_slide() {
        let (lines, slides, mapping) = compile_song("a\nb\nc\nd\ne", &cfg(2, false));
        assert_eq!(lines.len(), 5);
        assert_eq!(slides.len(), 3);
        assert_eq!(slides[0].lines, vec!["a", "b"]);
        assert_eq!(slides[1].lines, vec!["c", "d"]);
        assert_eq!(slides[2].lines, vec!["e"]);
        assert_eq!(mapping, vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn blank_line_forces_break_regardless_of_fill() {
        let (lines, slides, _) = compile_song("a\nb\n\nc\nd\ne", &cfg(4, true));
        assert_eq!(lines, vec!["a", "b", "c", "d", "e"]);
        // Stanza break after "b" terminates the slide even though
        // lines_per_slide (4) hasn't been reached yet.
        assert_eq!(slides[0].lines, vec!["a", "b"]);
        assert_eq!(slides[1].lines, vec!["c", "d", "e"]);
    }

    #[test]
    fn explicit_breaks_union_with_stanza_breaks() {
        let config = SlideCompileConfig {
            lines_per_slide: 10,
            respect_stanza_breaks: false,
            explicit_breaks: vec![1],
        };
        let (_, slides, _) = compile_song("a\nb\nc\nd", &config);
        assert_eq!(slides[0].lines, vec!["a", "b"]);
        assert_eq!(slides[1].lines, vec!["c", "d"]);
    }

    #[test]
    fn slides_partition_lines_with_no_gaps_or_overlaps() {
        let (lines, slides, mapping) = compile_song("a\nb\nc\nd\ne\nf\ng", &cfg(3, false));
        let mut covered = 0;
        for slide in &slides {
            assert_eq!(slide.start_line, covered);
            covered = slide.end_line + 1;
        }
        assert_eq!(covered, lines.len());
        for (i, &slide_idx) in mapping.iter().enumerate() {
            let slide = &slides[slide_idx];
            assert!(i >= slide.start_line && i <= slide.end_line);
        }
    }

    #[test]
    fn compiling_twice_is_idempotent() {
        let text = "a\nb\n\nc\nd\ne";
        let config = cfg(2, true);
        let first = compile_song(text, &config);
        let second = compile_song(text, &config);
        assert_eq!(first.0, second.0);
        assert_eq!(first.2, second.2);
        assert_eq!(first.1.len(), second.1.len());
    }

    #[test]
    fn line_to_slide_index_maps_back_into_that_slides_lines() {
        let (lines, slides, mapping) = compile_song("a\nb\nc", &cfg(2, false));
        for i in 0..lines.len() {
            let slide = &slides[mapping[i]];
            assert!(slide.lines.contains(&lines[i]));
        }
    }
}
