//! Size-adaptive text chunking.
//!
//! Text is split on paragraph boundaries first, then on sentence punctuation,
//! and only as a last resort by raw character offsets. All sizes are counted
//! in characters, never bytes, so multi-byte text is never cut mid-character.

use regex::Regex;
use std::sync::OnceLock;

/// Chunking parameters for one size tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    /// Maximum body length of a segment
    pub target: usize,
    /// Characters of the previous body prefixed to each following segment
    pub overlap: usize,
    /// Segment count above which adjacent segments are merged
    pub soft_cap: usize,
}

impl ChunkParams {
    /// Parameters for a text of `len` characters.
    pub fn for_length(len: usize) -> Self {
        let (target, overlap, soft_cap) = match len {
            0..=4_999 => (512, 50, 50),
            5_000..=49_999 => (800, 80, 150),
            50_000..=199_999 => (1024, 100, 300),
            200_000..=999_999 => (1536, 150, 500),
            _ => (2048, 200, 800),
        };
        Self {
            target,
            overlap,
            soft_cap,
        }
    }
}

/// A chunk split into the context copied from its predecessor and its own body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub overlap: String,
    pub body: String,
}

impl Segment {
    /// Text as stored and vectorized: overlap followed by body.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.overlap.len() + self.body.len());
        text.push_str(&self.overlap);
        text.push_str(&self.body);
        text
    }
}

fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?;。！？；]+").expect("valid sentence regex"))
}

fn blank_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n").expect("valid paragraph regex"))
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn tail_chars(s: &str, n: usize) -> String {
    let len = char_len(s);
    s.chars().skip(len.saturating_sub(n)).collect()
}

/// Greedy packer for pieces joined by a separator
struct Packer {
    limit: usize,
    done: Vec<String>,
    current: String,
    current_len: usize,
}

impl Packer {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            done: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    fn push(&mut self, piece: &str, joiner: &str) {
        let len = char_len(piece);
        let joiner_len = char_len(joiner);
        if self.current_len > 0 && self.current_len + joiner_len + len > self.limit {
            self.flush();
        }
        if self.current_len > 0 {
            self.current.push_str(joiner);
            self.current_len += joiner_len;
        }
        self.current.push_str(piece);
        self.current_len += len;
    }

    fn flush(&mut self) {
        if self.current_len > 0 {
            self.done.push(std::mem::take(&mut self.current));
            self.current_len = 0;
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.done
    }
}

fn paragraphs(text: &str) -> Vec<&str> {
    let parts: Vec<&str> = if blank_line().is_match(text) {
        blank_line().split(text).collect()
    } else {
        text.split('\n').collect()
    };
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Sentences with their terminators attached; a trailing fragment is kept.
fn sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in sentence_end().find_iter(paragraph) {
        let sentence = paragraph[start..m.end()].trim();
        if !sentence.is_empty() {
            out.push(sentence);
        }
        start = m.end();
    }
    let rest = paragraph[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

fn force_split(sentence: &str, step: usize) -> Vec<String> {
    let chars: Vec<char> = sentence.chars().collect();
    chars
        .chunks(step.max(1))
        .map(|piece| piece.iter().collect())
        .collect()
}

/// Segment bodies before merging and overlap.
fn split_bodies(text: &str, params: ChunkParams) -> Vec<String> {
    let target = params.target;
    let step = target.saturating_sub(params.overlap).max(1);
    let mut packer = Packer::new(target);

    for paragraph in paragraphs(text) {
        if char_len(paragraph) <= target {
            packer.push(paragraph, "\n\n");
            continue;
        }

        packer.flush();
        for sentence in sentences(paragraph) {
            if char_len(sentence) <= target {
                packer.push(sentence, " ");
            } else {
                packer.flush();
                for piece in force_split(sentence, step) {
                    packer.push(&piece, "");
                    packer.flush();
                }
            }
        }
        packer.flush();
    }

    packer.finish()
}

fn merge_bodies(bodies: Vec<String>, limit: usize) -> Vec<String> {
    let mut packer = Packer::new(limit);
    for body in &bodies {
        packer.push(body, "\n\n");
    }
    packer.finish()
}

/// Split `text` into ordered segments sized by [`ChunkParams::for_length`].
///
/// Text no longer than the tier target comes back as a single segment equal
/// to the input, blank text included.
pub fn split_segments(text: &str) -> Vec<Segment> {
    let params = ChunkParams::for_length(char_len(text));
    if char_len(text) <= params.target {
        return vec![Segment {
            overlap: String::new(),
            body: text.to_string(),
        }];
    }

    let normalized = text.replace("\r\n", "\n");
    let mut bodies = split_bodies(&normalized, params);
    if bodies.len() > params.soft_cap {
        let before = bodies.len();
        bodies = merge_bodies(bodies, params.target + params.target / 2);
        log::debug!("Merged {} segments into {}", before, bodies.len());
    }

    let mut segments: Vec<Segment> = Vec::with_capacity(bodies.len());
    for body in bodies {
        let overlap = match segments.last() {
            Some(prev) => tail_chars(&prev.body, params.overlap),
            None => String::new(),
        };
        segments.push(Segment { overlap, body });
    }
    segments
}

/// Chunk texts ready for storage and vectorization.
pub fn chunk_text(text: &str) -> Vec<String> {
    split_segments(text).iter().map(Segment::text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_ws(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn sample_text(paragraphs: usize) -> String {
        (0..paragraphs)
            .map(|p| {
                (0..6)
                    .map(|s| format!("Paragraph {} sentence {} talks about storage engines.", p, s))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_tiers() {
        assert_eq!(ChunkParams::for_length(100).target, 512);
        assert_eq!(ChunkParams::for_length(4_999).target, 512);
        assert_eq!(ChunkParams::for_length(5_000).target, 800);
        assert_eq!(ChunkParams::for_length(60_000).overlap, 100);
        assert_eq!(ChunkParams::for_length(999_999).soft_cap, 500);
        assert_eq!(ChunkParams::for_length(2_000_000).target, 2048);
    }

    #[test]
    fn test_short_text_single_chunk() {
        let text = "x".repeat(100);
        assert_eq!(chunk_text(&text), vec![text.clone()]);

        let with_newlines = "line one\r\n\r\nline two";
        assert_eq!(chunk_text(with_newlines), vec![with_newlines.to_string()]);
    }

    #[test]
    fn test_blank_text_is_one_chunk() {
        assert_eq!(chunk_text("   \n  "), vec!["   \n  ".to_string()]);
        assert_eq!(chunk_text(""), vec![String::new()]);
    }

    #[test]
    fn test_bodies_reconstruct_input() {
        let text = sample_text(40);
        let segments = split_segments(&text);
        assert!(segments.len() > 1);

        let joined: String = segments.iter().map(|s| s.body.as_str()).collect();
        assert_eq!(strip_ws(&joined), strip_ws(&text));
    }

    #[test]
    fn test_bodies_within_target() {
        let text = sample_text(40);
        let params = ChunkParams::for_length(char_len(&text));
        for segment in split_segments(&text) {
            assert!(char_len(&segment.body) <= params.target);
        }
    }

    #[test]
    fn test_overlap_is_tail_of_previous_body() {
        let text = sample_text(40);
        let params = ChunkParams::for_length(char_len(&text));
        let segments = split_segments(&text);

        assert!(segments[0].overlap.is_empty());
        for pair in segments.windows(2) {
            assert!(pair[0].body.ends_with(&pair[1].overlap));
            assert!(char_len(&pair[1].overlap) <= params.overlap);
            assert!(pair[1].text().starts_with(&pair[1].overlap));
        }
    }

    #[test]
    fn test_oversized_sentence_force_split() {
        // one 3000-char run without any punctuation or newline
        let text = "ab".repeat(1500);
        let params = ChunkParams::for_length(3000);
        let segments = split_segments(&text);

        assert_eq!(segments.len(), 7); // ceil(3000 / (512 - 50))
        for segment in &segments {
            assert!(char_len(&segment.body) <= params.target - params.overlap);
        }
        let joined: String = segments.iter().map(|s| s.body.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_multibyte_text_is_safe() {
        let text = "知识库文档。".repeat(300);
        let segments = split_segments(&text);
        assert!(segments.len() > 1);
        let joined: String = segments.iter().map(|s| s.body.as_str()).collect();
        assert_eq!(strip_ws(&joined), strip_ws(&text));
    }

    #[test]
    fn test_sentences_keep_trailing_fragment() {
        assert_eq!(
            sentences("One. Two! Three without end"),
            vec!["One.", "Two!", "Three without end"]
        );
    }

    #[test]
    fn test_many_segments_merged_past_soft_cap() {
        let text = (0..52)
            .map(|b| {
                let long = (0..24)
                    .map(|i| format!("Block {:02} sentence {:02} covers storage.", b, i))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("Block {:02} intro.\n\n{}", b, long)
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let params = ChunkParams::for_length(char_len(&text));
        assert_eq!(params.target, 800);

        let unmerged = split_bodies(&text, params).len();
        assert!(unmerged > params.soft_cap);

        let segments = split_segments(&text);
        let limit = params.target + params.target / 2;
        assert!(segments.len() < unmerged);
        assert!(segments.iter().all(|s| char_len(&s.body) <= limit));
        assert!(segments.iter().any(|s| char_len(&s.body) > params.target));
        assert!(segments[0].overlap.is_empty());

        let joined: String = segments.iter().map(|s| s.body.as_str()).collect();
        assert_eq!(strip_ws(&joined), strip_ws(&text));
    }

    #[test]
    fn test_merge_respects_soft_limit() {
        let bodies: Vec<String> = (0..10).map(|_| "y".repeat(300)).collect();
        let merged = merge_bodies(bodies, 768);
        assert_eq!(merged.len(), 5);
        assert!(merged.iter().all(|b| char_len(b) <= 768));
    }
}
