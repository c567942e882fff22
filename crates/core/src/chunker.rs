//! Splits documents into overlapping text windows
//!
//! Windows are measured in characters. A window ends on whitespace whenever
//! one exists past the overlap region, so words are not cut in half, and the
//! next window starts `overlap` characters earlier, moved forward to the next
//! word start. Output depends only on the text and the parameters, which keeps
//! downstream cache keys stable.

use crate::document::{Chunk, Document};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Window and overlap sizes, in characters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkParams {
    pub window_size: usize,
    pub overlap: usize,
}

impl ChunkParams {
    /// Validated parameters; `overlap` must be smaller than `window_size`
    pub fn new(window_size: usize, overlap: usize) -> Result<Self> {
        if window_size == 0 || overlap >= window_size {
            return Err(CoreError::InvalidChunkParams { window_size, overlap });
        }
        Ok(Self { window_size, overlap })
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            window_size: 600,
            overlap: 100,
        }
    }
}

/// Stateless chunker
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    params: ChunkParams,
}

impl Chunker {
    pub fn new(params: ChunkParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> ChunkParams {
        self.params
    }

    /// Chunk a document into an ordered vector
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        self.iter(document).collect()
    }

    /// Lazily chunk a document. Each call starts from the beginning.
    pub fn iter<'a>(&self, document: &'a Document) -> Chunks<'a> {
        Chunks {
            document,
            chars: document.text.chars().collect(),
            params: self.params,
            start: 0,
            index: 0,
        }
    }
}

/// Iterator over a document's chunks
pub struct Chunks<'a> {
    document: &'a Document,
    chars: Vec<char>,
    params: ChunkParams,
    start: usize,
    index: usize,
}

impl Chunks<'_> {
    fn skip_whitespace(&self, mut pos: usize) -> usize {
        while pos < self.chars.len() && self.chars[pos].is_whitespace() {
            pos += 1;
        }
        pos
    }

    /// End of the window starting at `start`, preferring a whitespace boundary
    fn window_end(&self, start: usize) -> usize {
        let len = self.chars.len();
        let hard_end = (start + self.params.window_size).min(len);
        if hard_end == len {
            return len;
        }
        // The boundary must lie past the overlap region so the next window
        // starts strictly after this one.
        let floor = start + self.params.overlap + 1;
        (floor..=hard_end)
            .rev()
            .find(|&pos| self.chars[pos].is_whitespace())
            .unwrap_or(hard_end)
    }

    /// Start of the window following one that ended at `end`
    fn next_start(&self, end: usize) -> usize {
        let next = end - self.params.overlap;
        let mid_word =
            next > 0 && !self.chars[next - 1].is_whitespace() && !self.chars[next].is_whitespace();
        if !mid_word {
            return self.skip_whitespace(next);
        }
        // Move to the next word start inside the overlap, if there is one
        match (next + 1..end).find(|&pos| self.chars[pos - 1].is_whitespace()) {
            Some(pos) => self.skip_whitespace(pos),
            None => next,
        }
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let start = self.skip_whitespace(self.start);
        if start >= self.chars.len() {
            return None;
        }

        let end = self.window_end(start);
        // Trailing whitespace is dropped from both the text and its span
        let mut text_end = end;
        while text_end > start && self.chars[text_end - 1].is_whitespace() {
            text_end -= 1;
        }
        let chunk = Chunk {
            document_id: self.document.id.clone(),
            index: self.index,
            text: self.chars[start..text_end].iter().collect(),
            start_char: start,
            end_char: text_end,
        };

        self.index += 1;
        self.start = if end >= self.chars.len() {
            self.chars.len()
        } else {
            self.next_start(end)
        };

        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        Document::new(
            "Acme Corp, based in Germany, supplies chips to TaiwanTech, \
             which ships to JapanCo. JapanCo assembles consoles and sells \
             them across Asia and Europe through several distributors.",
        )
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_window() {
        assert!(ChunkParams::new(10, 10).is_err());
        assert!(ChunkParams::new(0, 0).is_err());
        assert!(ChunkParams::new(10, 9).is_ok());
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let doc = sample();
        let chunker = Chunker::new(ChunkParams::new(40, 10).unwrap());
        let first = chunker.chunk(&doc);
        let second = chunker.chunk(&doc);
        assert_eq!(first, second);
        assert!(first.len() > 1);
    }

    #[test]
    fn test_chunks_cover_document_in_order() {
        let doc = sample();
        let chunker = Chunker::new(ChunkParams::new(40, 10).unwrap());
        let chunks = chunker.chunk(&doc);

        assert_eq!(chunks[0].start_char, 0);
        assert_eq!(chunks.last().unwrap().end_char, doc.text.chars().count());
        for (i, pair) in chunks.windows(2).enumerate() {
            assert_eq!(pair[0].index, i);
            assert!(pair[1].start_char > pair[0].start_char);
            // Consecutive windows overlap or touch, nothing is skipped
            assert!(pair[1].start_char <= pair[0].end_char);
        }
    }

    #[test]
    fn test_boundaries_fall_on_whitespace() {
        let doc = Document::new("the quick brown fox jumps over the lazy dog ".repeat(6));
        let chars: Vec<char> = doc.text.chars().collect();
        let chunker = Chunker::new(ChunkParams::new(40, 10).unwrap());
        for chunk in chunker.chunk(&doc) {
            assert!(chunk.text.chars().count() <= 40);
            if chunk.end_char < chars.len() {
                assert!(chars[chunk.end_char].is_whitespace());
            }
            if chunk.start_char > 0 {
                assert!(chars[chunk.start_char - 1].is_whitespace());
            }
        }
    }

    #[test]
    fn test_hard_split_without_whitespace() {
        let doc = Document::new("a".repeat(25));
        let chunker = Chunker::new(ChunkParams::new(10, 2).unwrap());
        let chunks = chunker.chunk(&doc);
        assert_eq!(chunks[0].text.len(), 10);
        assert_eq!(chunks[1].start_char, 8);
        assert_eq!(chunks.last().unwrap().end_char, 25);
    }

    #[test]
    fn test_short_and_empty_documents() {
        let chunker = Chunker::new(ChunkParams::new(100, 10).unwrap());
        assert!(chunker.chunk(&Document::new("")).is_empty());
        assert!(chunker.chunk(&Document::new("   \n ")).is_empty());

        let chunks = chunker.chunk(&Document::new("short text"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short text");
    }

    #[test]
    fn test_span_matches_text() {
        let doc = Document::new("alpha beta   gamma delta\n\n  epsilon zeta eta   theta iota kappa  ");
        let chars: Vec<char> = doc.text.chars().collect();
        let chunker = Chunker::new(ChunkParams::new(20, 5).unwrap());
        let chunks = chunker.chunk(&doc);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.end_char - chunk.start_char, chunk.text.chars().count());
            let span: String = chars[chunk.start_char..chunk.end_char].iter().collect();
            assert_eq!(span, chunk.text);
            assert!(!chunk.text.ends_with(char::is_whitespace));
        }
    }

    #[test]
    fn test_iterator_is_restartable() {
        let doc = sample();
        let chunker = Chunker::new(ChunkParams::new(30, 5).unwrap());
        let partial: Vec<_> = chunker.iter(&doc).take(2).collect();
        let full = chunker.chunk(&doc);
        assert_eq!(partial[..], full[..2]);
    }
}
