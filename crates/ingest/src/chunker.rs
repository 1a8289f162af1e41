use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::chunk::{Chunk, Document};
use common::{GraphRagError, Result};

/// Sizes are measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 3600,
            overlap: 400,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(GraphRagError::InvalidConfig(
                "max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.max_chunk_size <= self.overlap {
            return Err(GraphRagError::InvalidConfig(format!(
                "max_chunk_size ({}) must be greater than overlap ({})",
                self.max_chunk_size, self.overlap
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

/// Break candidates for one document, as char indices a chunk may end at.
struct Boundaries {
    paragraphs: Vec<usize>,
    sentences: Vec<usize>,
    words: Vec<usize>,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        self.chunk_text(&document.id, &document.text, &document.source)
    }

    /// Split `text` into overlapping chunks whose spans cover it completely.
    ///
    /// Each chunk holds at most `max_chunk_size` characters and ends at the last paragraph
    /// break, sentence boundary or whitespace inside its window when one exists. The next
    /// chunk starts `overlap` characters before the previous one ended.
    pub fn chunk_text(&self, doc_id: &str, text: &str, source: &str) -> Vec<Chunk> {
        // byte offset of every char, plus the end of the text
        let offsets: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let total_chars = offsets.len() - 1;

        let mut chunks = Vec::new();
        if total_chars == 0 {
            return chunks;
        }

        let boundaries = self.find_boundaries(text, &offsets);
        let max = self.config.max_chunk_size;
        let overlap = self.config.overlap;

        let mut start = 0;
        loop {
            let hard_end = (start + max).min(total_chars);
            let end = if hard_end == total_chars {
                total_chars
            } else {
                // Never cut so early that the next chunk fails to advance, and avoid
                // tiny chunks when a boundary sits near the window start.
                let lower = start + (overlap + 1).max(max / 2);
                boundaries.best_break(lower, hard_end).unwrap_or(hard_end)
            };

            let (byte_start, byte_end) = (offsets[start], offsets[end]);
            chunks.push(Chunk::new(
                doc_id.to_string(),
                chunks.len(),
                text[byte_start..byte_end].to_string(),
                source.to_string(),
                (byte_start, byte_end),
            ));

            if end == total_chars {
                break;
            }
            start = end - overlap;
        }

        chunks
    }

    fn find_boundaries(&self, text: &str, offsets: &[usize]) -> Boundaries {
        let to_char = |byte: usize| offsets.binary_search(&byte).ok();

        let paragraphs = text
            .match_indices("\n\n")
            .filter_map(|(i, sep)| to_char(i + sep.len()))
            .collect();

        let sentences = text
            .split_sentence_bound_indices()
            .filter_map(|(i, _)| to_char(i))
            .filter(|&c| c > 0)
            .collect();

        let words = text
            .char_indices()
            .enumerate()
            .filter(|(_, (_, c))| c.is_whitespace())
            .map(|(char_idx, _)| char_idx + 1)
            .collect();

        Boundaries {
            paragraphs,
            sentences,
            words,
        }
    }
}

impl Boundaries {
    /// Last break in `[lower, upper]`, preferring paragraphs, then sentences, then words.
    fn best_break(&self, lower: usize, upper: usize) -> Option<usize> {
        if lower > upper {
            return None;
        }
        [&self.paragraphs, &self.sentences, &self.words]
            .into_iter()
            .find_map(|candidates| last_in_range(candidates, lower, upper))
    }
}

fn last_in_range(sorted: &[usize], lower: usize, upper: usize) -> Option<usize> {
    let idx = sorted.partition_point(|&c| c <= upper);
    sorted[..idx].last().copied().filter(|&c| c >= lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunker(max_chunk_size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            max_chunk_size,
            overlap,
        })
        .unwrap()
    }

    fn assert_covers(text: &str, chunks: &[Chunk]) {
        assert_eq!(chunks.first().unwrap().offset.0, 0);
        assert_eq!(chunks.last().unwrap().offset.1, text.len());
        for pair in chunks.windows(2) {
            // next chunk starts inside (or right at the end of) the previous one
            assert!(pair[1].offset.0 <= pair[0].offset.1);
            assert!(pair[1].offset.0 > pair[0].offset.0);
        }
        for chunk in chunks {
            assert_eq!(&text[chunk.offset.0..chunk.offset.1], chunk.text);
        }
    }

    #[test]
    fn test_basic_chunking() {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        let text = "This is a test paragraph.\n\nThis is another paragraph.";
        let chunks = chunker.chunk_text("test-doc", text, "test.txt");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].doc_id, "test-doc");
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_size() {
        let err = Chunker::new(ChunkerConfig {
            max_chunk_size: 100,
            overlap: 100,
        })
        .unwrap_err();
        assert!(matches!(err, GraphRagError::InvalidConfig(_)));

        assert!(Chunker::new(ChunkerConfig {
            max_chunk_size: 0,
            overlap: 0
        })
        .is_err());
    }

    #[test]
    fn test_empty_document_has_no_chunks() {
        assert!(chunker(10, 2).chunk_text("d", "", "s").is_empty());
    }

    #[test]
    fn test_chunks_cover_document_with_overlap() {
        let text = "Alice works at Acme. Acme is based in Springfield. \
                    Bob manages the Springfield office.\n\nThe office opened in 1999.";
        for (max, overlap) in [(16, 0), (16, 5), (40, 10), (25, 24), (7, 3)] {
            let chunks = chunker(max, overlap).chunk_text("d", text, "s");
            assert_covers(text, &chunks);
            for chunk in &chunks {
                assert!(chunk.text.chars().count() <= max);
            }
        }
    }

    #[test]
    fn test_multibyte_text_is_cut_on_char_boundaries() {
        let text = "Zürich liegt am Zürichsee. Café au lait. 東京は日本の首都です。";
        let chunks = chunker(9, 3).chunk_text("d", text, "s");
        assert_covers(text, &chunks);
    }

    #[test]
    fn test_prefers_sentence_boundaries() {
        let text = "First sentence here. Second sentence follows.";
        let chunks = chunker(30, 0).chunk_text("d", text, "s");
        assert_eq!(chunks[0].text, "First sentence here. ");
        assert_eq!(chunks[1].text, "Second sentence follows.");
    }

    #[test]
    fn test_prefers_paragraph_breaks() {
        let text = "Intro line one. Still intro.\n\nNext paragraph starts here.";
        let chunks = chunker(45, 0).chunk_text("d", text, "s");
        assert_eq!(chunks[0].text, "Intro line one. Still intro.\n\n");
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let text = "word ".repeat(500);
        let a = chunker(64, 16).chunk_text("d", &text, "s");
        let b = chunker(64, 16).chunk_text("d", &text, "s");
        assert_eq!(a, b);
        assert_eq!(
            a.iter().map(|c| c.index).collect::<Vec<_>>(),
            (0..a.len()).collect::<Vec<_>>()
        );
    }
}
