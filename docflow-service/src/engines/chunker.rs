use async_trait::async_trait;

use crate::pipeline::{BoxError, ChunkDraft, Chunker, ParsedDocument};

/// Fixed-size character windows with overlap.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeChunker {
    size: usize,
    overlap: usize,
}

impl FixedSizeChunker {
    /// `size` is at least one character and `overlap` is kept below it.
    pub fn new(size: usize, overlap: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            overlap: overlap.min(size - 1),
        }
    }

    pub fn split(&self, text: &str) -> Vec<ChunkDraft> {
        let chars: Vec<char> = text.chars().collect();
        let step = self.size - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let end = (start + self.size).min(chars.len());
            let window: String = chars[start..end].iter().collect();
            let trimmed = window.trim();

            if !trimmed.is_empty() {
                let index = chunks.len();
                chunks.push(ChunkDraft {
                    index,
                    title: format!("Chunk {}", index + 1),
                    content: trimmed.to_string(),
                });
            }

            if end == chars.len() {
                break;
            }
            start += step;
        }

        chunks
    }
}

#[async_trait]
impl Chunker for FixedSizeChunker {
    async fn chunk(&self, document: &ParsedDocument) -> Result<Vec<ChunkDraft>, BoxError> {
        Ok(self.split(&document.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_overlap() {
        let chunks = FixedSizeChunker::new(4, 2).split("abcdefgh");
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["abcd", "cdef", "efgh"]);
        assert_eq!(chunks[2].index, 2);
        assert_eq!(chunks[2].title, "Chunk 3");
    }

    #[test]
    fn test_whitespace_windows_dropped() {
        let chunks = FixedSizeChunker::new(3, 0).split("abc      def");
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["abc", "def"]);
        assert_eq!(chunks[1].index, 1);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(FixedSizeChunker::new(10, 2).split("").is_empty());
        assert!(FixedSizeChunker::new(10, 2).split(" \n\t ").is_empty());
    }

    #[test]
    fn test_overlap_clamped_below_size() {
        let chunks = FixedSizeChunker::new(2, 5).split("abcd");
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_multibyte_text_splits_on_chars() {
        let chunks = FixedSizeChunker::new(2, 0).split("ééüü");
        assert_eq!(chunks[0].content, "éé");
        assert_eq!(chunks[1].content, "üü");
    }
}
