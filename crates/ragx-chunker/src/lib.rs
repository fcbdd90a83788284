//! RAGX Chunker - Overlapping token windows
//!
//! Splits a document's text into passages of at most `max_tokens` tokens,
//! consecutive passages sharing exactly `overlap` tokens. Every chunk is an
//! exact slice of the source text, so nothing is dropped or rewritten:
//! removing the overlap from each chunk after the first and concatenating
//! reproduces the document.
//!
//! Chunking is pure and deterministic. Chunk IDs embed a fingerprint of the
//! chunking configuration, which keeps IDs stable across runs and distinct
//! across reconfigurations.

pub mod tokenize;

pub use tokenize::{count_tokens, token_starts};

use ragx_core::{Chunk, EngineConfig, RagxError, Result, TokenizerKind};
use uuid::Uuid;

/// Namespace for configuration fingerprints
const FINGERPRINT_NAMESPACE: Uuid = Uuid::from_u128(0x0e4b_7d21_55c9_4f6a_a3b8_97e1_c0d2_f413);

// ============================================================================
// Chunker
// ============================================================================

/// Deterministic overlapping-window chunker
#[derive(Debug, Clone)]
pub struct Chunker {
    max_tokens: usize,
    overlap: usize,
    tokenizer: TokenizerKind,
    fingerprint: String,
}

impl Chunker {
    /// Create a chunker, validating `max_tokens > 0` and `overlap < max_tokens`
    pub fn new(max_tokens: usize, overlap: usize, tokenizer: TokenizerKind) -> Result<Self> {
        if max_tokens == 0 {
            return Err(RagxError::InvalidConfig(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
        if overlap >= max_tokens {
            return Err(RagxError::InvalidConfig(format!(
                "overlap ({overlap}) must be smaller than max_tokens ({max_tokens})"
            )));
        }

        Ok(Self {
            max_tokens,
            overlap,
            tokenizer,
            fingerprint: fingerprint(max_tokens, overlap, tokenizer),
        })
    }

    /// Create from engine config
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config.chunk_max_tokens, config.chunk_overlap, config.tokenizer)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn tokenizer(&self) -> TokenizerKind {
        self.tokenizer
    }

    /// Stable hash of the chunking configuration
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Chunk ID for the chunk at `index`
    pub fn chunk_id(&self, index: u32) -> String {
        format!("{index:05}-{}", self.fingerprint)
    }

    /// Split a document's text into ordered, overlapping chunks
    ///
    /// Empty text yields no chunks; text with at most `max_tokens` tokens
    /// yields exactly one.
    pub fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let starts = token_starts(text, self.tokenizer);
        let total = starts.len();
        let byte_at = |token: usize| starts.get(token).copied().unwrap_or(text.len());

        let step = self.max_tokens - self.overlap;
        let mut chunks = Vec::with_capacity(chunk_count(total, self.max_tokens, self.overlap));
        let mut start = 0;

        while start < total {
            let end = (start + self.max_tokens).min(total);
            let byte_range = byte_at(start)..byte_at(end);
            let index = chunks.len() as u32;

            chunks.push(Chunk {
                id: self.chunk_id(index),
                document_id: document_id.to_string(),
                index,
                content: text[byte_range.clone()].to_string(),
                byte_range,
                token_range: start..end,
                fingerprint: self.fingerprint.clone(),
            });

            if end == total {
                break;
            }
            start += step;
        }

        chunks
    }
}

/// Chunk `text` with the whitespace tokenizer
pub fn chunk(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    Ok(Chunker::new(max_tokens, overlap, TokenizerKind::Whitespace)?.chunk(document_id, text))
}

/// Number of chunks produced for `total_tokens` tokens
pub fn chunk_count(total_tokens: usize, max_tokens: usize, overlap: usize) -> usize {
    if total_tokens == 0 || max_tokens == 0 || overlap >= max_tokens {
        return 0;
    }
    if total_tokens <= max_tokens {
        return 1;
    }
    let step = max_tokens - overlap;
    1 + (total_tokens - max_tokens).div_ceil(step)
}

/// Rebuild the source text from an ordered chunk sequence
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut text = String::new();
    let mut covered: usize = 0;

    for chunk in chunks {
        let skip = covered.saturating_sub(chunk.byte_range.start);
        text.push_str(&chunk.content[skip.min(chunk.content.len())..]);
        covered = covered.max(chunk.byte_range.end);
    }

    text
}

fn fingerprint(max_tokens: usize, overlap: usize, tokenizer: TokenizerKind) -> String {
    let key = format!("{tokenizer}:{max_tokens}:{overlap}");
    let hash = Uuid::new_v5(&FINGERPRINT_NAMESPACE, key.as_bytes()).simple().to_string();
    hash[..8].to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Chunker::new(0, 0, TokenizerKind::Whitespace),
            Err(RagxError::InvalidConfig(_))
        ));
        assert!(matches!(
            Chunker::new(10, 10, TokenizerKind::Whitespace),
            Err(RagxError::InvalidConfig(_))
        ));
        assert!(Chunker::new(10, 9, TokenizerKind::Whitespace).is_ok());
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let chunks = chunk("doc", "", 10, 2).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_short_text_yields_one_chunk() {
        let chunks = chunk("doc", "just a few words", 10, 2).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "just a few words");
        assert_eq!(chunks[0].token_range, 0..4);
        assert_eq!(chunks[0].document_id, "doc");
    }

    #[test]
    fn test_windows_overlap_by_configured_tokens() {
        let text = "a b c d e f g h i j";
        let chunks = chunk("doc", text, 4, 1).unwrap();

        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["a b c d ", "d e f g ", "g h i j"]);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].token_range.end - pair[1].token_range.start, 1);
        }
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_thousand_char_example() {
        let text = "x".repeat(1000);
        let chunker = Chunker::new(100, 20, TokenizerKind::Char).unwrap();

        let first = chunker.chunk("doc", &text);
        let second = chunker.chunk("doc", &text);

        assert_eq!(first.len(), 13);
        assert_eq!(first.len(), chunk_count(1000, 100, 20));
        assert_eq!(first, second);
        assert_eq!(reassemble(&first), text);
    }

    #[test]
    fn test_reassemble_skips_overlapping_bytes() {
        let chunker = Chunker::new(3, 1, TokenizerKind::Whitespace).unwrap();
        let text = "one two three four five six";
        let chunks = chunker.chunk("doc", text);

        assert!(chunks.len() > 1);
        assert_eq!(reassemble(&chunks), text);
        assert_eq!(reassemble(&chunks[..1]), chunks[0].content);
        assert_eq!(reassemble(&[]), "");
    }

    #[test]
    fn test_chunk_ids_follow_configuration() {
        let a = Chunker::new(100, 20, TokenizerKind::Whitespace).unwrap();
        let b = Chunker::new(100, 20, TokenizerKind::Whitespace).unwrap();
        let c = Chunker::new(120, 20, TokenizerKind::Whitespace).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.chunk_id(3), format!("00003-{}", a.fingerprint()));
    }

    #[test]
    fn test_chunk_count_formula() {
        assert_eq!(chunk_count(0, 10, 2), 0);
        assert_eq!(chunk_count(10, 10, 2), 1);
        assert_eq!(chunk_count(11, 10, 2), 2);
        assert_eq!(chunk_count(18, 10, 2), 2);
        assert_eq!(chunk_count(19, 10, 2), 3);
    }

    proptest! {
        #[test]
        fn prop_chunks_reassemble_to_source(
            text in "\\PC{0,400}",
            max_tokens in 1usize..40,
            overlap_seed in 0usize..40,
            use_chars in any::<bool>(),
        ) {
            let overlap = overlap_seed % max_tokens;
            let kind = if use_chars { TokenizerKind::Char } else { TokenizerKind::Whitespace };
            let chunker = Chunker::new(max_tokens, overlap, kind).unwrap();
            let chunks = chunker.chunk("doc", &text);

            prop_assert_eq!(reassemble(&chunks), text.clone());
            prop_assert_eq!(chunks.len(), chunk_count(count_tokens(&text, kind), max_tokens, overlap));

            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.index as usize, i);
                prop_assert!(c.token_range.len() <= max_tokens);
                prop_assert_eq!(&text[c.byte_range.clone()], c.content.as_str());
            }
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].token_range.end - pair[1].token_range.start, overlap);
            }
        }
    }
}
