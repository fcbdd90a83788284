//! Tokenizers for the chunker
//!
//! A tokenizer returns the byte offset where each token starts. Token `i`
//! spans `starts[i]..starts[i + 1]` (or to the end of the text), so the
//! tokens of a text always tile it exactly.

use ragx_core::TokenizerKind;

/// Byte offsets of token starts in `text`
pub fn token_starts(text: &str, kind: TokenizerKind) -> Vec<usize> {
    match kind {
        TokenizerKind::Whitespace => whitespace_starts(text),
        TokenizerKind::Char => text.char_indices().map(|(i, _)| i).collect(),
    }
}

/// Number of tokens in `text`
pub fn count_tokens(text: &str, kind: TokenizerKind) -> usize {
    token_starts(text, kind).len()
}

// A token is a word followed by its trailing whitespace. Leading whitespace
// belongs to the first token; whitespace-only text is a single token.
fn whitespace_starts(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut prev_is_space = true;

    for (i, c) in text.char_indices() {
        let is_space = c.is_whitespace();
        if !is_space && prev_is_space {
            starts.push(i);
        }
        prev_is_space = is_space;
    }

    match starts.first_mut() {
        Some(first) => *first = 0,
        None if !text.is_empty() => starts.push(0),
        None => {}
    }

    starts
}
