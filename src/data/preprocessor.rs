// ============================================================
// Layer 4 — Caption Preprocessor
// ============================================================
// Turns raw caption strings into token id sequences.
//
// Caption text in the wild carries:
//   - mixed case ("A Man", "a man")
//   - punctuation glued to words ("beach.")
//   - stray whitespace and control characters
//
// Cleaning steps (applied in order):
//   1. Replace control/odd whitespace characters with a space
//   2. Lowercase
//   3. Split on anything that is not alphanumeric or an apostrophe
//   4. Drop empty tokens
//
// Encoding wraps the tokens as <start> w1 .. wn <end> and maps
// words outside the vocabulary to <unk>.
//
// Reference: Rust Book §8 (Strings in Rust)
//            Rust Book §13 (Iterators)

use crate::domain::vocabulary::Vocabulary;

pub struct Preprocessor;

impl Preprocessor {
    pub fn new() -> Self {
        Self
    }

    /// Normalise a caption string: single spaces, no control characters.
    pub fn clean(&self, text: &str) -> String {
        let mapped: String = text
            .chars()
            .map(|c| match c {
                '\u{00A0}' | '\u{200B}' | '\u{FEFF}' => ' ',
                c if c.is_control() => ' ',
                c => c,
            })
            .collect();
        mapped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Lowercased word tokens of a caption.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.clean(text)
            .to_lowercase()
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .map(|t| t.trim_matches('\''))
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// `<start> tokens.. <end>` as vocabulary ids.
    pub fn encode(&self, text: &str, vocab: &Vocabulary) -> Vec<usize> {
        let tokens = self.tokenize(text);
        let mut ids = Vec::with_capacity(tokens.len() + 2);
        ids.push(vocab.start_id());
        ids.extend(tokens.iter().map(|t| vocab.id(t)));
        ids.push(vocab.end_id());
        ids
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}
