// ============================================================
// Layer 3 — Vocabulary
// ============================================================
// Bidirectional mapping between caption tokens and integer ids.
//
// Reserved tokens always occupy the first four ids:
//   0 <pad>   1 <start>   2 <end>   3 <unk>
//
// The vocabulary is serialised as a plain word list; the
// reverse index is rebuilt on load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::error::CaptionError;

pub const PAD: &str = "<pad>";
pub const START: &str = "<start>";
pub const END: &str = "<end>";
pub const UNK: &str = "<unk>";

pub const RESERVED: [&str; 4] = [PAD, START, END, UNK];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "VocabularyFile", into = "VocabularyFile")]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct VocabularyFile {
    words: Vec<String>,
}

impl From<VocabularyFile> for Vocabulary {
    fn from(file: VocabularyFile) -> Self {
        Vocabulary::from_words(file.words)
    }
}

impl From<Vocabulary> for VocabularyFile {
    fn from(vocab: Vocabulary) -> Self {
        VocabularyFile { words: vocab.words }
    }
}

impl PartialEq for Vocabulary {
    fn eq(&self, other: &Self) -> bool {
        self.words == other.words
    }
}

impl Vocabulary {
    /// Build a vocabulary from a word list. Reserved tokens are
    /// placed first; duplicates are dropped.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Vocabulary { words: Vec::new(), index: HashMap::new() };
        for w in RESERVED {
            vocab.add_word(w);
        }
        for w in words {
            vocab.add_word(w);
        }
        vocab
    }

    pub fn add_word(&mut self, word: impl Into<String>) -> usize {
        let word = word.into();
        if let Some(&id) = self.index.get(&word) {
            return id;
        }
        let id = self.words.len();
        self.index.insert(word.clone(), id);
        self.words.push(word);
        id
    }

    /// Parse the plain-text format: one token per line.
    pub fn from_txt(text: &str) -> Result<Self, CaptionError> {
        let words: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if words.is_empty() {
            return Err(CaptionError::Vocabulary("vocabulary file is empty".into()));
        }
        Ok(Vocabulary::from_words(words))
    }

    /// Id of `word`, falling back to `<unk>`.
    pub fn id(&self, word: &str) -> usize {
        self.index.get(word).copied().unwrap_or_else(|| self.unk_id())
    }

    pub fn word(&self, id: usize) -> Option<&str> {
        self.words.get(id).map(String::as_str)
    }

    #[cfg(test)]
    pub fn contains(&self, word: &str) -> bool {
        self.index.contains_key(word)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn pad_id(&self) -> usize { 0 }
    pub fn start_id(&self) -> usize { 1 }
    pub fn end_id(&self) -> usize { 2 }
    pub fn unk_id(&self) -> usize { 3 }

    #[cfg(test)]
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Turn a generated or ground-truth id sequence into text.
    /// `<start>` and `<pad>` are skipped, the first `<end>` stops.
    pub fn ids_to_caption(&self, ids: &[usize]) -> String {
        let mut out: Vec<&str> = Vec::new();
        for &id in ids {
            if id == self.end_id() {
                break;
            }
            if id == self.start_id() || id == self.pad_id() {
                continue;
            }
            out.push(self.word(id).unwrap_or(UNK));
        }
        out.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids_are_fixed() {
        let v = Vocabulary::from_words(["a", "dog"]);
        assert_eq!(v.id(PAD), 0);
        assert_eq!(v.id(START), 1);
        assert_eq!(v.id(END), 2);
        assert_eq!(v.id(UNK), 3);
        assert_eq!(v.id("a"), 4);
        assert_eq!(v.len(), 6);
    }

    #[test]
    fn test_unknown_word_maps_to_unk() {
        let v = Vocabulary::from_words(["cat"]);
        assert_eq!(v.id("zebra"), v.unk_id());
        assert!(!v.contains("zebra"));
    }

    #[test]
    fn test_txt_with_reserved_tokens_does_not_duplicate() {
        let v = Vocabulary::from_txt("<pad>\n<start>\n<end>\n<unk>\nman\nriding\n").unwrap();
        assert_eq!(v.len(), 6);
        assert_eq!(v.word(5), Some("riding"));
        assert!(Vocabulary::from_txt("\n\n").is_err());
    }

    #[test]
    fn test_ids_to_caption_stops_at_end() {
        let v = Vocabulary::from_words(["a", "man", "surfing"]);
        let ids = vec![1, 4, 5, 6, 2, 4, 0];
        assert_eq!(v.ids_to_caption(&ids), "a man surfing");
    }

    #[test]
    fn test_json_rebuilds_index() {
        let v = Vocabulary::from_words(["kite", "beach"]);
        let json = serde_json::to_string(&v).unwrap();
        let back: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        assert_eq!(back.id("beach"), 5);
    }
}
