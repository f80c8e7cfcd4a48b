// ============================================================
// Layer 6 — Vocabulary Store
// ============================================================
// Resolves the --vocab argument to a Vocabulary:
//
//   AUTO    — load <vocab_root>/<dataset>.json if it exists,
//             otherwise build it from the training captions
//             and cache it there
//   REGEN   — always rebuild and overwrite the cache
//   <path>  — a .txt file (one token per line) or a .json file
//             (serialised Vocabulary)
//
// Build rule: count normalised tokens over all captions, keep
// words seen at least `threshold` times, most frequent first,
// ties in alphabetical order.

use anyhow::{bail, Context, Result};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::data::preprocessor::Preprocessor;
use crate::domain::caption::CaptionRecord;
use crate::domain::vocabulary::Vocabulary;

pub const DEFAULT_THRESHOLD: usize = 4;

pub struct VocabStore {
    root:      PathBuf,
    threshold: usize,
}

impl VocabStore {
    pub fn new(root: impl Into<PathBuf>, threshold: usize) -> Self {
        Self { root: root.into(), threshold }
    }

    /// Cache file of a dataset; '+' and path separators are kept
    /// out of the file name.
    pub fn cache_path(&self, dataset: &str) -> PathBuf {
        let name: String = dataset
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(format!("{name}.json"))
    }

    /// `records` is only called when the vocabulary has to be built.
    pub fn resolve<F>(&self, directive: &str, dataset: &str, records: F) -> Result<Vocabulary>
    where
        F: FnOnce() -> Result<Vec<CaptionRecord>>,
    {
        match directive {
            "AUTO" => {
                let path = self.cache_path(dataset);
                if path.exists() {
                    tracing::info!("Loading cached vocabulary from '{}'", path.display());
                    return load_vocab(&path);
                }
                self.build_and_save(dataset, &records()?)
            }
            "REGEN" => self.build_and_save(dataset, &records()?),
            path => load_vocab(Path::new(path)),
        }
    }

    fn build_and_save(&self, dataset: &str, records: &[CaptionRecord]) -> Result<Vocabulary> {
        let vocab = build_vocab(records, self.threshold);
        tracing::info!(
            "Built vocabulary of {} tokens from {} captions (threshold {})",
            vocab.len(),
            records.len(),
            self.threshold
        );
        let path = self.cache_path(dataset);
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Cannot create vocabulary directory '{}'", self.root.display()))?;
        fs::write(&path, serde_json::to_string_pretty(&vocab)?)
            .with_context(|| format!("Cannot write vocabulary to '{}'", path.display()))?;
        Ok(vocab)
    }
}

pub fn build_vocab(records: &[CaptionRecord], threshold: usize) -> Vocabulary {
    let pre = Preprocessor::new();
    let mut freq: HashMap<String, usize> = HashMap::new();
    for record in records {
        for word in pre.tokenize(&record.caption) {
            *freq.entry(word).or_insert(0) += 1;
        }
    }

    let mut words: Vec<(String, usize)> = freq.into_iter().filter(|(_, n)| *n >= threshold).collect();
    words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Vocabulary::from_words(words.into_iter().map(|(w, _)| w))
}

/// Load a `.txt` or `.json` vocabulary file.
pub fn load_vocab(path: &Path) -> Result<Vocabulary> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Cannot read vocabulary '{}'", path.display()))?;
    let vocab = match path.extension().and_then(|e| e.to_str()) {
        Some("txt") => Vocabulary::from_txt(&text)?,
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("Malformed vocabulary '{}'", path.display()))?,
        _ => bail!("unsupported vocabulary file '{}' (expected .txt or .json)", path.display()),
    };
    tracing::info!("Vocabulary '{}': {} tokens", path.display(), vocab.len());
    Ok(vocab)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(caption: &str) -> CaptionRecord {
        CaptionRecord { image_id: "1".into(), file: "1.jpg".into(), caption: caption.into() }
    }

    #[test]
    fn test_threshold_and_ordering() {
        let records = vec![
            record("A dog runs."),
            record("a dog sits"),
            record("a cat sits"),
            record("A bird"),
        ];
        let vocab = build_vocab(&records, 2);
        // reserved first, then a(4), then dog/sits(2) alphabetically
        assert_eq!(&vocab.words()[4..], ["a", "dog", "sits"]);
        assert!(!vocab.contains("cat"));
    }

    #[test]
    fn test_auto_builds_once_then_reads_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = VocabStore::new(dir.path(), 1);

        let built = store.resolve("AUTO", "coco", || Ok(vec![record("a man")])).unwrap();
        assert!(store.cache_path("coco").exists());

        let cached = store
            .resolve("AUTO", "coco", || panic!("captions should not be read again"))
            .unwrap();
        assert_eq!(built, cached);

        let regen = store.resolve("REGEN", "coco", || Ok(vec![record("a woman")])).unwrap();
        assert!(regen.contains("woman"));
        assert!(!regen.contains("man"));
    }

    #[test]
    fn test_explicit_txt_and_bad_extension() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("vocab.txt");
        fs::write(&txt, "<pad>\n<start>\n<end>\n<unk>\nhello\n").unwrap();
        let store = VocabStore::new(dir.path(), DEFAULT_THRESHOLD);

        let vocab = store.resolve(txt.to_str().unwrap(), "x", || unreachable!()).unwrap();
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.id("hello"), 4);

        let bad = dir.path().join("vocab.pkl");
        fs::write(&bad, "x").unwrap();
        assert!(load_vocab(&bad).is_err());
    }
}
