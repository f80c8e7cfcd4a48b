use anyhow::Result;
use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::data::features::{load_feature_set, FeatureStore, FeatureTable};
use crate::data::loader::ManifestSource;
use crate::data::preprocessor::Preprocessor;
use crate::domain::caption::DatasetParams;
use crate::domain::error::CaptionError;
use crate::domain::model_params::ModelParams;
use crate::domain::traits::CaptionSource;
use crate::domain::vocabulary::Vocabulary;

/// One caption of one image, already encoded as vocabulary ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionSample {
    pub image_id:    String,
    pub image_path:  PathBuf,
    /// `<start> .. <end>`
    pub caption:     Vec<usize>,
    /// Row in the external feature tables
    pub feature_row: usize,
}

#[derive(Debug)]
pub struct CaptionDataset {
    samples: Vec<CaptionSample>,
}

impl CaptionDataset {
    pub fn new(samples: Vec<CaptionSample>) -> Self { Self { samples } }

    pub fn samples(&self) -> &[CaptionSample] { &self.samples }
}

impl Dataset<CaptionSample> for CaptionDataset {
    fn get(&self, index: usize) -> Option<CaptionSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Load every dataset named in `params` and the external features
/// requested by the model, as one combined dataset.
pub fn build_dataset(
    params:       &[DatasetParams],
    vocab:        &Vocabulary,
    model_params: &ModelParams,
) -> Result<(CaptionDataset, FeatureStore)> {
    let pre = Preprocessor::new();
    let mut samples = Vec::new();
    let mut init: Option<FeatureTable> = None;
    let mut persist: Option<FeatureTable> = None;
    let mut row_offset = 0usize;

    for p in params {
        let records = ManifestSource::new(&p.caption_file).load_records()?;

        let mut image_rows: HashMap<String, usize> = HashMap::new();
        for r in &records {
            let next = image_rows.len();
            let local = *image_rows.entry(r.image_id.clone()).or_insert(next);
            samples.push(CaptionSample {
                image_id:    r.image_id.clone(),
                image_path:  p.image_dir.join(&r.file),
                caption:     pre.encode(&r.caption, vocab),
                feature_row: row_offset + local,
            });
        }

        if model_params.has_internal_features() {
            check_images(&samples[samples.len() - records.len()..])?;
        }

        let dir = p.features_dir.as_deref();
        let part_init = load_feature_set(&model_params.features.external, dir)?.map(FeatureTable::into_flat);
        let part_persist = load_feature_set(&model_params.persist_features.external, dir)?;

        for table in part_init.iter().chain(part_persist.iter()) {
            if table.rows() < image_rows.len() {
                return Err(CaptionError::Dataset(format!(
                    "dataset '{}' has {} images but its external features only {} rows",
                    p.name,
                    image_rows.len(),
                    table.rows()
                ))
                .into());
            }
        }

        // Feature rows of later datasets start after this one's.
        let rows = part_init
            .as_ref()
            .or(part_persist.as_ref())
            .map_or(image_rows.len(), FeatureTable::rows);
        init = append(init, part_init)?;
        persist = append(persist, part_persist)?;
        tracing::info!("Dataset '{}': {} captions of {} images", p.name, records.len(), image_rows.len());
        row_offset += rows;
    }

    let store = FeatureStore { init: init.map(Arc::new), persist: persist.map(Arc::new) };
    Ok((CaptionDataset::new(samples), store))
}

/// Every image a backbone will decode must exist and carry a
/// readable header.
fn check_images(samples: &[CaptionSample]) -> Result<(), CaptionError> {
    let mut checked: HashSet<&Path> = HashSet::new();
    for s in samples {
        if !checked.insert(&s.image_path) {
            continue;
        }
        image::image_dimensions(&s.image_path).map_err(|e| {
            CaptionError::Dataset(format!(
                "image '{}' of '{}' cannot be read: {e}",
                s.image_path.display(),
                s.image_id
            ))
        })?;
    }
    Ok(())
}

fn append(acc: Option<FeatureTable>, part: Option<FeatureTable>) -> Result<Option<FeatureTable>> {
    match (acc, part) {
        (Some(a), Some(b)) => a.append_rows(b).map(Some),
        (a, b) => Ok(a.or(b)),
    }
}

/// Word and `<unk>` statistics of the encoded captions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VocabCoverage {
    pub captions:          usize,
    pub words:             usize,
    pub min_words:         usize,
    pub max_words:         usize,
    pub unk_tokens:        usize,
    pub captions_with_unk: usize,
}

impl VocabCoverage {
    pub fn measure(samples: &[CaptionSample], vocab: &Vocabulary) -> Self {
        let mut c = VocabCoverage { min_words: usize::MAX, ..Default::default() };
        for s in samples {
            let words = s.caption.iter().filter(|&&id| id > vocab.unk_id()).count();
            let unks = s.caption.iter().filter(|&&id| id == vocab.unk_id()).count();
            c.captions += 1;
            c.words += words;
            c.min_words = c.min_words.min(words);
            c.max_words = c.max_words.max(words);
            c.unk_tokens += unks;
            c.captions_with_unk += usize::from(unks > 0);
        }
        if c.captions == 0 {
            c.min_words = 0;
        }
        c
    }

    pub fn summary(&self) -> String {
        let pct = |a: usize, b: usize| if b == 0 { 0.0 } else { 100.0 * a as f64 / b as f64 };
        let avg = if self.captions == 0 { 0.0 } else { self.words as f64 / self.captions as f64 };
        format!(
            "Training data contains {} words in {} captions (avg. {:.1} w/c) with {} <unk>s ({:.1}%) in {} ({:.1}%) captions",
            self.words,
            self.captions,
            avg,
            self.unk_tokens,
            pct(self.unk_tokens, self.words),
            self.captions_with_unk,
            pct(self.captions_with_unk, self.captions),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::features::tests::write_npy;
    use crate::domain::feature_spec::FeatureSpec;
    use std::{fs, path::Path};

    fn write_split(dir: &Path, name: &str, captions: &[(&str, &str)]) -> DatasetParams {
        let records: Vec<_> = captions
            .iter()
            .map(|(id, c)| serde_json::json!({"image_id": id, "file": format!("{id}.jpg"), "caption": c}))
            .collect();
        let file = dir.join(format!("{name}.json"));
        fs::write(&file, serde_json::to_string(&records).unwrap()).unwrap();
        DatasetParams {
            name:         name.to_string(),
            image_dir:    dir.join("img"),
            caption_file: file,
            features_dir: Some(dir.to_path_buf()),
        }
    }

    fn vocab() -> Vocabulary {
        Vocabulary::from_words(["a", "dog", "cat"])
    }

    /// A model without backbones, so no image is opened.
    fn featureless() -> ModelParams {
        ModelParams { features: FeatureSpec::default(), ..Default::default() }
    }

    #[test]
    fn test_rows_follow_first_appearance() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_split(dir.path(), "s", &[("7", "a dog"), ("3", "a cat"), ("7", "dog")]);
        let (ds, store) = build_dataset(&[p], &vocab(), &featureless()).unwrap();

        assert_eq!(ds.len(), 3);
        let rows: Vec<_> = ds.samples().iter().map(|s| s.feature_row).collect();
        assert_eq!(rows, vec![0, 1, 0]);
        assert!(store.init.is_none());
        assert_eq!(ds.get(0).unwrap().image_path, dir.path().join("img").join("7.jpg"));
    }

    #[test]
    fn test_combined_datasets_offset_feature_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_npy(&dir.path().join("f.npy"), &[2, 1], &[0.5, 1.5]);
        let a = write_split(dir.path(), "a", &[("1", "a dog"), ("2", "a cat")]);
        let b = write_split(dir.path(), "b", &[("9", "a dog")]);

        let params = ModelParams { features: FeatureSpec::parse("f.npy"), ..Default::default() };
        let (ds, store) = build_dataset(&[a, b], &vocab(), &params).unwrap();

        assert_eq!(ds.samples()[2].feature_row, 2);
        let init = store.init.unwrap();
        assert_eq!(init.rows(), 4);
        assert_eq!(init.row(2).unwrap(), &[0.5]);
    }

    #[test]
    fn test_too_few_feature_rows_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_npy(&dir.path().join("f.npy"), &[1, 1], &[0.5]);
        let a = write_split(dir.path(), "a", &[("1", "a dog"), ("2", "a cat")]);
        let params = ModelParams { features: FeatureSpec::parse("f.npy"), ..Default::default() };
        assert!(build_dataset(&[a], &vocab(), &params).is_err());
    }

    #[test]
    fn test_backbone_needs_every_image() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_split(dir.path(), "s", &[("1", "a dog"), ("2", "a cat"), ("1", "dog")]);
        fs::create_dir_all(&p.image_dir).unwrap();
        image::RgbImage::new(4, 4).save(p.image_dir.join("1.jpg")).unwrap();
        fs::write(p.image_dir.join("2.jpg"), b"not an image").unwrap();

        let params = ModelParams::default();
        let err = build_dataset(&[p.clone()], &vocab(), &params).unwrap_err();
        assert!(matches!(err.downcast_ref::<CaptionError>(), Some(CaptionError::Dataset(_))));
        assert!(err.to_string().contains("2.jpg"));

        image::RgbImage::new(4, 4).save(p.image_dir.join("2.jpg")).unwrap();
        let (ds, _) = build_dataset(&[p.clone()], &vocab(), &params).unwrap();
        assert_eq!(ds.len(), 3);

        fs::remove_file(p.image_dir.join("1.jpg")).unwrap();
        assert!(build_dataset(&[p], &vocab(), &params).is_err());
    }

    #[test]
    fn test_coverage_counts_unknown_words() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_split(dir.path(), "s", &[("1", "a dog"), ("2", "a zebra runs")]);
        let (ds, _) = build_dataset(&[p], &vocab(), &featureless()).unwrap();

        let c = VocabCoverage::measure(ds.samples(), &vocab());
        assert_eq!(c.captions, 2);
        assert_eq!(c.words, 3);
        assert_eq!(c.unk_tokens, 2);
        assert_eq!(c.captions_with_unk, 1);
        assert_eq!((c.min_words, c.max_words), (1, 2));
        assert!(c.summary().contains("2 captions"));
    }
}
