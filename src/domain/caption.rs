// ============================================================
// Layer 3 — Caption Records and Dataset Parameters
// ============================================================
// A CaptionRecord is one (image, caption) annotation as it
// appears in a dataset manifest. One image usually has several
// records. DatasetParams says where a named dataset lives.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionRecord {
    pub image_id: String,
    /// Image path relative to the dataset's image directory
    pub file:     String,
    pub caption:  String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetParams {
    #[serde(default)]
    pub name:         String,
    pub image_dir:    PathBuf,
    pub caption_file: PathBuf,
    /// Directory searched for relative external feature files
    #[serde(default)]
    pub features_dir: Option<PathBuf>,
}
