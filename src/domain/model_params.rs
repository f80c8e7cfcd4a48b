// ============================================================
// Layer 3 — Model Parameters
// ============================================================
// Architecture-level settings of a captioning model.
// Built once per run from the CLI, stored inside every
// checkpoint, and restored from the checkpoint on resume.
// Only the external feature paths may change afterwards.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::domain::error::CaptionError;
use crate::domain::feature_spec::FeatureSpec;
use crate::domain::vocabulary::Vocabulary;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionKind {
    #[default]
    None,
    Spatial,
    Soft,
}

impl AttentionKind {
    pub fn is_attention(&self) -> bool {
        !matches!(self, AttentionKind::None)
    }

    /// Name of the decoder variant, as used in messages.
    pub fn decoder_name(&self) -> &'static str {
        match self {
            AttentionKind::None => "plain",
            AttentionKind::Spatial => "spatial",
            AttentionKind::Soft => "soft attention",
        }
    }
}

impl FromStr for AttentionKind {
    type Err = CaptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(AttentionKind::None),
            "spatial" => Ok(AttentionKind::Spatial),
            "soft" => Ok(AttentionKind::Soft),
            other => Err(CaptionError::config(format!(
                "invalid attention model '{other}' (expected none, spatial or soft)"
            ))),
        }
    }
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttentionKind::None => "none",
            AttentionKind::Spatial => "spatial",
            AttentionKind::Soft => "soft",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub embed_size:       usize,
    pub hidden_size:      usize,
    pub num_layers:       usize,
    pub batch_size:       usize,
    pub learning_rate:    f64,
    pub dropout:          f64,
    pub encoder_dropout:  f64,
    pub features:         FeatureSpec,
    pub persist_features: FeatureSpec,
    pub attention:        AttentionKind,
    pub vocab:            Option<Vocabulary>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            embed_size:       256,
            hidden_size:      512,
            num_layers:       1,
            batch_size:       128,
            learning_rate:    0.001,
            dropout:          0.0,
            encoder_dropout:  0.0,
            features:         FeatureSpec::parse("resnet152"),
            persist_features: FeatureSpec::default(),
            attention:        AttentionKind::None,
            vocab:            None,
        }
    }
}

impl ModelParams {
    pub fn has_persist_features(&self) -> bool {
        !self.persist_features.is_empty()
    }

    pub fn has_internal_features(&self) -> bool {
        !self.features.internal.is_empty() || !self.persist_features.internal.is_empty()
    }

    /// The plain and spatial decoders start from encoded `features`.
    pub fn check_encoder_features(&self) -> Result<(), CaptionError> {
        if self.attention != AttentionKind::Soft && self.features.is_empty() {
            return Err(CaptionError::config(format!(
                "the {} decoder needs encoder features, --features is empty",
                self.attention.decoder_name()
            )));
        }
        Ok(())
    }

    /// Replace the external entries of `features`, keeping the backbones.
    pub fn update_ext_features(&mut self, external: Vec<String>) {
        self.features.external = external;
    }

    pub fn update_ext_persist_features(&mut self, external: Vec<String>) {
        self.persist_features.external = external;
    }
}

impl fmt::Display for ModelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[ModelParams] embed_size={}", self.embed_size)?;
        writeln!(f, "[ModelParams] hidden_size={}", self.hidden_size)?;
        writeln!(f, "[ModelParams] num_layers={}", self.num_layers)?;
        writeln!(f, "[ModelParams] batch_size={}", self.batch_size)?;
        writeln!(f, "[ModelParams] learning_rate={}", self.learning_rate)?;
        writeln!(f, "[ModelParams] dropout={}", self.dropout)?;
        writeln!(f, "[ModelParams] encoder_dropout={}", self.encoder_dropout)?;
        writeln!(f, "[ModelParams] features={}", self.features)?;
        writeln!(f, "[ModelParams] persist_features={}", self.persist_features)?;
        writeln!(f, "[ModelParams] attention={}", self.attention)?;
        match &self.vocab {
            Some(v) => write!(f, "[ModelParams] vocab=<{} tokens>", v.len()),
            None => write!(f, "[ModelParams] vocab=None"),
        }
    }
}
