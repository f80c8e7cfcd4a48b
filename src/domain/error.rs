// ============================================================
// Layer 3 — Domain Errors
// ============================================================
// Typed failures the rest of the system can match on.
//
// Construction-time problems (bad backbone name, malformed
// feature grid) and configuration problems are fatal and are
// reported before anything is written to disk. Plumbing
// errors (file I/O, JSON) stay in anyhow and carry context.
//
// Reference: thiserror crate documentation
//            Rust Book §9 (Error Handling)

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptionError {
    /// Missing or contradictory run settings
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown backbone '{0}'")]
    UnknownBackbone(String),

    /// The name is recognised but no implementation ships with this build
    #[error("backbone '{0}' is not available in this build")]
    BackboneUnavailable(String),

    #[error("invalid feature shape: {0}")]
    InvalidFeatureShape(String),

    #[error("unsupported teacher forcing policy '{0}' (expected always, sampled, additive or additive_sampled)")]
    UnsupportedForcingPolicy(String),

    #[error("greedy sampling is not supported by the {0} decoder")]
    SamplingUnsupported(String),

    #[error("unknown scorer '{0}'")]
    UnknownScorer(String),

    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    #[error("dataset error: {0}")]
    Dataset(String),
}

impl CaptionError {
    pub fn config(msg: impl Into<String>) -> Self {
        CaptionError::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let e = CaptionError::UnknownBackbone("resnet9000".into());
        assert_eq!(e.to_string(), "unknown backbone 'resnet9000'");

        let e = CaptionError::config("no dataset selected");
        assert!(e.to_string().contains("no dataset selected"));
    }
}
