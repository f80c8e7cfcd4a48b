// ============================================================
// Layer 3 — Teacher Forcing Policies and Schedule
// ============================================================
// During training the decoder input for step t+1 is either the
// ground-truth token, the model's own prediction, or a blend of
// both. Which one is decided here, independently of any tensor
// code, so the policy arithmetic can be tested on its own.
//
// The probability of using ground truth decays with the global
// iteration index following the inverse sigmoid schedule of
// Bengio et al. (2015), "Scheduled Sampling":
//
//   p(i) = k / (k + exp(i * beta / k))
//
// k = 0 disables the schedule (p = 1, pure teacher forcing).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::domain::error::CaptionError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcingPolicy {
    #[default]
    Always,
    Sampled,
    Additive,
    AdditiveSampled,
}

/// What the decoder should feed at the next step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepInput {
    GroundTruth,
    Predicted,
    /// `w * ground_truth + (1 - w) * predicted`
    Blend(f64),
}

impl ForcingPolicy {
    /// Choose the next-step input. `rng` is consulted at most once,
    /// and only by the sampled policies.
    pub fn select<R: Rng + ?Sized>(&self, teacher_p: f64, rng: &mut R) -> StepInput {
        match self {
            ForcingPolicy::Always => StepInput::GroundTruth,
            ForcingPolicy::Sampled => {
                if rng.gen::<f64>() < teacher_p {
                    StepInput::GroundTruth
                } else {
                    StepInput::Predicted
                }
            }
            ForcingPolicy::Additive => StepInput::Blend(teacher_p),
            ForcingPolicy::AdditiveSampled => {
                if rng.gen::<f64>() < teacher_p {
                    StepInput::GroundTruth
                } else {
                    StepInput::Blend(teacher_p)
                }
            }
        }
    }
}

impl FromStr for ForcingPolicy {
    type Err = CaptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(ForcingPolicy::Always),
            "sampled" => Ok(ForcingPolicy::Sampled),
            "additive" => Ok(ForcingPolicy::Additive),
            "additive_sampled" => Ok(ForcingPolicy::AdditiveSampled),
            other => Err(CaptionError::UnsupportedForcingPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for ForcingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForcingPolicy::Always => "always",
            ForcingPolicy::Sampled => "sampled",
            ForcingPolicy::Additive => "additive",
            ForcingPolicy::AdditiveSampled => "additive_sampled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForcingSchedule {
    pub k:    f64,
    pub beta: f64,
}

impl Default for ForcingSchedule {
    fn default() -> Self {
        Self { k: 6500.0, beta: 1.0 }
    }
}

impl ForcingSchedule {
    pub fn new(k: f64, beta: f64) -> Self {
        Self { k, beta }
    }

    /// Probability of feeding ground truth at global iteration `i`.
    pub fn teacher_prob(&self, i: usize) -> f64 {
        if self.k == 0.0 {
            return 1.0;
        }
        let x = i as f64 * self.beta;
        self.k / (self.k + (x / self.k).exp())
    }
}
