//! Plateau learning-rate scheduler.
//!
//! Burn's schedulers are functions of the iteration count; this one
//! reacts to the validation loss instead. Mode is "min" with a
//! relative threshold: a loss counts as an improvement only when it
//! is below `best * (1 - threshold)`.

/// Multiply the learning rate by `factor` once the monitored loss has
/// not improved for more than `patience` consecutive validations.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceLrOnPlateau {
    lr:        f64,
    factor:    f64,
    patience:  usize,
    threshold: f64,
    min_lr:    f64,
    eps:       f64,
    best:      f64,
    bad_steps: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            factor:    0.1,
            patience:  2,
            threshold: 1e-4,
            min_lr:    0.0,
            eps:       1e-8,
            best:      f64::INFINITY,
            bad_steps: 0,
        }
    }

    #[cfg(test)]
    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    #[cfg(test)]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Feed one validation loss; returns the learning rate to use next.
    pub fn step(&mut self, loss: f64) -> f64 {
        if loss < self.best * (1.0 - self.threshold) {
            self.best = loss;
            self.bad_steps = 0;
        } else {
            self.bad_steps += 1;
        }

        if self.bad_steps > self.patience {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            if self.lr - reduced > self.eps {
                tracing::info!("Reducing learning rate from {:.3e} to {:.3e}", self.lr, reduced);
                self.lr = reduced;
            }
            self.bad_steps = 0;
        }
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduces_after_patience_is_exceeded() {
        let mut s = ReduceLrOnPlateau::new(0.1);
        assert_eq!(s.step(1.0), 0.1);
        // two bad epochs are tolerated
        assert_eq!(s.step(1.0), 0.1);
        assert_eq!(s.step(1.0), 0.1);
        let lr = s.step(1.0);
        assert!((lr - 0.01).abs() < 1e-12);
        // counter restarts after a reduction
        assert!((s.step(1.0) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_improvement_resets_patience() {
        let mut s = ReduceLrOnPlateau::new(0.1).with_patience(1);
        s.step(1.0);
        s.step(1.0);
        s.step(0.5);
        assert_eq!(s.step(0.5), 0.1);
    }

    #[test]
    fn test_tiny_improvement_is_not_enough() {
        let mut s = ReduceLrOnPlateau::new(1.0).with_patience(0).with_factor(0.5);
        s.step(1.0);
        // within the relative threshold of the best value
        assert_eq!(s.step(0.99995), 0.5);
    }
}
