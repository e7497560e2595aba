use serde::{Deserialize, Serialize};

/// Posterior recorded at a logging point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PosteriorSample {
    /// Sample number.
    pub sample: i64,
    /// Log posterior after the sample.
    pub posterior: f64,
}

/// Collects posterior samples and summarises mixing.
#[derive(Debug, Default)]
pub struct PosteriorRecorder {
    samples: Vec<PosteriorSample>,
}

impl PosteriorRecorder {
    /// Creates a new recorder instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sample.
    pub fn push(&mut self, sample: i64, posterior: f64) {
        self.samples.push(PosteriorSample { sample, posterior });
    }

    /// Returns an immutable view over the recorded samples.
    pub fn samples(&self) -> &[PosteriorSample] {
        &self.samples
    }

    /// Mean log posterior, zero when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.posterior).sum::<f64>() / self.samples.len() as f64
    }

    /// Crude effective sample size of the posterior trace: `n / (1 + 2 sum
    /// rho_k)` with the sum stopped at the first non-positive autocorrelation.
    pub fn effective_sample_size(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return n as f64;
        }
        let mean = self.mean();
        let centred: Vec<f64> = self.samples.iter().map(|s| s.posterior - mean).collect();
        let variance = centred.iter().map(|c| c * c).sum::<f64>() / n as f64;
        if !(variance > 0.0) {
            return n as f64;
        }
        let mut rho_sum = 0.0;
        for lag in 1..n / 2 {
            let rho = centred
                .iter()
                .zip(&centred[lag..])
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / (n as f64 * variance);
            if rho <= 0.0 {
                break;
            }
            rho_sum += rho;
        }
        n as f64 / (1.0 + 2.0 * rho_sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternating_trace_keeps_full_size() {
        let mut recorder = PosteriorRecorder::new();
        for i in 0..100 {
            recorder.push(i, if i % 2 == 0 { 1.0 } else { -1.0 });
        }
        assert_eq!(recorder.effective_sample_size(), 100.0);
    }

    #[test]
    fn sticky_trace_has_small_ess() {
        let mut recorder = PosteriorRecorder::new();
        for i in 0..100 {
            recorder.push(i, if i < 50 { 1.0 } else { -1.0 });
        }
        assert!(recorder.effective_sample_size() < 10.0);
    }
}
