//! Loudness estimation used by `match_loudness` and `crossfade`.
//!
//! The engine only ships a cheap RMS estimator; everything else is a
//! pluggable analyzer, with the caller able to fall back to RMS if a
//! custom one reports it can't handle a given source.

/// Loudness-matching method requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoudnessMethod {
    Rms,
    Peak,
    /// Simplified LUFS approximation.
    Lufs,
    AWeighted,
    Matchering,
}

/// A pluggable loudness analyzer. Implementations beyond RMS are expected
/// to be supplied by the host application (e.g. a real LUFS/ITU-R
/// BS.1770 implementation, or a binding to Matchering); the engine falls
/// back to [`RmsAnalyzer`] when no plug-in is registered for the
/// requested method.
pub trait LoudnessAnalyzer: Send + Sync {
    fn method(&self) -> LoudnessMethod;
    fn analyze(&self, samples: &[f32], channels: usize) -> f32;
}

/// Built-in RMS analyzer — always available, used as the fallback for
/// every method without a registered plug-in.
#[derive(Debug, Default, Clone, Copy)]
pub struct RmsAnalyzer;

impl LoudnessAnalyzer for RmsAnalyzer {
    fn method(&self) -> LoudnessMethod {
        LoudnessMethod::Rms
    }

    fn analyze(&self, samples: &[f32], _channels: usize) -> f32 {
        rms(samples)
    }
}

/// Built-in peak analyzer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeakAnalyzer;

impl LoudnessAnalyzer for PeakAnalyzer {
    fn method(&self) -> LoudnessMethod {
        LoudnessMethod::Peak
    }

    fn analyze(&self, samples: &[f32], _channels: usize) -> f32 {
        peak(samples)
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    ((sum_sq / samples.len() as f64).sqrt()) as f32
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

/// Registry of optional analyzers consulted by `match_loudness`; falls
/// back to RMS when the requested method has no registered plug-in.
#[derive(Default)]
pub struct LoudnessRegistry {
    plugins: Vec<Box<dyn LoudnessAnalyzer>>,
}

impl LoudnessRegistry {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn register(&mut self, analyzer: Box<dyn LoudnessAnalyzer>) {
        self.plugins.push(analyzer);
    }

    fn analyzer_for(&self, method: LoudnessMethod) -> &dyn LoudnessAnalyzer {
        self.plugins
            .iter()
            .find(|p| p.method() == method)
            .map(|b| b.as_ref())
            .unwrap_or(&RmsAnalyzer)
    }

    /// Compute `(vol_a, vol_b)` gains such that both tracks reach `target`
    /// loudness under `method`, falling back to RMS when `method` has no
    /// registered analyzer.
    pub fn match_loudness(
        &self,
        a: &[f32],
        a_channels: usize,
        b: &[f32],
        b_channels: usize,
        target: f32,
        method: LoudnessMethod,
    ) -> (f32, f32) {
        let analyzer = self.analyzer_for(method);
        let level_a = analyzer.analyze(a, a_channels).max(1e-6);
        let level_b = analyzer.analyze(b, b_channels).max(1e-6);
        (target / level_a, target / level_b)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn rms_of_unit_sine_is_sqrt2_over_2() {
        let n = 1024;
        let samples: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * i as f32 / 64.0).sin())
            .collect();
        let r = rms(&samples);
        assert_abs_diff_eq!(r, std::f32::consts::FRAC_1_SQRT_2, epsilon = 0.01);
    }

    #[test]
    fn unknown_method_falls_back_to_rms() {
        let reg = LoudnessRegistry::new();
        let a = vec![1.0f32; 100];
        let b = vec![0.5f32; 100];
        let (va, vb) = reg.match_loudness(&a, 1, &b, 1, 0.5, LoudnessMethod::Lufs);
        assert_abs_diff_eq!(va, 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(vb, 1.0, epsilon = 1e-3);
    }
}
