//! The Laplace mechanism.
//!
//! A poisoned generator lock fails closed: no value is released.

use super::{Error, Result};
use rand::{distributions::Distribution, rngs::StdRng, SeedableRng};
use statrs::distribution::Laplace;
use std::sync::Mutex;

/// Laplace noise scale for a given sensitivity and epsilon
pub fn laplace_scale(sensitivity: f64, epsilon: f64) -> f64 {
    sensitivity / epsilon
}

#[derive(Debug)]
pub struct LaplaceMechanism {
    rng: Mutex<StdRng>,
}

impl LaplaceMechanism {
    /// A mechanism seeded from the operating system
    pub fn new() -> Self {
        LaplaceMechanism {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// A reproducible mechanism, for tests and replays
    pub fn seeded(seed: u64) -> Self {
        LaplaceMechanism {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// One draw of Laplace(0, scale)
    pub fn sample(&self, scale: f64) -> Result<f64> {
        let distribution = Laplace::new(0., scale).map_err(Error::other)?;
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::other("the noise generator is unavailable"))?;
        Ok(distribution.sample(&mut *rng))
    }

    /// `value` plus Laplace(0, sensitivity / epsilon) noise
    pub fn add_noise(&self, value: f64, sensitivity: f64, epsilon: f64) -> Result<f64> {
        if !(epsilon.is_finite() && epsilon > 0.) {
            return Err(Error::InvalidEpsilon(epsilon));
        }
        if !(sensitivity.is_finite() && sensitivity >= 0.) {
            return Err(Error::InvalidSensitivity(sensitivity));
        }
        if sensitivity == 0. {
            return Ok(value);
        }
        Ok(value + self.sample(laplace_scale(sensitivity, epsilon))?)
    }
}

impl Default for LaplaceMechanism {
    fn default() -> Self {
        LaplaceMechanism::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statrs::distribution::ContinuousCDF;

    /// Asymptotic Kolmogorov distribution tail, P(K > lambda)
    fn kolmogorov_p_value(lambda: f64) -> f64 {
        // The series converges slowly near 0, where the tail is 1 anyway
        if lambda < 0.2 {
            return 1.;
        }
        let p: f64 = (1..=100)
            .map(|k| {
                let k = k as f64;
                let sign = if k as i64 % 2 == 1 { 1. } else { -1. };
                2. * sign * (-2. * k * k * lambda * lambda).exp()
            })
            .sum();
        p.clamp(0., 1.)
    }

    /// One-sample Kolmogorov-Smirnov test against a Laplace CDF
    fn ks_p_value(samples: &mut [f64], reference: &Laplace) -> f64 {
        samples.sort_by(|a, b| a.total_cmp(b));
        let n = samples.len() as f64;
        let d = samples
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let cdf = reference.cdf(*x);
                (cdf - i as f64 / n).max((i + 1) as f64 / n - cdf)
            })
            .fold(0., f64::max);
        let sqrt_n = n.sqrt();
        kolmogorov_p_value((sqrt_n + 0.12 + 0.11 / sqrt_n) * d)
    }

    #[test]
    fn test_noise_distribution() {
        let (value, sensitivity, epsilon) = (42., 1., 0.5);
        let reference = Laplace::new(0., sensitivity / epsilon).unwrap();
        let mut p_values: Vec<f64> = (0..5)
            .map(|seed| {
                let mechanism = LaplaceMechanism::seeded(seed);
                let mut noise: Vec<f64> = (0..2000)
                    .map(|_| mechanism.add_noise(value, sensitivity, epsilon).unwrap() - value)
                    .collect();
                ks_p_value(&mut noise, &reference)
            })
            .collect();
        p_values.sort_by(|a, b| a.total_cmp(b));
        println!("KS p-values {p_values:?}");
        assert!(p_values[2] > 0.05);
    }

    #[test]
    fn test_ks_detects_wrong_scale() {
        let reference = Laplace::new(0., 2.).unwrap();
        let mechanism = LaplaceMechanism::seeded(0);
        let mut noise: Vec<f64> = (0..2000)
            .map(|_| mechanism.add_noise(0., 1., 2.).unwrap())
            .collect();
        assert!(ks_p_value(&mut noise, &reference) < 0.05);
    }

    #[test]
    fn test_add_noise() {
        let mechanism = LaplaceMechanism::seeded(1);
        assert_eq!(mechanism.add_noise(12., 0., 1.), Ok(12.));
        assert_ne!(mechanism.add_noise(12., 1., 1.), Ok(12.));
        for epsilon in [0., -1., f64::NAN, f64::INFINITY] {
            assert!(matches!(
                mechanism.add_noise(12., 1., epsilon),
                Err(Error::InvalidEpsilon(_))
            ));
        }
        assert!(matches!(
            mechanism.add_noise(12., -1., 1.),
            Err(Error::InvalidSensitivity(_))
        ));
        // Same seed, same draws
        let (a, b) = (LaplaceMechanism::seeded(3), LaplaceMechanism::seeded(3));
        assert_eq!(a.add_noise(0., 1., 1.), b.add_noise(0., 1., 1.));
    }
}
