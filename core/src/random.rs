//! Random draws used by every stochastic step of the filter.
//!
//! The filter only needs two primitives: a uniform draw on `[0, 1)` and a pair of
//! independent standard-normal deviates. Any [`rand::Rng`] provides both through the
//! blanket implementation below; custom sources (e.g. a scripted sequence in tests)
//! only implement [`RandomSource::uniform`] and inherit a Box-Muller `normal_pair`.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::f64::consts::TAU;

/// Source of uniform and standard-normal draws.
pub trait RandomSource {
    /// Uniform draw on `[0, 1)`.
    fn uniform(&mut self) -> f64;

    /// Two independent standard-normal deviates.
    ///
    /// The default uses the Box-Muller transform on two uniform draws. The radial draw
    /// is taken as `1 - u` so it lies on `(0, 1]` and the logarithm stays finite.
    fn normal_pair(&mut self) -> (f64, f64) {
        let radius = (-2.0 * (1.0 - self.uniform()).ln()).sqrt();
        let angle = self.uniform() * TAU;
        (radius * angle.cos(), radius * angle.sin())
    }
}

impl<R: Rng> RandomSource for R {
    fn uniform(&mut self) -> f64 {
        self.random::<f64>()
    }

    fn normal_pair(&mut self) -> (f64, f64) {
        let x: f64 = StandardNormal.sample(self);
        let y: f64 = StandardNormal.sample(self);
        (x, y)
    }
}
