//! Probability densities over a bounded phase space.
//!
//! The central abstraction is the [`Density`] trait: any type that can evaluate its value at a
//! point, generate samples of itself and project itself onto a [`BinGrid`] is a valid density.
//! There are three implementations:
//! - [`UniformDensity`] A constant density normalized by the phase space volume.
//! - [`BinnedKernelDensity`] A binned, kernel-smoothed estimate built from a [`Sample`].
//! - [`BinnedDensity`] A previously estimated density read back from a [`BinnedDensityStore`].
//!
//! Generating samples from an analytic density and re-estimating it is the typical round trip:
//! ```
//! # use binkde::{dens::{BinnedKernelDensity, Density, KernelSettingsBuilder, UniformDensity}, phsp::PhaseSpace};
//! # use rand::SeedableRng;
//! let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(1);
//!
//! let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
//! let uniform = UniformDensity::new(&phsp);
//!
//! let sample = uniform.generate(1000, &mut rng).unwrap();
//!
//! let settings = KernelSettingsBuilder::default()
//!     .binning([100])
//!     .widths([0.2])
//!     .build()
//!     .unwrap();
//!
//! let kde = BinnedKernelDensity::from_sample(&sample, &phsp, &settings, &mut rng).unwrap();
//! ```

mod grid;
mod kernel;
mod store;
mod uniform;

pub use grid::BinGrid;
pub use kernel::{BinnedKernelDensity, KernelSettings, KernelSettingsBuilder};
pub use store::{BinnedDensity, BinnedDensityStore, GridDensity, StoreError, STORE_FORMAT_VERSION};
pub use uniform::UniformDensity;

use crate::{
    fXX,
    math::{T, max},
    phsp::PhaseSpace,
};
use derive_more::{Deref, DerefMut, IntoIterator};
use log::{debug, info};
use nalgebra::{SVector, SVectorView};
use rand::Rng;
use rand_distr::{Uniform, uniform::SampleUniform};
use std::fmt::Debug;
use thiserror::Error;

/// The maximum number of rejection sampling trials per requested point.
const GENERATE_TRIALS_PER_POINT: usize = 100;

/// The number of density evaluations used to estimate an unknown majorant before any point is
/// accepted.
const MAJORANT_WARMUP_TRIALS: usize = 100;

/// Errors associated with the [`dens`](crate::dens) module.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DensError<T> {
    #[error("input sample contains no usable points")]
    EmptySample,
    #[error("rejection sampling budget exhausted ({accepted} / {requested} points after {trials} trials)")]
    GenerationExhausted {
        requested: usize,
        accepted: usize,
        trials: usize,
    },
    #[error("invalid estimator parameters: {reason}")]
    InvalidParameters { reason: &'static str },
    #[error("point {point:?} is outside of the phase space")]
    OutOfDomain { point: Vec<T> },
}

/// An ordered sequence of points within a P-dimensional phase space.
#[derive(Clone, Debug, Default, Deref, DerefMut, IntoIterator)]
pub struct Sample<T, const P: usize>(
    #[into_iterator(owned, ref, ref_mut)] pub Vec<SVector<T, P>>,
);

impl<T, const P: usize> From<Vec<SVector<T, P>>> for Sample<T, P> {
    fn from(points: Vec<SVector<T, P>>) -> Self {
        Self(points)
    }
}

/// A trait that must be implemented for any type that acts as a probability density over a
/// [`PhaseSpace`].
pub trait Density<T, const P: usize>: Debug
where
    T: fXX + SampleUniform,
    Self: Send + Sync,
{
    /// Returns a reference to the underlying [`PhaseSpace`].
    fn phase_space(&self) -> &PhaseSpace<T, P>;

    /// Estimates the normalized density value at a specific position `x`.
    fn value(&self, x: &SVectorView<T, P>) -> Result<T, DensError<T>>;

    /// Returns an upper bound of the density value over the phase space, if one is known.
    ///
    /// A known majorant accelerates rejection sampling within [`Density::generate`]. Without
    /// one, the majorant is estimated adaptively during generation.
    fn majorant(&self) -> Option<T> {
        None
    }

    /// Draw a single point from the underlying density.
    ///
    /// The default implementation performs rejection sampling against the phase space's uniform
    /// distribution scaled by the majorant. The majorant is inflated by 10% whenever a density
    /// value exceeds it; without a known majorant, a warm-up pass over uniform draws estimates
    /// one before any point is accepted.
    fn draw_sample(&self, rng: &mut impl Rng) -> Result<SVector<T, P>, DensError<T>> {
        let phsp = self.phase_space();
        let uniform = Uniform::new_inclusive(T::zero(), T::one()).unwrap();

        let mut majorant = self.majorant().unwrap_or(T::zero());

        if majorant <= T::zero() {
            for _ in 0..MAJORANT_WARMUP_TRIALS {
                let x = phsp.uniform_sample(rng);

                majorant = max!(majorant, T!(1.1) * self.value(&x.as_view())?);
            }
        }

        for _ in 0..GENERATE_TRIALS_PER_POINT {
            let x = phsp.uniform_sample(rng);
            let y = majorant * rng.sample(&uniform);

            let value = self.value(&x.as_view())?;

            if value > majorant {
                majorant = T!(1.1) * value;
            }

            if value > y {
                return Ok(x);
            }
        }

        Err(DensError::GenerationExhausted {
            requested: 1,
            accepted: 0,
            trials: GENERATE_TRIALS_PER_POINT,
        })
    }

    /// Generate a [`Sample`] of `size` points drawn from this density.
    ///
    /// The default implementation performs rejection sampling with a total trial budget of
    /// 100x the requested count, and fails with [`DensError::GenerationExhausted`] once the
    /// budget is spent. This guards against overly loose majorants and densities with
    /// near-zero mass.
    fn generate(&self, size: usize, rng: &mut impl Rng) -> Result<Sample<T, P>, DensError<T>> {
        let phsp = self.phase_space();
        let uniform = Uniform::new_inclusive(T::zero(), T::one()).unwrap();

        let mut points = Vec::with_capacity(size);

        let mut majorant = self.majorant().unwrap_or(T::zero());
        let estimated = majorant <= T::zero();

        if estimated {
            debug!("no known majorant, estimating one before generation");

            // Refine the majorant on uniform draws first. Starting the rejection loop at zero
            // would unconditionally accept the first trial.
            for _ in 0..MAJORANT_WARMUP_TRIALS {
                let x = phsp.uniform_sample(rng);

                majorant = max!(majorant, T!(1.1) * self.value(&x.as_view())?);
            }
        }

        let budget = GENERATE_TRIALS_PER_POINT * size;
        let mut trials = 0;

        while points.len() < size {
            if trials >= budget {
                return Err(DensError::GenerationExhausted {
                    requested: size,
                    accepted: points.len(),
                    trials,
                });
            }

            trials += 1;

            let x = phsp.uniform_sample(rng);
            let y = majorant * rng.sample(&uniform);

            let value = self.value(&x.as_view())?;

            if value > majorant {
                majorant = T!(1.1) * value;
            }

            if value > y {
                points.push(x);
            }
        }

        if estimated {
            info!(
                "generated {} points in {} trials (estimated majorant = {})",
                size, trials, majorant
            );
        }

        Ok(Sample(points))
    }

    /// Fill a caller-owned [`BinGrid`] with this density's value at each bin center scaled by
    /// the bin volume, for comparison against other densities.
    ///
    /// The grid binning is arbitrary and independent of any internal binning of the density.
    /// Bin centers outside of the phase space are set to zero.
    fn project(&self, grid: &mut BinGrid<T, P>) -> Result<(), DensError<T>> {
        let bin_volume = grid.bin_volume();

        for idx in 0..grid.len() {
            let center = grid.center(idx);

            let value = if self.phase_space().contains(&center.as_view()) {
                self.value(&center.as_view())?
            } else {
                T::zero()
            };

            grid.weights_mut()[idx] = value * bin_volume;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[derive(Debug)]
    struct Triangle<'a> {
        phsp: &'a PhaseSpace<f64, 1>,
    }

    impl<'a> Density<f64, 1> for Triangle<'a> {
        fn phase_space(&self) -> &PhaseSpace<f64, 1> {
            self.phsp
        }

        fn value(&self, point: &SVectorView<f64, 1>) -> Result<f64, DensError<f64>> {
            Ok(1.0 - point[0].abs())
        }

        fn majorant(&self) -> Option<f64> {
            Some(1.0)
        }
    }

    #[derive(Debug)]
    struct Spike<'a> {
        phsp: &'a PhaseSpace<f64, 1>,
    }

    impl<'a> Density<f64, 1> for Spike<'a> {
        fn phase_space(&self) -> &PhaseSpace<f64, 1> {
            self.phsp
        }

        fn value(&self, point: &SVectorView<f64, 1>) -> Result<f64, DensError<f64>> {
            Ok(if point[0].abs() < 1e-9 { 1e9 } else { 1e-12 })
        }

        fn majorant(&self) -> Option<f64> {
            Some(1e9)
        }
    }

    #[test]
    fn rejection_generate() {
        let phsp = PhaseSpace::new([(-1.0, 1.0)]).unwrap();
        let dens = Triangle { phsp: &phsp };

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(41);
        let sample = dens.generate(500, &mut rng).unwrap();

        assert_eq!(sample.len(), 500);
        assert!(sample
            .iter()
            .all(|point| phsp.contains(&point.as_view())));
    }

    #[test]
    fn rejection_generate_without_majorant() {
        let phsp = PhaseSpace::new([(-1.0, 1.0)]).unwrap();
        let dens = Triangle { phsp: &phsp };

        // Hide the majorant to force the adaptive estimate.
        #[derive(Debug)]
        struct Hidden<'a>(Triangle<'a>);

        impl<'a> Density<f64, 1> for Hidden<'a> {
            fn phase_space(&self) -> &PhaseSpace<f64, 1> {
                self.0.phase_space()
            }

            fn value(&self, point: &SVectorView<f64, 1>) -> Result<f64, DensError<f64>> {
                self.0.value(point)
            }
        }

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(43);
        let sample = Hidden(dens).generate(250, &mut rng).unwrap();

        assert_eq!(sample.len(), 250);
    }

    #[test]
    fn draw_sample_estimated_majorant() {
        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();

        // A step density with most of its mass on the positive half, no known majorant.
        #[derive(Debug)]
        struct Step<'a> {
            phsp: &'a PhaseSpace<f64, 1>,
        }

        impl<'a> Density<f64, 1> for Step<'a> {
            fn phase_space(&self) -> &PhaseSpace<f64, 1> {
                self.phsp
            }

            fn value(&self, point: &SVectorView<f64, 1>) -> Result<f64, DensError<f64>> {
                Ok(if point[0] >= 0.0 { 1.0 } else { 0.01 })
            }
        }

        let dens = Step { phsp: &phsp };

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(53);

        // Every call re-estimates the majorant from scratch. If the rejection loop started at
        // zero, each first trial would be accepted and roughly half of all points would land on
        // the negative half instead of roughly one percent.
        let negative = (0..200)
            .filter(|_| dens.draw_sample(&mut rng).unwrap()[0] < 0.0)
            .count();

        assert!(negative < 20);
    }

    #[test]
    fn generate_exhausts_trial_budget() {
        let phsp = PhaseSpace::new([(-1.0, 1.0)]).unwrap();
        let dens = Spike { phsp: &phsp };

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(47);

        assert!(matches!(
            dens.generate(100, &mut rng),
            Err(DensError::GenerationExhausted { requested: 100, .. })
        ));
    }

    #[test]
    fn project_onto_wider_grid() {
        let phsp = PhaseSpace::new([(-1.0, 1.0)]).unwrap();
        let dens = Triangle { phsp: &phsp };

        let mut grid = BinGrid::new([(-2.0, 2.0)], [400]).unwrap();

        dens.project(&mut grid).unwrap();

        // Bin centers outside of the phase space carry no weight.
        assert_eq!(grid.weights()[0], 0.0);
        assert_eq!(grid.weights()[399], 0.0);

        // The triangle integrates to one over its support.
        assert!((grid.total_weight() - 1.0).abs() < 0.01);
    }
}
