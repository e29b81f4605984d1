//! Uniform-bin histogram grids.

use crate::{
    dens::DensError,
    fXX,
    math::{T, floor, max, min},
};
use nalgebra::{SVector, SVectorView};
use rand::Rng;
use rand_distr::{Uniform, uniform::SampleUniform};
use serde::{Deserialize, Serialize};

/// The maximum number of grid cells.
const MAX_GRID_SIZE: usize = 20_000_000;

/// A P-dimensional histogram with equal-width bins per dimension and flat row-major weight
/// storage (the last dimension varies fastest).
///
/// A [`BinGrid`] serves two purposes: it is the internal histogram of a
/// [`BinnedKernelDensity`](crate::dens::BinnedKernelDensity), and it is the caller-owned
/// container filled by [`Density::project`](crate::dens::Density::project). The grid binning
/// is entirely independent of the phase space binning of any density projected onto it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: for<'x> Deserialize<'x>"))]
pub struct BinGrid<T, const P: usize> {
    #[serde(with = "serde_arrays")]
    limits: [(T, T); P],
    #[serde(with = "serde_arrays")]
    binning: [usize; P],
    weights: Vec<T>,
}

impl<T, const P: usize> BinGrid<T, P>
where
    T: fXX,
{
    /// Create a new [`BinGrid`] with all weights set to zero.
    pub fn new(limits: [(T, T); P], binning: [usize; P]) -> Result<Self, DensError<T>> {
        if binning.iter().any(|bins| *bins < 1) {
            return Err(DensError::InvalidParameters {
                reason: "bin count must be at least 1 in every dimension",
            });
        }

        if limits.iter().any(|(lower, upper)| lower >= upper) {
            return Err(DensError::InvalidParameters {
                reason: "grid limits must satisfy lower < upper in every dimension",
            });
        }

        let size = binning.iter().product::<usize>();

        if size > MAX_GRID_SIZE {
            return Err(DensError::InvalidParameters {
                reason: "total grid size exceeds the maximum cell count",
            });
        }

        Ok(Self {
            limits,
            binning,
            weights: vec![T::zero(); size],
        })
    }

    /// Create a new [`BinGrid`] from existing weights.
    pub(crate) fn from_weights(
        limits: [(T, T); P],
        binning: [usize; P],
        weights: Vec<T>,
    ) -> Result<Self, DensError<T>> {
        let mut grid = Self::new(limits, binning)?;

        if weights.len() != grid.weights.len() {
            return Err(DensError::InvalidParameters {
                reason: "weight count does not match the grid size",
            });
        }

        grid.weights = weights;

        Ok(grid)
    }

    /// Returns the number of bins per dimension.
    pub fn binning(&self) -> [usize; P] {
        self.binning
    }

    /// Returns the volume of a single bin.
    pub fn bin_volume(&self) -> T {
        self.limits
            .iter()
            .zip(self.binning.iter())
            .fold(T::one(), |acc, ((lower, upper), bins)| {
                acc * (*upper - *lower) / T::from_usize(*bins).unwrap()
            })
    }

    /// Returns the bin width along dimension `dim`.
    pub fn bin_width(&self, dim: usize) -> T {
        let (lower, upper) = self.limits[dim];

        (upper - lower) / T::from_usize(self.binning[dim]).unwrap()
    }

    /// Returns the center point of the bin with flat index `idx`.
    pub fn center(&self, idx: usize) -> SVector<T, P> {
        let multi = self.unravel(idx);

        let mut center = [T::zero(); P];

        for dim in 0..P {
            let (lower, _) = self.limits[dim];

            center[dim] =
                lower + (T::from_usize(multi[dim]).unwrap() + T!(0.5)) * self.bin_width(dim);
        }

        SVector::from(center)
    }

    /// Returns the flat index of the bin containing `x`, or `None` if `x` lies outside of the
    /// grid limits. Points exactly on the upper limit fall into the last bin.
    pub fn index_of(&self, x: &SVectorView<T, P>) -> Option<usize> {
        let mut multi = [0_usize; P];

        for dim in 0..P {
            let (lower, upper) = self.limits[dim];
            let xd = x[dim];

            if (xd < lower) || (xd > upper) {
                return None;
            }

            let t = (xd - lower) / self.bin_width(dim);
            let idx: usize = floor!(t).as_();

            multi[dim] = idx.min(self.binning[dim] - 1);
        }

        Some(self.ravel(multi))
    }

    /// Estimate the grid as a continuous function at `x` by multilinear interpolation between
    /// the centers of the neighboring bins. Within the outermost half-bins the value is
    /// extrapolated flat; outside of the grid limits it is zero.
    pub fn interpolate(&self, x: &SVectorView<T, P>) -> T {
        let mut base = [0_usize; P];
        let mut frac = [T::zero(); P];

        for dim in 0..P {
            let (lower, upper) = self.limits[dim];
            let xd = x[dim];

            if (xd < lower) || (xd > upper) {
                return T::zero();
            }

            let bins = self.binning[dim];

            if bins == 1 {
                continue;
            }

            let t = (xd - lower) / self.bin_width(dim) - T!(0.5);
            let clamped = min!(
                max!(floor!(t), T::zero()),
                T::from_usize(bins - 2).unwrap()
            );

            base[dim] = clamped.as_();
            frac[dim] = min!(max!(t - clamped, T::zero()), T::one());
        }

        // Accumulate over the 2^P vertices of the surrounding cell.
        let mut value = T::zero();

        for mask in 0..(1_usize << P) {
            let mut weight = T::one();
            let mut multi = [0_usize; P];

            for dim in 0..P {
                if (mask >> dim) & 1 == 1 {
                    weight *= frac[dim];
                    multi[dim] = (base[dim] + 1).min(self.binning[dim] - 1);
                } else {
                    weight *= T::one() - frac[dim];
                    multi[dim] = base[dim];
                }
            }

            value += weight * self.weights[self.ravel(multi)];
        }

        value
    }

    /// Returns the total number of bins.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Returns `true` if the grid contains no bins.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Returns the per-dimension grid limits.
    pub fn limits(&self) -> [(T, T); P] {
        self.limits
    }

    /// Calculate the flat index for a multi-dimensional bin index.
    pub fn ravel(&self, multi: [usize; P]) -> usize {
        multi
            .iter()
            .zip(self.binning.iter())
            .fold(0, |acc, (idx, bins)| acc * bins + idx)
    }

    /// Calculate the multi-dimensional bin index for a flat index.
    pub fn unravel(&self, idx: usize) -> [usize; P] {
        let mut multi = [0_usize; P];
        let mut rest = idx;

        for dim in (0..P).rev() {
            multi[dim] = rest % self.binning[dim];
            rest /= self.binning[dim];
        }

        multi
    }

    /// Draw a random point by first drawing a bin proportionally to its weight and then drawing
    /// a point uniformly within that bin.
    pub(crate) fn sample_point(&self, rng: &mut impl Rng) -> SVector<T, P>
    where
        T: SampleUniform,
    {
        let total = self.total_weight();
        let uniform = Uniform::new(T::zero(), total).unwrap();

        let idx = {
            // Select the bin index by weight.
            let wdx: T = rng.sample(uniform);

            // Here we abuse try_fold to return the bin index early wrapped within Err().
            match self
                .weights
                .iter()
                .enumerate()
                .try_fold(T::zero(), |acc, (idx, weight)| {
                    let next_weight = acc + *weight;
                    if wdx < next_weight {
                        Err(idx)
                    } else {
                        Ok(next_weight)
                    }
                }) {
                Ok(_) => self.weights.len() - 1,
                Err(idx) => idx,
            }
        };

        let center = self.center(idx);

        let mut point = [T::zero(); P];

        for dim in 0..P {
            let half_width = self.bin_width(dim) / T!(2.0);
            let within = Uniform::new_inclusive(-half_width, half_width).unwrap();

            point[dim] = center[dim] + rng.sample(within);
        }

        SVector::from(point)
    }

    /// Returns the sum of all bin weights.
    pub fn total_weight(&self) -> T {
        self.weights.iter().sum()
    }

    /// Access the bin weights.
    pub fn weights(&self) -> &[T] {
        &self.weights
    }

    /// Mutably access the bin weights.
    pub fn weights_mut(&mut self) -> &mut [T] {
        &mut self.weights
    }
}
