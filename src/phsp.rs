//! Phase space definitions.
//!
//! A [`PhaseSpace`] describes the bounded domain over which any density within the crate is
//! defined. It is an ordered sequence of `P` closed intervals, one per dimension, and is
//! immutable once constructed. Densities reference a phase space, they do not own it.

use crate::fXX;
use itertools::zip_eq;
use nalgebra::{SVector, SVectorView};
use rand::Rng;
use rand_distr::{Uniform, uniform::SampleUniform};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors associated with the [`phsp`](crate::phsp) module.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum PhspError<T> {
    #[error("invalid domain for dimension {dim} [{lower} - {upper}]")]
    InvalidDomain { dim: usize, lower: T, upper: T },
}

/// A bounded P-dimensional phase space with closed per-dimension intervals.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PhaseSpace<T, const P: usize> {
    #[serde(with = "serde_arrays")]
    #[serde(bound = "T: for<'x> Deserialize<'x> + Serialize")]
    limits: [(T, T); P],
}

impl<T, const P: usize> PhaseSpace<T, P>
where
    T: fXX,
{
    /// Create a new [`PhaseSpace`] from per-dimension limits.
    pub fn new(limits: [(T, T); P]) -> Result<Self, PhspError<T>> {
        for (dim, (lower, upper)) in limits.iter().enumerate() {
            if lower >= upper {
                return Err(PhspError::InvalidDomain {
                    dim,
                    lower: *lower,
                    upper: *upper,
                });
            }
        }

        Ok(Self { limits })
    }

    /// Returns `true` iff every coordinate of `x` lies within its dimension's closed interval.
    pub fn contains(&self, x: &SVectorView<T, P>) -> bool {
        zip_eq(x.iter(), self.limits.iter()).fold(true, |acc, (c, (lower, upper))| {
            acc & ((lower <= c) & (c <= upper))
        })
    }

    /// Returns the number of dimensions.
    pub fn dim(&self) -> usize {
        P
    }

    /// Returns the per-dimension limits.
    pub fn limits(&self) -> [(T, T); P] {
        self.limits
    }

    /// Draw a point independently-uniformly per dimension within the limits.
    pub fn uniform_sample(&self, rng: &mut impl Rng) -> SVector<T, P>
    where
        T: SampleUniform,
    {
        let mut sample = [T::zero(); P];

        sample
            .iter_mut()
            .zip(self.limits.iter())
            .for_each(|(value, (lower, upper))| {
                let uniform = Uniform::new_inclusive(*lower, *upper).unwrap();

                *value = rng.sample(uniform);
            });

        SVector::from(sample)
    }

    /// Returns the volume of the phase space, i.e. the product of the per-dimension extents.
    pub fn volume(&self) -> T {
        self.limits
            .iter()
            .fold(T::one(), |acc, (lower, upper)| acc * (*upper - *lower))
    }
}
