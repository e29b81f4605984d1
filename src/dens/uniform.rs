use crate::{
    dens::{DensError, Density, Sample},
    fXX,
    phsp::PhaseSpace,
};
use nalgebra::{SVector, SVectorView};
use rand::Rng;
use rand_distr::uniform::SampleUniform;

/// A uniform probability density over a [`PhaseSpace`], normalized by its volume.
#[derive(Clone, Debug)]
pub struct UniformDensity<'a, T, const P: usize> {
    phsp: &'a PhaseSpace<T, P>,
}

impl<'a, T, const P: usize> UniformDensity<'a, T, P>
where
    T: fXX,
{
    /// Create a new [`UniformDensity`] over the given phase space.
    pub fn new(phsp: &'a PhaseSpace<T, P>) -> Self {
        Self { phsp }
    }
}

impl<T, const P: usize> Density<T, P> for UniformDensity<'_, T, P>
where
    T: fXX + SampleUniform,
{
    fn phase_space(&self) -> &PhaseSpace<T, P> {
        self.phsp
    }

    fn value(&self, x: &SVectorView<T, P>) -> Result<T, DensError<T>> {
        if !self.phsp.contains(x) {
            return Err(DensError::OutOfDomain {
                point: x.iter().copied().collect(),
            });
        }

        Ok(T::one() / self.phsp.volume())
    }

    fn majorant(&self) -> Option<T> {
        Some(T::one() / self.phsp.volume())
    }

    // The density is constant and trivially its own majorant, so sampling is direct and no
    // rejection is needed.
    fn draw_sample(&self, rng: &mut impl Rng) -> Result<SVector<T, P>, DensError<T>> {
        Ok(self.phsp.uniform_sample(rng))
    }

    fn generate(&self, size: usize, rng: &mut impl Rng) -> Result<Sample<T, P>, DensError<T>> {
        Ok(Sample(
            (0..size).map(|_| self.phsp.uniform_sample(rng)).collect(),
        ))
    }
}
