use crate::{
    dens::{BinGrid, DensError, Density, Sample, UniformDensity},
    fXX,
    math::{T, floor, max, min, powi},
    phsp::PhaseSpace,
};
use derive_builder::Builder;
use log::{debug, info, warn};
use nalgebra::{SVector, SVectorView};
use rand::Rng;
use rand_distr::uniform::SampleUniform;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Configuration of a [`BinnedKernelDensity`].
#[derive(Builder, Clone, Debug, Deserialize, Serialize)]
pub struct KernelSettings<T, const P: usize> {
    /// The number of bins per dimension.
    #[serde(with = "serde_arrays")]
    pub binning: [usize; P],

    /// The kernel width per dimension.
    #[serde(with = "serde_arrays")]
    #[serde(bound = "T: for<'x> Deserialize<'x> + Serialize")]
    pub widths: [T; P],

    /// The number of Monte-Carlo convolution draws.
    ///
    /// A value of zero selects the exact convolution of the approximation density on the
    /// bin-center grid instead of stochastic convolution.
    #[builder(default)]
    pub mc_draws: usize,
}

/// A binned, kernel-smoothed and normalized density estimate built from a [`Sample`].
///
/// The estimator accumulates the sample into an equal-width histogram over the phase space,
/// convolves it with an Epanechnikov kernel `K(u) = max(0, 1 - u²)` where
/// `u² = Σ ((Δx / h)²)` over all dimensions, corrects for the kernel mass truncated at the
/// phase space boundary using an approximation density, and normalizes the result so that its
/// Riemann sum over the phase space equals one.
///
/// Queries interpolate multilinearly between neighboring bin centers rather than returning the
/// nearest bin weight. The estimate is immutable once constructed; re-estimation requires
/// constructing a new instance.
#[derive(Clone, Debug)]
pub struct BinnedKernelDensity<'a, T, const P: usize> {
    phsp: &'a PhaseSpace<T, P>,
    grid: BinGrid<T, P>,
    widths: [T; P],
    dropped: usize,
}

impl<'a, T, const P: usize> BinnedKernelDensity<'a, T, P>
where
    T: fXX + SampleUniform,
{
    /// Estimate a new [`BinnedKernelDensity`] from a sample, using the flat approximation
    /// density over the phase space.
    pub fn from_sample(
        sample: &Sample<T, P>,
        phsp: &'a PhaseSpace<T, P>,
        settings: &KernelSettings<T, P>,
        rng: &mut impl Rng,
    ) -> Result<Self, DensError<T>> {
        let approx = UniformDensity::new(phsp);

        Self::init(sample, phsp, settings, &approx, rng)
    }

    /// Estimate a new [`BinnedKernelDensity`] from a sample, using an arbitrary caller-supplied
    /// approximation density.
    pub fn from_sample_with_approx<D>(
        sample: &Sample<T, P>,
        phsp: &'a PhaseSpace<T, P>,
        settings: &KernelSettings<T, P>,
        approx: &D,
        rng: &mut impl Rng,
    ) -> Result<Self, DensError<T>>
    where
        D: Density<T, P>,
    {
        Self::init(sample, phsp, settings, approx, rng)
    }

    fn init<D>(
        sample: &Sample<T, P>,
        phsp: &'a PhaseSpace<T, P>,
        settings: &KernelSettings<T, P>,
        approx: &D,
        rng: &mut impl Rng,
    ) -> Result<Self, DensError<T>>
    where
        D: Density<T, P>,
    {
        if settings.widths.iter().any(|width| *width <= T::zero()) {
            return Err(DensError::InvalidParameters {
                reason: "kernel width must be positive in every dimension",
            });
        }

        if sample.is_empty() {
            return Err(DensError::EmptySample);
        }

        info!(
            "estimating binned kernel density over a {}D phase space ({} bins)",
            P,
            settings.binning.iter().product::<usize>()
        );

        // Histogram accumulation. Points outside of the phase space are dropped and counted,
        // not treated as an error.
        let mut raw = BinGrid::new(phsp.limits(), settings.binning)?;
        let mut dropped = 0;

        for point in sample.iter() {
            match raw.index_of(&point.as_view()) {
                Some(idx) => raw.weights_mut()[idx] += T::one(),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(
                "dropped {} of {} sample points outside of the phase space",
                dropped,
                sample.len()
            );
        }

        if dropped == sample.len() {
            return Err(DensError::EmptySample);
        }

        let data = convolve(&raw, &settings.widths);

        // Approximation density values at the bin centers, zero outside of its domain.
        let avals = (0..raw.len())
            .map(|idx| {
                let center = raw.center(idx);

                if approx.phase_space().contains(&center.as_view()) {
                    approx.value(&center.as_view())
                } else {
                    Ok(T::zero())
                }
            })
            .collect::<Result<Vec<T>, _>>()?;

        // The correction map is the kernel convolution of the approximation density. It
        // restores the kernel mass truncated at the phase space boundary (and, for a
        // non-uniform approximation, its shape).
        let corr = if settings.mc_draws == 0 {
            debug!("convolution of the approximation density on the bin-center grid");

            let mut amap = BinGrid::new(phsp.limits(), settings.binning)?;
            amap.weights_mut().copy_from_slice(&avals);

            convolve(&amap, &settings.widths)
        } else {
            debug!(
                "monte-carlo convolution of the approximation density with {} draws",
                settings.mc_draws
            );

            let points = approx.generate(settings.mc_draws, rng)?;

            spread(&raw, &points, &settings.widths)
        };

        let mut weights = data
            .iter()
            .zip(corr.iter())
            .zip(avals.iter())
            .map(|((dval, cval), aval)| {
                if *cval > T::zero() {
                    *dval / *cval * *aval
                } else {
                    T::zero()
                }
            })
            .collect::<Vec<T>>();

        // Normalize so that the Riemann sum over all bins equals one. Mass displaced outside
        // of the phase space during smoothing is lost and recovered here.
        let total = weights.iter().copied().sum::<T>();

        if total <= T::zero() {
            return Err(DensError::InvalidParameters {
                reason: "approximation density does not cover the sampled region",
            });
        }

        let norm = total * raw.bin_volume();

        weights.iter_mut().for_each(|weight| *weight /= norm);

        let grid = BinGrid::from_weights(phsp.limits(), settings.binning, weights)?;

        info!(
            "estimated binned kernel density from {} points",
            sample.len() - dropped
        );

        Ok(Self {
            phsp,
            grid,
            widths: settings.widths,
            dropped,
        })
    }

    /// Returns the number of sample points that fell outside of the phase space and were
    /// dropped during histogram accumulation.
    pub fn dropped_points(&self) -> usize {
        self.dropped
    }

    /// Access the normalized internal histogram.
    pub fn grid(&self) -> &BinGrid<T, P> {
        &self.grid
    }

    /// Returns the per-dimension kernel widths.
    pub fn widths(&self) -> [T; P] {
        self.widths
    }
}

impl<T, const P: usize> Density<T, P> for BinnedKernelDensity<'_, T, P>
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

        Ok(self.grid.interpolate(x))
    }

    // Interpolated values are convex combinations of bin weights, so the maximum weight is a
    // valid majorant.
    fn majorant(&self) -> Option<T> {
        Some(
            self.grid
                .weights()
                .iter()
                .fold(T::zero(), |acc, weight| max!(acc, *weight)),
        )
    }

    fn draw_sample(&self, rng: &mut impl Rng) -> Result<SVector<T, P>, DensError<T>> {
        Ok(self.grid.sample_point(rng))
    }

    // No rejection sampling required, the histogram is resampled by drawing a bin
    // proportionally to its weight and a uniform point within that bin.
    fn generate(&self, size: usize, rng: &mut impl Rng) -> Result<Sample<T, P>, DensError<T>> {
        Ok(Sample(
            (0..size).map(|_| self.grid.sample_point(rng)).collect(),
        ))
    }
}

/// Exact discrete convolution of the grid weights with the Epanechnikov kernel, evaluated at
/// the bin centers (gather form, parallel over output bins).
fn convolve<T, const P: usize>(grid: &BinGrid<T, P>, widths: &[T; P]) -> Vec<T>
where
    T: fXX,
{
    let binning = grid.binning();

    // Window half-size in bins per dimension.
    let mut reach = [0_usize; P];

    for dim in 0..P {
        let ratio: usize = floor!(widths[dim] / grid.bin_width(dim)).as_();

        reach[dim] = ratio + 1;
    }

    (0..grid.len())
        .into_par_iter()
        .map(|jdx| {
            let jmulti = grid.unravel(jdx);

            let mut lower = [0_usize; P];
            let mut upper = [0_usize; P];

            for dim in 0..P {
                lower[dim] = jmulti[dim].saturating_sub(reach[dim]);
                upper[dim] = (jmulti[dim] + reach[dim]).min(binning[dim] - 1);
            }

            let mut acc = T::zero();

            for_each_cell(lower, upper, |imulti| {
                let weight = grid.weights()[grid.ravel(*imulti)];

                if weight != T::zero() {
                    let mut usq = T::zero();

                    for dim in 0..P {
                        let delta = (T::from_usize(imulti[dim]).unwrap()
                            - T::from_usize(jmulti[dim]).unwrap())
                            * grid.bin_width(dim)
                            / widths[dim];

                        usq += powi!(delta, 2);
                    }

                    if usq < T::one() {
                        acc += weight * (T::one() - usq);
                    }
                }
            });

            acc
        })
        .collect()
}

/// Monte-Carlo convolution: accumulate the kernel weights of every drawn point into a map with
/// the layout of `grid`. Per-worker partial maps are merged afterwards to avoid contention on
/// shared bins.
fn spread<T, const P: usize>(
    grid: &BinGrid<T, P>,
    points: &Sample<T, P>,
    widths: &[T; P],
) -> Vec<T>
where
    T: fXX,
{
    let size = grid.len();

    points
        .par_chunks(1024)
        .fold(
            || vec![T::zero(); size],
            |mut acc, chunk| {
                chunk
                    .iter()
                    .for_each(|point| spread_kernel(&mut acc, grid, point, widths));

                acc
            },
        )
        .reduce(
            || vec![T::zero(); size],
            |mut acc, partial| {
                acc.iter_mut()
                    .zip(partial.iter())
                    .for_each(|(value, other)| *value += *other);

                acc
            },
        )
}

/// Accumulate the kernel weights of a single point into `map`.
fn spread_kernel<T, const P: usize>(
    map: &mut [T],
    grid: &BinGrid<T, P>,
    point: &SVector<T, P>,
    widths: &[T; P],
) where
    T: fXX,
{
    let binning = grid.binning();
    let limits = grid.limits();

    let mut lower = [0_usize; P];
    let mut upper = [0_usize; P];

    for dim in 0..P {
        let (lo, _) = limits[dim];
        let delta = grid.bin_width(dim);
        let last = T::from_usize(binning[dim] - 1).unwrap();

        let t1 = min!(max!(floor!((point[dim] - widths[dim] - lo) / delta), T::zero()), last);
        let t2 = min!(max!(floor!((point[dim] + widths[dim] - lo) / delta), T::zero()), last);

        lower[dim] = t1.as_();
        upper[dim] = t2.as_();
    }

    for_each_cell(lower, upper, |imulti| {
        let mut usq = T::zero();

        for dim in 0..P {
            let (lo, _) = limits[dim];
            let center =
                lo + (T::from_usize(imulti[dim]).unwrap() + T!(0.5)) * grid.bin_width(dim);

            usq += powi!((center - point[dim]) / widths[dim], 2);
        }

        if usq < T::one() {
            map[grid.ravel(*imulti)] += T::one() - usq;
        }
    });
}

/// Visit every multi-dimensional index within the closed box `[lower, upper]`, the last
/// dimension varying fastest.
fn for_each_cell<const P: usize>(
    lower: [usize; P],
    upper: [usize; P],
    mut body: impl FnMut(&[usize; P]),
) {
    let mut iter = lower;

    loop {
        body(&iter);

        let mut advanced = false;

        for dim in (0..P).rev() {
            if iter[dim] < upper[dim] {
                iter[dim] += 1;
                advanced = true;
                break;
            } else {
                iter[dim] = lower[dim];
            }
        }

        if !advanced {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn settings_1d(bins: usize, width: f64, mc_draws: usize) -> KernelSettings<f64, 1> {
        KernelSettingsBuilder::default()
            .binning([bins])
            .widths([width])
            .mc_draws(mc_draws)
            .build()
            .unwrap()
    }

    #[test]
    fn test_invalid_parameters() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
        let uniform = UniformDensity::new(&phsp);

        let sample = uniform.generate(100, &mut rng).unwrap();

        assert!(matches!(
            BinnedKernelDensity::from_sample(&sample, &phsp, &settings_1d(0, 0.2, 0), &mut rng),
            Err(DensError::InvalidParameters { .. })
        ));

        assert!(matches!(
            BinnedKernelDensity::from_sample(&sample, &phsp, &settings_1d(100, 0.0, 0), &mut rng),
            Err(DensError::InvalidParameters { .. })
        ));

        assert!(matches!(
            BinnedKernelDensity::from_sample(&sample, &phsp, &settings_1d(100, -0.2, 0), &mut rng),
            Err(DensError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_empty_sample() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
        let sample = Sample::<f64, 1>(Vec::new());

        assert!(matches!(
            BinnedKernelDensity::from_sample(&sample, &phsp, &settings_1d(100, 0.2, 0), &mut rng),
            Err(DensError::EmptySample)
        ));
    }

    #[test]
    fn test_dropped_points() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();

        let mut points = UniformDensity::new(&phsp).generate(500, &mut rng).unwrap().0;
        points.push(SVector::from([1.5]));
        points.push(SVector::from([-2.5]));

        let kde = BinnedKernelDensity::from_sample(
            &Sample(points),
            &phsp,
            &settings_1d(50, 0.2, 0),
            &mut rng,
        )
        .unwrap();

        assert_eq!(kde.dropped_points(), 2);
    }

    #[test]
    fn test_all_points_dropped() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
        let sample = Sample(vec![SVector::from([2.0]), SVector::from([3.0])]);

        assert!(matches!(
            BinnedKernelDensity::from_sample(&sample, &phsp, &settings_1d(50, 0.2, 0), &mut rng),
            Err(DensError::EmptySample)
        ));
    }

    #[test]
    fn test_normalization() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
        let uniform = UniformDensity::new(&phsp);

        let sample = uniform.generate(2000, &mut rng).unwrap();

        for mc_draws in [0, 20000] {
            let kde = BinnedKernelDensity::from_sample(
                &sample,
                &phsp,
                &settings_1d(100, 0.2, mc_draws),
                &mut rng,
            )
            .unwrap();

            let riemann_sum = kde.grid().total_weight() * kde.grid().bin_volume();

            assert!((riemann_sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_uniform_scenario() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
        let uniform = UniformDensity::new(&phsp);

        let sample = uniform.generate(10000, &mut rng).unwrap();

        let kde = BinnedKernelDensity::from_sample(
            &sample,
            &phsp,
            &settings_1d(1000, 0.2, 100000),
            &mut rng,
        )
        .unwrap();

        let value = kde.value(&SVector::from([0.0]).as_view()).unwrap();

        assert!((value - 0.5).abs() < 0.05);

        let riemann_sum = kde.grid().total_weight() * kde.grid().bin_volume();

        assert!((riemann_sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_convergence() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
        let uniform = UniformDensity::new(&phsp);

        let deviations = [100, 1000, 10000, 100000]
            .iter()
            .map(|size| {
                let sample = uniform.generate(*size, &mut rng).unwrap();

                let kde = BinnedKernelDensity::from_sample(
                    &sample,
                    &phsp,
                    &settings_1d(200, 0.2, 0),
                    &mut rng,
                )
                .unwrap();

                (0..kde.grid().len())
                    .map(|idx| (kde.grid().weights()[idx] - 0.5).abs())
                    .fold(0.0_f64, f64::max)
            })
            .collect::<Vec<f64>>();

        // The maximum deviation from the true density shrinks with the sample size (up to
        // bin-noise tolerance, so only well separated sizes are compared strictly).
        assert!(deviations[2] < deviations[0]);
        assert!(deviations[3] < deviations[0]);
        assert!(deviations[3] < 0.05);
    }

    #[test]
    fn test_estimator_generate() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
        let uniform = UniformDensity::new(&phsp);

        let sample = uniform.generate(2000, &mut rng).unwrap();

        let kde =
            BinnedKernelDensity::from_sample(&sample, &phsp, &settings_1d(100, 0.2, 0), &mut rng)
                .unwrap();

        let resampled = kde.generate(500, &mut rng).unwrap();

        assert_eq!(resampled.len(), 500);
        assert!(resampled.iter().all(|point| phsp.contains(&point.as_view())));
    }

    #[test]
    fn test_supplied_approximation() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0)]).unwrap();
        let uniform = UniformDensity::new(&phsp);

        let sample = uniform.generate(5000, &mut rng).unwrap();

        let kde = BinnedKernelDensity::from_sample_with_approx(
            &sample,
            &phsp,
            &settings_1d(200, 0.2, 0),
            &uniform,
            &mut rng,
        )
        .unwrap();

        let riemann_sum = kde.grid().total_weight() * kde.grid().bin_volume();

        assert!((riemann_sum - 1.0).abs() < 1e-6);

        let value = kde.value(&SVector::from([0.0]).as_view()).unwrap();

        assert!((value - 0.5).abs() < 0.1);
    }

    #[test]
    fn test_two_dimensional() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);

        let phsp = PhaseSpace::new([(-1.0_f64, 1.0), (-1.0, 1.0)]).unwrap();
        let uniform = UniformDensity::new(&phsp);

        let sample = uniform.generate(5000, &mut rng).unwrap();

        let settings = KernelSettingsBuilder::default()
            .binning([20, 20])
            .widths([0.5, 0.5])
            .build()
            .unwrap();

        let kde = BinnedKernelDensity::from_sample(&sample, &phsp, &settings, &mut rng).unwrap();

        let riemann_sum = kde.grid().total_weight() * kde.grid().bin_volume();

        assert!((riemann_sum - 1.0).abs() < 1e-6);

        let value = kde.value(&SVector::from([0.0, 0.0]).as_view()).unwrap();

        assert!((value - 0.25).abs() < 0.1);

        assert!(matches!(
            kde.value(&SVector::from([0.0, 1.5]).as_view()),
            Err(DensError::OutOfDomain { .. })
        ));
    }
}
