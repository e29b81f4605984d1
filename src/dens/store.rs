use crate::{
    dens::{BinGrid, BinnedKernelDensity, DensError, Density, Sample},
    fXX,
    math::max,
    phsp::PhaseSpace,
};
use log::info;
use nalgebra::{SVector, SVectorView};
use rand::Rng;
use rand_distr::uniform::SampleUniform;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};
use thiserror::Error;

/// The current format version of the persisted binned density layout.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Errors associated with [`BinnedDensityStore`].
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt binned density store: {reason}")]
    CorruptStore { reason: String },
    #[error("incompatible store format version {found} (expected {expected})")]
    IncompatibleVersion { found: u32, expected: u32 },
    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// A trait for densities that are backed by a normalized [`BinGrid`], making them persistable
/// through a [`BinnedDensityStore`].
pub trait GridDensity<T, const P: usize> {
    /// Access the normalized histogram backing this density.
    fn grid(&self) -> &BinGrid<T, P>;
}

impl<T, const P: usize> GridDensity<T, P> for BinnedKernelDensity<'_, T, P>
where
    T: fXX + SampleUniform,
{
    fn grid(&self) -> &BinGrid<T, P> {
        BinnedKernelDensity::grid(self)
    }
}

impl<T, const P: usize> GridDensity<T, P> for BinnedDensity<T, P> {
    fn grid(&self) -> &BinGrid<T, P> {
        &self.grid
    }
}

/// The versioned on-disk layout of a binned density.
#[derive(Debug, Deserialize, Serialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: for<'x> Deserialize<'x>"))]
struct StoreRecord<T, const P: usize> {
    version: u32,
    dim: usize,
    #[serde(with = "serde_arrays")]
    limits: [(T, T); P],
    #[serde(with = "serde_arrays")]
    binning: [usize; P],
    weights: Vec<T>,
}

/// Serialization and deserialization of binned densities.
///
/// The persisted layout is a versioned record holding the phase space bounds, the per-dimension
/// bin counts and the flat sequence of post-normalization bin weights. Reading reconstructs a
/// fully queryable [`BinnedDensity`] without requiring the original [`Sample`]. No partial
/// state is exposed after a failed read.
#[derive(Debug)]
pub struct BinnedDensityStore;

impl BinnedDensityStore {
    /// Write a binned density to a file.
    pub fn write<D, T, const P: usize>(density: &D, path: impl AsRef<Path>) -> Result<(), StoreError>
    where
        D: GridDensity<T, P>,
        T: fXX + Serialize,
    {
        info!(
            "writing binned density to \"{}\"",
            path.as_ref().to_string_lossy()
        );

        let file = File::create(path)?;

        Self::write_into(density, BufWriter::new(file))
    }

    /// Write a binned density to an arbitrary destination.
    pub fn write_into<D, T, const P: usize>(
        density: &D,
        writer: impl Write,
    ) -> Result<(), StoreError>
    where
        D: GridDensity<T, P>,
        T: fXX + Serialize,
    {
        let grid = density.grid();

        let record = StoreRecord {
            version: STORE_FORMAT_VERSION,
            dim: P,
            limits: grid.limits(),
            binning: grid.binning(),
            weights: grid.weights().to_vec(),
        };

        serde_json::to_writer(writer, &record).map_err(std::io::Error::other)?;

        Ok(())
    }

    /// Read a binned density from a file.
    pub fn read<T, const P: usize>(path: impl AsRef<Path>) -> Result<BinnedDensity<T, P>, StoreError>
    where
        T: fXX + for<'x> Deserialize<'x>,
    {
        info!(
            "reading binned density from \"{}\"",
            path.as_ref().to_string_lossy()
        );

        let file = File::open(path)?;

        Self::read_from(BufReader::new(file))
    }

    /// Read a binned density from an arbitrary source.
    pub fn read_from<T, const P: usize>(reader: impl Read) -> Result<BinnedDensity<T, P>, StoreError>
    where
        T: fXX + for<'x> Deserialize<'x>,
    {
        let value: serde_json::Value =
            serde_json::from_reader(reader).map_err(|err| StoreError::CorruptStore {
                reason: err.to_string(),
            })?;

        // The version is checked before the full layout is decoded, so that future layout
        // changes still surface as a version mismatch rather than a parse failure.
        let found = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| StoreError::CorruptStore {
                reason: "missing format version".to_string(),
            })?;

        if found != STORE_FORMAT_VERSION as u64 {
            return Err(StoreError::IncompatibleVersion {
                found: found as u32,
                expected: STORE_FORMAT_VERSION,
            });
        }

        let record: StoreRecord<T, P> =
            serde_json::from_value(value).map_err(|err| StoreError::CorruptStore {
                reason: err.to_string(),
            })?;

        if record.dim != P {
            return Err(StoreError::CorruptStore {
                reason: format!("dimensionality mismatch ({} stored, {} requested)", record.dim, P),
            });
        }

        if record
            .weights
            .iter()
            .any(|weight| !(*weight >= T::zero()))
        {
            return Err(StoreError::CorruptStore {
                reason: "negative or non-finite bin weight".to_string(),
            });
        }

        // A normalized density carries positive total mass; an all-zero record would panic
        // later during weighted resampling.
        if record.weights.iter().copied().sum::<T>() <= T::zero() {
            return Err(StoreError::CorruptStore {
                reason: "total bin weight is not positive".to_string(),
            });
        }

        let phsp = PhaseSpace::new(record.limits).map_err(|err| StoreError::CorruptStore {
            reason: err.to_string(),
        })?;

        let grid = BinGrid::from_weights(record.limits, record.binning, record.weights).map_err(
            |err| StoreError::CorruptStore {
                reason: err.to_string(),
            },
        )?;

        Ok(BinnedDensity { phsp, grid })
    }
}

/// A previously estimated binned density read back from a [`BinnedDensityStore`].
///
/// Unlike [`BinnedKernelDensity`] it owns its phase space and requires neither the original
/// [`Sample`] nor the kernel configuration, but satisfies the full [`Density`] capability.
#[derive(Clone, Debug)]
pub struct BinnedDensity<T, const P: usize> {
    phsp: PhaseSpace<T, P>,
    grid: BinGrid<T, P>,
}

impl<T, const P: usize> Density<T, P> for BinnedDensity<T, P>
where
    T: fXX + SampleUniform,
{
    fn phase_space(&self) -> &PhaseSpace<T, P> {
        &self.phsp
    }

    fn value(&self, x: &SVectorView<T, P>) -> Result<T, DensError<T>> {
        if !self.phsp.contains(x) {
            return Err(DensError::OutOfDomain {
                point: x.iter().copied().collect(),
            });
        }

        Ok(self.grid.interpolate(x))
    }

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

    fn generate(&self, size: usize, rng: &mut impl Rng) -> Result<Sample<T, P>, DensError<T>> {
        Ok(Sample(
            (0..size).map(|_| self.grid.sample_point(rng)).collect(),
        ))
    }
}
