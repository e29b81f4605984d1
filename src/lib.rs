#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

pub mod dens;
mod math;
pub mod phsp;

use dens::{DensError, StoreError};
use nalgebra::{RealField, Scalar};
use num_traits::{AsPrimitive, Float, FromPrimitive, float::TotalOrder};
use phsp::PhspError;
use std::{
    fmt::{Debug, Display},
    iter::Sum,
};
use thiserror::Error;

/// Generic container type for errors.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum BinKdeError<T> {
    #[error("density error")]
    Dens(#[from] DensError<T>),
    #[error("phase space error")]
    Phsp(#[from] PhspError<T>),
    #[error("store error")]
    Store(#[from] StoreError),
}

/// A trait that describes a generic floating point number within the **binkde** crate. In
/// practical terms this trait is only used for the f32/f64 types.
#[allow(non_camel_case_types)]
pub trait fXX:
    'static
    + AsPrimitive<usize>
    + Copy
    + Debug
    + Default
    + Display
    + Float
    + FromPrimitive
    + RealField
    + Scalar
    + Send
    + Sum
    + for<'x> Sum<&'x Self>
    + Sync
    + TotalOrder
{
}

impl fXX for f32 {}
impl fXX for f64 {}
