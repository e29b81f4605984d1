//! Small numerical helpers.
//!
//! The [`fXX`](crate::fXX) trait combines `num_traits::Float` and `nalgebra::RealField`, which
//! both provide several identically named methods. The macros below disambiguate by always
//! calling the `num_traits::Float` variant.

/// A shorthand for converting constants to type `T`.
macro_rules! T {
    ($value: expr) => {
        T::from_f64($value).unwrap()
    };
}

macro_rules! floor {
    ($value: expr) => {
        num_traits::Float::floor($value)
    };
}

macro_rules! max {
    ($value_a: expr, $value_b: expr) => {
        num_traits::Float::max($value_a, $value_b)
    };
}

macro_rules! min {
    ($value_a: expr, $value_b: expr) => {
        num_traits::Float::min($value_a, $value_b)
    };
}

macro_rules! powi {
    ($value: expr, $integer: expr) => {
        num_traits::Float::powi($value, $integer)
    };
}

pub(crate) use T;
pub(crate) use floor;
pub(crate) use max;
pub(crate) use min;
pub(crate) use powi;
