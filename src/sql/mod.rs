//! SQL statement construction
//!
//! Typed builders for the statements the mapper issues.

pub mod builder;

pub use builder::{Insert, OnConflict, Select};
