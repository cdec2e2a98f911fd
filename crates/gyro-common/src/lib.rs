//! Common utilities for gyro
//!
//! This crate provides the error type shared by the gyro crates.

pub mod error;

pub use error::{GyroError, Result};
