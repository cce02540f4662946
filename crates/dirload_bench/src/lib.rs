//! Benchmark helpers for dirload.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
