//! # dirload testkit
//!
//! Test utilities for the dirload bulk-load engine.
//!
//! This crate provides:
//! - Fixtures: an in-memory directory with a configured suffix, sample
//!   entry trees and LDIF rendering
//! - Property-based test generators using proptest
//! - Cross-crate integration checks for the DN trees and indexes
//! - Test logging initialisation
//!
//! ## Usage
//!
//! ```rust
//! use dirload_testkit::prelude::*;
//!
//! let dir = TestDirectory::new();
//! let report = dir.import(sample_entries(), dir.config()).unwrap();
//! assert_eq!(report.progress.imported, 3);
//! assert!(dir.entry_id("cn=bob,ou=people,dc=example,dc=com").is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::logging::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use logging::*;
