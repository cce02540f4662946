//! Index definitions, index stream identity and key extraction.
//!
//! Every configured attribute index is split into one sortable stream per
//! [`IndexKind`]. The [`IndexKey`] of a stream is its identity during phase
//! one: buffers, scratch writers and scratch files are all per `IndexKey`.
//!
//! # Index Types
//!
//! - equality / ordering: normalised values
//! - presence: a single key per attribute
//! - substring: fixed-length substrings of every value suffix
//! - approximate: phonetic codes
//! - extensible substring / shared: matching-rule specific keys

mod attribute;
mod definition;
mod key;
mod kind;

pub use attribute::AttributeIndex;
pub use definition::{AttributeIndexConfig, ExtensibleRule, DEFAULT_ENTRY_LIMIT};
pub use key::{IndexKey, KeyComparator};
pub use kind::IndexKind;
