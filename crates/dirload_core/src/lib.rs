//! # dirload core
//!
//! Two-phase bulk-load and index-rebuild engine for LDAP directory stores.
//!
//! An import never updates an index tree entry by entry. Instead:
//!
//! - **Phase one** reads entries, writes them to id2entry and buffers every
//!   index key they produce. Full buffers are sorted by a thread pool and
//!   appended as sorted runs to one scratch file per index stream.
//! - **Phase two** merges the runs of every scratch file with a k-way heap
//!   and writes each key once, with the merged set of entry ids.
//!
//! The DN stream additionally builds dn2id, id2children and id2subtree in
//! key order, so parents always precede their children.
//!
//! This crate provides:
//! - [`Importer`] for LDIF-style bulk loads, including append/replace and
//!   include/exclude branch migration
//! - [`IndexRebuilder`] for rebuilding some or all indexes of a suffix
//! - The collaborator traits in [`store`] and [`source`], with in-memory
//!   implementations for tests and embedders
//! - The memory planner in [`budget`]
//!
//! ## Example
//!
//! ```rust
//! use dirload_core::store::memory::MemoryRootContainer;
//! use dirload_core::{ImportConfig, Importer, LdifReader};
//! use std::sync::Arc;
//!
//! let root = Arc::new(MemoryRootContainer::new());
//! root.add_suffix("dc=example,dc=com", Vec::new())?;
//!
//! let ldif = "dn: dc=example,dc=com\nobjectClass: domain\n\n\
//!             dn: ou=people,dc=example,dc=com\nobjectClass: organizationalUnit\n";
//! let source = Arc::new(LdifReader::new(ldif.as_bytes()));
//!
//! let report = Importer::new(ImportConfig::new(), root).import(source)?;
//! assert_eq!(report.progress.imported, 2);
//! # Ok::<(), dirload_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod budget;
pub mod config;
mod context;
pub mod dn;
mod dn_cache;
pub mod entry;
pub mod error;
mod executor;
pub mod id_set;
mod importer;
pub mod index;
pub mod ldif;
mod manager;
mod migrate;
pub mod packed;
mod phase_one;
mod phase_two;
mod progress;
mod rebuild;
mod registry;
mod scratch;
pub mod source;
pub mod stats;
pub mod store;
mod suffix;
pub mod types;

pub use budget::{MemoryPlan, MergePlan, PlanRequest};
pub use config::{ImportConfig, RebuildConfig, RebuildMode, TuningConfig};
pub use context::CancelHandle;
pub use dn::{Dn, Rdn};
pub use dn_cache::fnv1a;
pub use entry::Entry;
pub use error::{CoreError, CoreResult};
pub use id_set::{EntryIdSet, ImportIdSet};
pub use importer::Importer;
pub use index::{AttributeIndexConfig, IndexKind};
pub use ldif::LdifReader;
pub use rebuild::IndexRebuilder;
pub use source::{EntrySource, MemorySource, Rejection};
pub use stats::{ImportProgress, ImportReport, ImportStats, ImportStatus};
pub use types::{EntryId, IndexId};
