//! Import and rebuild configuration.
//!
//! All thresholds the engine uses are exposed in [`TuningConfig`]; the
//! defaults are values that have worked well for multi-million entry loads.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const KB: usize = 1024;
const MB: u64 = 1024 * 1024;

/// Tunable thresholds for memory planning and task batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Largest phase-one buffer.
    pub max_buffer_size: usize,
    /// Smallest phase-one buffer before the thread count is reduced.
    pub min_buffer_size: usize,
    /// Smallest phase-two read-ahead window.
    pub min_read_ahead_size: usize,
    /// Memory reserved per index for file I/O buffers.
    pub per_index_io_reserve: usize,
    /// Database cache size when memory is plentiful.
    pub max_db_cache_size: u64,
    /// Database cache size when memory is tight.
    pub min_db_cache_size: u64,
    /// Usable memory below which caches fall back to their minimum.
    pub min_db_cache_memory: u64,
    /// Heaps at or below this size get a smaller share for the import.
    pub small_heap_size: u64,
    /// Memory assumed to be left for everything but the import.
    pub minimum_available_memory: u64,
    /// Share of available memory given to the import, in percent.
    pub import_memory_percent: u64,
    /// Percentage points removed from the share on small heaps.
    pub small_heap_penalty_percent: u64,
    /// Percentage points removed from the share when rebuilding.
    pub rebuild_penalty_percent: u64,
    /// Extra queued buffers a scratch writer merges in one pass.
    pub drain_batch: usize,
    /// Parent entries accumulated per child/subtree map before flushing.
    pub dn_state_flush_threshold: usize,
    /// Phase-one buffers per index and worker thread.
    pub phase_one_buffers_per_thread: usize,
    /// Writer-side buffers per index.
    pub writer_buffers_per_index: usize,
    /// Merge threads planned for at first, even on fewer processors.
    pub phase_two_planned_threads: usize,
    /// Smallest phase-two merge pool.
    pub phase_two_min_threads: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 2 * MB as usize,
            min_buffer_size: 4 * KB,
            min_read_ahead_size: 2 * KB,
            per_index_io_reserve: 8 * KB,
            max_db_cache_size: 8 * MB,
            min_db_cache_size: 4 * MB,
            min_db_cache_memory: 18 * MB,
            small_heap_size: 256 * MB,
            minimum_available_memory: 32 * MB,
            import_memory_percent: 90,
            small_heap_penalty_percent: 25,
            rebuild_penalty_percent: 15,
            drain_batch: 3,
            dn_state_flush_threshold: 64 * KB,
            phase_one_buffers_per_thread: 2,
            writer_buffers_per_index: 4,
            phase_two_planned_threads: 4,
            phase_two_min_threads: 2,
        }
    }
}

/// Configuration for one LDIF (or other entry stream) import.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Requested worker threads for phase one.
    pub thread_count: usize,
    /// Add to existing data instead of replacing it.
    pub append: bool,
    /// In append mode, replace entries that already exist.
    pub replace_existing: bool,
    /// Clear every suffix before loading, even with several base DNs.
    pub clear_backend: bool,
    /// Trust the source for parent existence and DN uniqueness.
    pub skip_dn_validation: bool,
    /// Only entries under these branches are loaded from the source.
    pub include_branches: Vec<String>,
    /// Entries under these branches are kept from the existing data.
    pub exclude_branches: Vec<String>,
    /// Directory for scratch files. `None` keeps scratch data in memory.
    pub scratch_dir: Option<PathBuf>,
    /// Identifier of the backend, used to name the scratch subdirectory.
    pub backend_id: String,
    /// Memory the import may plan with.
    pub available_memory: u64,
    /// Interval of progress log lines. `None` disables the reporter.
    pub progress_interval: Option<Duration>,
    /// Thresholds for planning and batching.
    pub tuning: TuningConfig,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            append: false,
            replace_existing: false,
            clear_backend: false,
            skip_dn_validation: false,
            include_branches: Vec::new(),
            exclude_branches: Vec::new(),
            scratch_dir: None,
            backend_id: "userRoot".to_string(),
            available_memory: 512 * MB,
            progress_interval: Some(Duration::from_secs(10)),
            tuning: TuningConfig::default(),
        }
    }
}

/// Twice the number of processors, as entry processing mostly waits on
/// buffer hand-offs rather than the CPU.
#[must_use]
pub fn default_thread_count() -> usize {
    (num_cpus::get() * 2).max(1)
}

impl ImportConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the requested phase-one thread count.
    #[must_use]
    pub const fn thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    /// Sets append mode.
    #[must_use]
    pub const fn append(mut self, value: bool) -> Self {
        self.append = value;
        self
    }

    /// Sets whether existing entries are replaced in append mode.
    #[must_use]
    pub const fn replace_existing(mut self, value: bool) -> Self {
        self.replace_existing = value;
        self
    }

    /// Sets whether every suffix is cleared first.
    #[must_use]
    pub const fn clear_backend(mut self, value: bool) -> Self {
        self.clear_backend = value;
        self
    }

    /// Sets whether DN validation is skipped.
    #[must_use]
    pub const fn skip_dn_validation(mut self, value: bool) -> Self {
        self.skip_dn_validation = value;
        self
    }

    /// Adds an include branch.
    #[must_use]
    pub fn include_branch(mut self, dn: impl Into<String>) -> Self {
        self.include_branches.push(dn.into());
        self
    }

    /// Adds an exclude branch.
    #[must_use]
    pub fn exclude_branch(mut self, dn: impl Into<String>) -> Self {
        self.exclude_branches.push(dn.into());
        self
    }

    /// Sets the scratch directory.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Sets the backend identifier.
    #[must_use]
    pub fn backend_id(mut self, id: impl Into<String>) -> Self {
        self.backend_id = id.into();
        self
    }

    /// Sets the memory available for planning.
    #[must_use]
    pub const fn available_memory(mut self, bytes: u64) -> Self {
        self.available_memory = bytes;
        self
    }

    /// Sets the progress interval.
    #[must_use]
    pub const fn progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Replaces the tuning thresholds.
    #[must_use]
    pub fn tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }
}

/// Which indexes a rebuild touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildMode {
    /// Every index of the suffix, including dn2id and its derived trees.
    All,
    /// Only indexes currently marked untrusted.
    Degraded,
    /// The listed indexes: `dn2id`, `dn2uri`, `id2children`, `id2subtree`,
    /// `<attribute>` or `<attribute>.<kind>`.
    UserDefined(Vec<String>),
}

/// Configuration for rebuilding the indexes of one suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Base DN of the suffix to rebuild.
    pub base_dn: String,
    /// Which indexes to rebuild.
    pub mode: RebuildMode,
    /// Only mark the selected indexes trusted again, without rebuilding.
    pub clear_degraded_state: bool,
    /// Requested worker threads for phase one.
    pub thread_count: usize,
    /// Directory for scratch files. `None` keeps scratch data in memory.
    pub scratch_dir: Option<PathBuf>,
    /// Memory the rebuild may plan with.
    pub available_memory: u64,
    /// How often progress is logged. `None` disables progress logging.
    pub progress_interval: Option<Duration>,
    /// Thresholds for planning and batching.
    pub tuning: TuningConfig,
}

impl RebuildConfig {
    /// Creates a configuration that rebuilds every index of `base_dn`.
    #[must_use]
    pub fn new(base_dn: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            mode: RebuildMode::All,
            clear_degraded_state: false,
            thread_count: default_thread_count(),
            scratch_dir: None,
            available_memory: 512 * MB,
            progress_interval: None,
            tuning: TuningConfig::default(),
        }
    }

    /// Sets the rebuild mode.
    #[must_use]
    pub fn mode(mut self, mode: RebuildMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets whether only the degraded state is cleared.
    #[must_use]
    pub const fn clear_degraded_state(mut self, value: bool) -> Self {
        self.clear_degraded_state = value;
        self
    }

    /// Sets the requested phase-one thread count.
    #[must_use]
    pub const fn thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    /// Sets the scratch directory.
    #[must_use]
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Sets the memory available for planning.
    #[must_use]
    pub const fn available_memory(mut self, bytes: u64) -> Self {
        self.available_memory = bytes;
        self
    }

    /// Sets the progress interval.
    #[must_use]
    pub const fn progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Replaces the tuning thresholds.
    #[must_use]
    pub fn tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ImportConfig::default();
        assert!(config.thread_count >= 1);
        assert!(!config.append);
        assert!(!config.skip_dn_validation);
        assert!(config.scratch_dir.is_none());
        assert_eq!(config.tuning.drain_batch, 3);
        assert_eq!(config.tuning.max_buffer_size, 2 * 1024 * 1024);
    }

    #[test]
    fn builder_pattern() {
        let config = ImportConfig::new()
            .thread_count(4)
            .append(true)
            .replace_existing(true)
            .include_branch("ou=people,dc=example,dc=com")
            .available_memory(64 * MB);

        assert_eq!(config.thread_count, 4);
        assert!(config.append && config.replace_existing);
        assert_eq!(config.include_branches.len(), 1);
        assert_eq!(config.available_memory, 64 * MB);
    }

    #[test]
    fn tuning_loads_from_partial_json() {
        let tuning: TuningConfig =
            serde_json::from_str(r#"{ "drain_batch": 8, "min_buffer_size": 1024 }"#).unwrap();
        assert_eq!(tuning.drain_batch, 8);
        assert_eq!(tuning.min_buffer_size, 1024);
        assert_eq!(tuning.max_buffer_size, TuningConfig::default().max_buffer_size);
    }

    #[test]
    fn rebuild_builder() {
        let config = RebuildConfig::new("dc=example,dc=com")
            .mode(RebuildMode::UserDefined(vec!["cn.equality".into()]))
            .thread_count(2);
        assert_eq!(config.thread_count, 2);
        assert!(matches!(config.mode, RebuildMode::UserDefined(ref list) if list.len() == 1));
    }
}
