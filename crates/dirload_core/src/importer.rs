//! The import orchestrator.
//!
//! A run moves through these steps:
//!
//! ```text
//! resolve suffixes ─▶ lock + clear ─▶ mark untrusted
//!   ─▶ phase one: migrate existing ─▶ workers ─▶ migrate excluded ─▶ stop writers
//!   ─▶ phase two: merge dn2id, then attribute streams
//!   ─▶ mark trusted ─▶ switch temporary containers ─▶ unlock
//! ```
//!
//! Cancellation may arrive at any point; running tasks drain and the run
//! reports [`ImportStatus::Interrupted`] instead of an error.

use crate::budget::{plan_phase_one, MemoryPlan, PlanRequest};
use crate::config::ImportConfig;
use crate::context::{CancelHandle, ImportContext};
use crate::dn_cache::DnCache;
use crate::error::{CoreError, CoreResult};
use crate::executor::{join_all, prefer_fatal, TaskPool};
use crate::manager::IndexManager;
use crate::migrate::Migration;
use crate::phase_one::{EntryFeed, EntryPolicy, ImportWorker, PhaseOne};
use crate::phase_two::run_phase_two;
use crate::progress::ProgressReporter;
use crate::registry::{IndexRegistry, StreamSet};
use crate::scratch::ScratchSpace;
use crate::source::EntrySource;
use crate::stats::{ImportReport, ImportStats, ImportStatus};
use crate::store::{EntryContainer, RootContainer};
use crate::suffix::Suffix;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bulk-loads entries into the suffixes of a root container.
///
/// # Example
///
/// ```
/// use dirload_core::{AttributeIndexConfig, Dn, Entry, ImportConfig, Importer, IndexKind};
/// use dirload_core::source::MemorySource;
/// use dirload_core::store::memory::MemoryRootContainer;
/// use std::sync::Arc;
///
/// let root = Arc::new(MemoryRootContainer::new());
/// root.add_suffix(
///     "dc=example,dc=com",
///     vec![AttributeIndexConfig::new("cn").with_kind(IndexKind::Equality)],
/// )?;
///
/// let source = Arc::new(MemorySource::new(vec![
///     Entry::new(Dn::parse("dc=example,dc=com")?),
///     Entry::new(Dn::parse("cn=bob,dc=example,dc=com")?).with_value("cn", "bob"),
/// ]));
///
/// let importer = Importer::new(ImportConfig::new().thread_count(2), root);
/// let report = importer.import(source)?;
/// assert!(report.is_completed());
/// assert_eq!(report.progress.imported, 2);
/// # Ok::<(), dirload_core::CoreError>(())
/// ```
pub struct Importer {
    config: ImportConfig,
    root: Arc<dyn RootContainer>,
    cancel: CancelHandle,
    stats: Arc<ImportStats>,
}

impl Importer {
    /// Creates an importer writing into `root`.
    pub fn new(config: ImportConfig, root: Arc<dyn RootContainer>) -> Self {
        Self {
            config,
            root,
            cancel: CancelHandle::new(),
            stats: Arc::new(ImportStats::new()),
        }
    }

    /// Returns a handle that interrupts the run from another thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Returns the live counters of the run.
    #[must_use]
    pub fn stats(&self) -> Arc<ImportStats> {
        Arc::clone(&self.stats)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Imports every entry of `source`.
    ///
    /// Entries that fail validation are rejected through the source and do
    /// not fail the run.
    ///
    /// # Errors
    ///
    /// Returns an error if no suffix takes part in the import, if the
    /// memory budget cannot fit a single worker, or if a task fails
    /// fatally. Cancellation is not an error; it yields a report with
    /// [`ImportStatus::Interrupted`].
    pub fn import(&self, source: Arc<dyn EntrySource>) -> CoreResult<ImportReport> {
        let mut registry = IndexRegistry::default();
        let suffixes = self.resolve_suffixes(&mut registry)?;
        let locks = ContainerLocks::acquire(&suffixes)?;

        let outcome = match self.run(&suffixes, registry, &source) {
            Ok(report) if report.is_completed() => self.switch_containers(&suffixes).map(|()| report),
            Ok(report) => {
                discard_temporary_containers(&suffixes);
                Ok(report)
            }
            Err(err) => {
                discard_temporary_containers(&suffixes);
                Err(err)
            }
        };
        drop(locks);

        if let Ok(report) = &outcome {
            info!(
                status = ?report.status,
                read = report.progress.read,
                imported = report.progress.imported,
                rejected = report.progress.rejected,
                ignored = report.progress.ignored,
                migrated = report.progress.migrated,
                rate = %format!("{:.1}/s", report.import_rate()),
                "import finished"
            );
        }
        outcome
    }

    /// Builds one suffix per base DN and registers its index streams.
    fn resolve_suffixes(&self, registry: &mut IndexRegistry) -> CoreResult<Vec<Arc<Suffix>>> {
        let mut bases = self.root.base_dns();
        bases.sort_by_key(|dn| dn.normalized());

        let mut suffixes = Vec::with_capacity(bases.len());
        for base in bases {
            let Some(container) = self.root.entry_container(&base) else {
                continue;
            };
            let Some(mut suffix) = Suffix::resolve(&*self.root, container, &self.config)? else {
                continue;
            };
            suffix.streams = StreamSet::register_all(registry, &**suffix.container());
            debug!(base = %suffix.base(), container = %suffix.container().name(), "suffix resolved");
            suffixes.push(Arc::new(suffix));
        }

        if suffixes.is_empty() {
            return Err(CoreError::invalid_configuration(
                "no base DN takes part in the import",
            ));
        }
        Ok(suffixes)
    }

    fn run(
        &self,
        suffixes: &[Arc<Suffix>],
        registry: IndexRegistry,
        source: &Arc<dyn EntrySource>,
    ) -> CoreResult<ImportReport> {
        let config = &self.config;
        let cleared = !config.append;
        let validating = !config.skip_dn_validation;

        for suffix in suffixes {
            if cleared && suffix.source().is_none() {
                debug!(base = %suffix.base(), "clearing the destination container");
                suffix.container().clear()?;
            }
            set_trusted(suffix, false)?;
        }

        let index_count = 2 + suffixes
            .iter()
            .flat_map(|suffix| suffix.container().attribute_indexes())
            .map(|index| index.config().planned_index_count())
            .sum::<usize>();
        let plan = plan_phase_one(
            &PlanRequest {
                total_memory: config.available_memory,
                index_count,
                thread_count: config.thread_count,
                needs_dn_cache: validating,
                validating,
                cleared,
                rebuild: false,
            },
            &config.tuning,
        )?;

        let scratch = match &config.scratch_dir {
            Some(dir) => ScratchSpace::open(dir, &config.backend_id)?,
            None => ScratchSpace::in_memory(),
        };
        let ctx = Arc::new(ImportContext::new(
            self.cancel.clone(),
            Arc::clone(&self.stats),
            config.tuning.clone(),
            scratch,
            registry,
        ));
        let reporter = ProgressReporter::start(config.progress_interval, Arc::clone(source), Arc::clone(&self.stats));
        let outcome = self.run_phases(&ctx, suffixes, source, &plan);
        if let Some(reporter) = reporter {
            reporter.stop();
        }
        ctx.scratch.cleanup();
        outcome
    }

    fn run_phases(
        &self,
        ctx: &Arc<ImportContext>,
        suffixes: &[Arc<Suffix>],
        source: &Arc<dyn EntrySource>,
        plan: &MemoryPlan,
    ) -> CoreResult<ImportReport> {
        let dn_cache = if self.config.skip_dn_validation {
            None
        } else {
            Some(Arc::new(DnCache::new(ctx.scratch.create("dn-cache")?)))
        };

        info!(
            run = %ctx.run_id,
            suffixes = suffixes.len(),
            threads = plan.thread_count,
            append = self.config.append,
            "phase one started"
        );
        let started = Instant::now();
        let loaded = self.phase_one(ctx, suffixes, source, plan, dn_cache.as_ref());
        if let Some(cache) = &dn_cache {
            if let Err(err) = cache.shutdown() {
                warn!(error = %err, "could not drop the DN cache");
            }
        }
        let phase_one = started.elapsed();

        let managers = match loaded {
            Ok(managers) if !ctx.is_canceled() => managers,
            Ok(managers) => {
                cleanup(&managers);
                return Ok(self.report(ImportStatus::Interrupted, source, plan, phase_one, Duration::ZERO));
            }
            Err(err) if err.is_canceled() => {
                return Ok(self.report(ImportStatus::Interrupted, source, plan, phase_one, Duration::ZERO));
            }
            Err(err) => return Err(err),
        };
        info!(
            imported = self.stats.imported(),
            migrated = self.stats.migrated(),
            scratch_files = managers.len(),
            elapsed_ms = phase_one.as_millis() as u64,
            "phase one finished"
        );

        let started = Instant::now();
        match run_phase_two(ctx, managers, plan.merge_memory(), plan.buffer_size) {
            Ok(_) => {}
            Err(err) if err.is_canceled() => {
                return Ok(self.report(
                    ImportStatus::Interrupted,
                    source,
                    plan,
                    phase_one,
                    started.elapsed(),
                ));
            }
            Err(err) => return Err(err),
        }
        let phase_two = started.elapsed();
        info!(
            indexes = self.stats.indexes_merged(),
            keys = self.stats.keys_written(),
            elapsed_ms = phase_two.as_millis() as u64,
            "phase two finished"
        );

        for suffix in suffixes {
            set_trusted(suffix, true)?;
        }
        Ok(self.report(ImportStatus::Completed, source, plan, phase_one, phase_two))
    }

    /// Runs phase one and returns the scratch files to merge.
    fn phase_one(
        &self,
        ctx: &Arc<ImportContext>,
        suffixes: &[Arc<Suffix>],
        source: &Arc<dyn EntrySource>,
        plan: &MemoryPlan,
        dn_cache: Option<&Arc<DnCache>>,
    ) -> CoreResult<Vec<Arc<IndexManager>>> {
        let phase = PhaseOne::start(Arc::clone(ctx), plan)?;
        let loaded = self.load(&phase, suffixes, source, plan, dn_cache);
        if let Err(err) = &loaded {
            ctx.abort("phase one", err);
        }

        match (loaded, phase.finish()) {
            (Ok(()), finished) => finished,
            (Err(err), Ok(managers)) => {
                cleanup(&managers);
                Err(err)
            }
            (Err(err), Err(finish_err)) => Err(prefer_fatal(Some(err), finish_err)),
        }
    }

    fn load(
        &self,
        phase: &Arc<PhaseOne>,
        suffixes: &[Arc<Suffix>],
        source: &Arc<dyn EntrySource>,
        plan: &MemoryPlan,
        dn_cache: Option<&Arc<DnCache>>,
    ) -> CoreResult<()> {
        let cache = dn_cache.map(|cache| &**cache);
        for suffix in suffixes {
            Migration::new(suffix, &*self.root, phase, cache).migrate_existing()?;
        }

        let policy = if self.config.append && self.config.replace_existing {
            EntryPolicy::AppendReplace
        } else {
            EntryPolicy::Import
        };
        let feed = Arc::new(EntryFeed::new(
            Arc::clone(source),
            Arc::clone(&self.root),
            suffixes.to_vec(),
            dn_cache.is_some(),
        ));
        let pool = TaskPool::new("dirload-import", plan.thread_count)?;
        let handles: Vec<_> = (0..plan.thread_count)
            .map(|n| {
                let worker = ImportWorker::new(
                    Arc::clone(phase),
                    Arc::clone(&feed),
                    dn_cache.cloned(),
                    !self.config.append,
                    policy,
                );
                pool.submit(format!("import worker {n}"), move || worker.run())
            })
            .collect();
        let joined = join_all(handles);
        pool.shutdown();
        joined?;

        for suffix in suffixes {
            Migration::new(suffix, &*self.root, phase, cache).migrate_excluded()?;
        }
        Ok(())
    }

    /// Replaces each migrated container by the temporary one it was
    /// imported into.
    fn switch_containers(&self, suffixes: &[Arc<Suffix>]) -> CoreResult<()> {
        for suffix in suffixes {
            let Some(old) = suffix.source() else {
                continue;
            };
            let base = suffix.base();
            self.root.unregister(base);
            old.delete()?;
            self.root.register(base, Arc::clone(suffix.container()))?;
            info!(base = %base, container = %suffix.container().name(), "switched to the imported container");
        }
        Ok(())
    }

    fn report(
        &self,
        status: ImportStatus,
        source: &Arc<dyn EntrySource>,
        plan: &MemoryPlan,
        phase_one: Duration,
        phase_two: Duration,
    ) -> ImportReport {
        ImportReport {
            status,
            progress: self.stats.snapshot(
                source.entries_read(),
                source.entries_rejected(),
                source.entries_ignored(),
            ),
            phase_one,
            phase_two,
            thread_count: plan.thread_count,
            thread_count_reduced: plan.thread_count_reduced(),
            plan: plan.clone(),
        }
    }
}

/// Sets the trusted flag of every tree a suffix writes.
fn set_trusted(suffix: &Suffix, trusted: bool) -> CoreResult<()> {
    let container = suffix.container();
    container.id2children().set_trusted(trusted)?;
    container.id2subtree().set_trusted(trusted)?;
    container.dn2uri().set_trusted(trusted)?;
    for tree in suffix.streams.attribute_trees() {
        tree.set_trusted(trusted)?;
    }
    Ok(())
}

fn cleanup(managers: &[Arc<IndexManager>]) {
    for manager in managers {
        manager.cleanup();
    }
}

fn discard_temporary_containers(suffixes: &[Arc<Suffix>]) {
    for suffix in suffixes.iter().filter(|suffix| suffix.source().is_some()) {
        if let Err(err) = suffix.container().delete() {
            warn!(base = %suffix.base(), error = %err, "could not delete the temporary container");
        }
    }
}

/// Holds the locks of every container a run touches.
struct ContainerLocks {
    held: Vec<Arc<dyn EntryContainer>>,
}

impl ContainerLocks {
    fn acquire(suffixes: &[Arc<Suffix>]) -> CoreResult<Self> {
        let mut locks = Self { held: Vec::new() };
        for suffix in suffixes {
            for container in std::iter::once(suffix.container()).chain(suffix.source()) {
                container.lock()?;
                locks.held.push(Arc::clone(container));
            }
        }
        Ok(locks)
    }
}

impl Drop for ContainerLocks {
    fn drop(&mut self) {
        for container in self.held.drain(..) {
            container.unlock();
        }
    }
}
