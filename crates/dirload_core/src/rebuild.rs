//! Rebuilds the indexes of one suffix from its id2entry tree.
//!
//! Selected trees are cleared and marked untrusted, then every entry is
//! scanned by the phase-one workers and the resulting scratch files are
//! merged by phase two, exactly like an import that never touches
//! id2entry.

use crate::budget::{plan_phase_one, MemoryPlan, PlanRequest};
use crate::config::{RebuildConfig, RebuildMode};
use crate::context::{CancelHandle, ImportContext};
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{CoreError, CoreResult};
use crate::executor::{join_all, prefer_fatal, TaskPool};
use crate::index::{AttributeIndex, IndexKind};
use crate::manager::IndexManager;
use crate::phase_one::{KeyEmitter, PhaseOne};
use crate::phase_two::run_phase_two;
use crate::progress::ProgressReporter;
use crate::registry::{DnTargets, IndexRegistry, StreamSet};
use crate::scratch::ScratchSpace;
use crate::source::{EntrySource, SourceCounters};
use crate::stats::{ImportReport, ImportStats, ImportStatus};
use crate::store::{EntryContainer, EntryTree, IndexTree, ReferralTree, RootContainer};
use crate::types::EntryId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Rebuilds some or all indexes of one base DN.
pub struct IndexRebuilder {
    config: RebuildConfig,
    root: Arc<dyn RootContainer>,
    cancel: CancelHandle,
    stats: Arc<ImportStats>,
}

impl IndexRebuilder {
    /// Creates a rebuilder for the suffix `config.base_dn` of `root`.
    pub fn new(config: RebuildConfig, root: Arc<dyn RootContainer>) -> Self {
        Self {
            config,
            root,
            cancel: CancelHandle::new(),
            stats: Arc::new(ImportStats::new()),
        }
    }

    /// Returns a handle that interrupts the rebuild.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Returns the live counters; `imported` counts processed entries.
    #[must_use]
    pub fn stats(&self) -> Arc<ImportStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for an unknown base DN or
    /// index name, and any fatal error of the two phases.
    pub fn rebuild(&self) -> CoreResult<ImportReport> {
        let base = Dn::parse(&self.config.base_dn)?;
        let container = self.root.entry_container(&base).ok_or_else(|| {
            CoreError::invalid_configuration(format!("no entry container for '{base}'"))
        })?;
        let selection = Selection::resolve(&self.config.mode, &*container)?;

        container.lock()?;
        let outcome = self.rebuild_locked(&base, &container, &selection);
        container.unlock();
        outcome
    }

    fn rebuild_locked(
        &self,
        base: &Dn,
        container: &Arc<dyn EntryContainer>,
        selection: &Selection,
    ) -> CoreResult<ImportReport> {
        if self.config.clear_degraded_state {
            selection.set_trusted(&**container, true)?;
            info!(base = %base, indexes = ?selection.names(), "cleared degraded state");
            return Ok(self.report(ImportStatus::Completed, 0, &MemoryPlan::default(), Duration::ZERO, Duration::ZERO));
        }
        if selection.is_empty() {
            info!(base = %base, "no index needs rebuilding");
            return Ok(self.report(ImportStatus::Completed, 0, &MemoryPlan::default(), Duration::ZERO, Duration::ZERO));
        }

        info!(base = %base, indexes = ?selection.names(), "rebuilding indexes");
        selection.clear(&**container)?;
        selection.set_trusted(&**container, false)?;

        let mut registry = IndexRegistry::default();
        let dn_targets = selection.wants_dn_stream().then(|| DnTargets {
            dn2id: container.dn2id(),
            write_dn2id: selection.dn2id,
            children: selection.children.then(|| container.id2children()),
            subtree: selection.subtree.then(|| container.id2subtree()),
        });
        let streams = StreamSet::register(
            &mut registry,
            dn_targets,
            container.attribute_indexes(),
            |index, kind| selection.includes(index, kind),
        );

        let index_count = registry.len() + usize::from(selection.dn2uri);
        let plan = plan_phase_one(
            &PlanRequest {
                total_memory: self.config.available_memory,
                index_count: index_count.max(1),
                thread_count: self.config.thread_count,
                needs_dn_cache: false,
                validating: false,
                cleared: true,
                rebuild: true,
            },
            &self.config.tuning,
        )?;
        let scratch = match &self.config.scratch_dir {
            Some(dir) => ScratchSpace::open(dir, &format!("rebuild-{}", container.name()))?,
            None => ScratchSpace::in_memory(),
        };
        let ctx = Arc::new(ImportContext::new(
            self.cancel.clone(),
            Arc::clone(&self.stats),
            self.config.tuning.clone(),
            scratch,
            registry,
        ));

        let scan = Arc::new(EntryScan::new(container.id2entry()));
        let job = RebuildJob {
            base: base.clone(),
            streams: Arc::new(streams),
            dn2uri: selection.dn2uri.then(|| container.dn2uri()),
            scan,
        };
        let source: Arc<dyn EntrySource> = job.scan.clone();
        let reporter = ProgressReporter::start(self.config.progress_interval, source, Arc::clone(&self.stats));
        let outcome = self.run_phases(&ctx, &job, &plan);
        if let Some(reporter) = reporter {
            reporter.stop();
        }
        ctx.scratch.cleanup();

        let report = outcome?;
        if report.is_completed() {
            selection.set_trusted(&**container, true)?;
        }
        info!(
            base = %base,
            status = ?report.status,
            processed = report.progress.imported,
            rate = %format!("{:.1}/s", report.import_rate()),
            "rebuild finished"
        );
        Ok(report)
    }

    fn run_phases(&self, ctx: &Arc<ImportContext>, job: &RebuildJob, plan: &MemoryPlan) -> CoreResult<ImportReport> {
        let started = Instant::now();
        let scanned = self.phase_one(ctx, job, plan);
        let phase_one = started.elapsed();
        let read = job.scan.entries_read();

        let managers = match scanned {
            Ok(managers) if !ctx.is_canceled() => managers,
            Ok(managers) => {
                for manager in &managers {
                    manager.cleanup();
                }
                return Ok(self.report(ImportStatus::Interrupted, read, plan, phase_one, Duration::ZERO));
            }
            Err(err) if err.is_canceled() => {
                return Ok(self.report(ImportStatus::Interrupted, read, plan, phase_one, Duration::ZERO));
            }
            Err(err) => return Err(err),
        };
        debug!(processed = self.stats.imported(), scratch_files = managers.len(), "rebuild scan finished");

        let started = Instant::now();
        let status = match run_phase_two(ctx, managers, plan.merge_memory(), plan.buffer_size) {
            Ok(_) => ImportStatus::Completed,
            Err(err) if err.is_canceled() => ImportStatus::Interrupted,
            Err(err) => return Err(err),
        };
        Ok(self.report(status, read, plan, phase_one, started.elapsed()))
    }

    fn phase_one(
        &self,
        ctx: &Arc<ImportContext>,
        job: &RebuildJob,
        plan: &MemoryPlan,
    ) -> CoreResult<Vec<Arc<IndexManager>>> {
        let phase = PhaseOne::start(Arc::clone(ctx), plan)?;

        let pool = TaskPool::new("dirload-rebuild", plan.thread_count)?;
        let handles: Vec<_> = (0..plan.thread_count)
            .map(|n| {
                let worker = RebuildWorker {
                    phase: Arc::clone(&phase),
                    job: job.clone(),
                };
                pool.submit(format!("rebuild worker {n}"), move || worker.run())
            })
            .collect();
        let scanned = join_all(handles).map(|_| ());
        pool.shutdown();

        match (scanned, phase.finish()) {
            (Ok(()), finished) => finished,
            (Err(err), Ok(managers)) => {
                for manager in &managers {
                    manager.cleanup();
                }
                Err(err)
            }
            (Err(err), Err(finish_err)) => Err(prefer_fatal(Some(err), finish_err)),
        }
    }

    fn report(
        &self,
        status: ImportStatus,
        read: u64,
        plan: &MemoryPlan,
        phase_one: Duration,
        phase_two: Duration,
    ) -> ImportReport {
        ImportReport {
            status,
            progress: self.stats.snapshot(read, 0, 0),
            phase_one,
            phase_two,
            thread_count: plan.thread_count,
            thread_count_reduced: plan.thread_count_reduced(),
            plan: plan.clone(),
        }
    }
}

/// The trees one rebuild writes.
#[derive(Debug, Default, PartialEq, Eq)]
struct Selection {
    dn2id: bool,
    children: bool,
    subtree: bool,
    dn2uri: bool,
    attributes: BTreeSet<(String, IndexKind)>,
}

impl Selection {
    fn resolve(mode: &RebuildMode, container: &dyn EntryContainer) -> CoreResult<Self> {
        let indexes = container.attribute_indexes();
        let mut selection = Self::default();
        match mode {
            RebuildMode::All => {
                selection.dn2id = true;
                selection.children = true;
                selection.subtree = true;
                selection.dn2uri = true;
                for index in &indexes {
                    selection.add_all(index);
                }
            }
            RebuildMode::Degraded => {
                selection.children = !container.id2children().is_trusted();
                selection.subtree = !container.id2subtree().is_trusted();
                selection.dn2uri = !container.dn2uri().is_trusted();
                for index in &indexes {
                    for (kind, tree) in index.trees() {
                        if !tree.is_trusted() {
                            selection.add(index, kind);
                        }
                    }
                }
            }
            RebuildMode::UserDefined(names) => {
                for name in names {
                    selection.add_named(name, &indexes)?;
                }
            }
        }
        Ok(selection)
    }

    fn add_named(&mut self, name: &str, indexes: &[Arc<AttributeIndex>]) -> CoreResult<()> {
        let lower = name.trim().to_ascii_lowercase();
        match lower.as_str() {
            "dn2id" => {
                self.dn2id = true;
                self.children = true;
                self.subtree = true;
            }
            "id2children" => self.children = true,
            "id2subtree" => self.subtree = true,
            "dn2uri" => self.dn2uri = true,
            other => {
                let (attribute, kind) = match other.split_once('.') {
                    Some((attribute, kind)) => {
                        let kind = IndexKind::from_name(kind).ok_or_else(|| {
                            CoreError::invalid_configuration(format!("unknown index kind in '{name}'"))
                        })?;
                        (attribute, Some(kind))
                    }
                    None => (other, None),
                };
                let index = indexes
                    .iter()
                    .find(|index| index.attribute().eq_ignore_ascii_case(attribute))
                    .ok_or_else(|| CoreError::invalid_configuration(format!("no index named '{name}'")))?;
                match kind {
                    Some(kind) if index.tree(kind).is_some() => self.add(index, kind),
                    Some(_) => {
                        return Err(CoreError::invalid_configuration(format!(
                            "index '{name}' is not configured"
                        )))
                    }
                    None => self.add_all(index),
                }
            }
        }
        Ok(())
    }

    fn add(&mut self, index: &AttributeIndex, kind: IndexKind) {
        self.attributes
            .insert((index.attribute().to_ascii_lowercase(), kind));
    }

    fn add_all(&mut self, index: &AttributeIndex) {
        for (kind, _) in index.trees() {
            self.add(index, kind);
        }
    }

    fn includes(&self, index: &AttributeIndex, kind: IndexKind) -> bool {
        self.attributes
            .contains(&(index.attribute().to_ascii_lowercase(), kind))
    }

    fn wants_dn_stream(&self) -> bool {
        self.dn2id || self.children || self.subtree
    }

    fn is_empty(&self) -> bool {
        !self.wants_dn_stream() && !self.dn2uri && self.attributes.is_empty()
    }

    fn names(&self) -> Vec<String> {
        let flags = [
            (self.dn2id, "dn2id"),
            (self.children, "id2children"),
            (self.subtree, "id2subtree"),
            (self.dn2uri, "dn2uri"),
        ];
        flags
            .iter()
            .filter(|(selected, _)| *selected)
            .map(|(_, name)| (*name).to_string())
            .chain(
                self.attributes
                    .iter()
                    .map(|(attribute, kind)| format!("{attribute}.{}", kind.name())),
            )
            .collect()
    }

    fn attribute_trees(&self, container: &dyn EntryContainer) -> Vec<Arc<dyn IndexTree>> {
        container
            .attribute_indexes()
            .iter()
            .flat_map(|index| {
                index
                    .trees()
                    .filter(|(kind, _)| self.includes(index, *kind))
                    .map(|(_, tree)| Arc::clone(tree))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn clear(&self, container: &dyn EntryContainer) -> CoreResult<()> {
        if self.dn2id {
            container.dn2id().clear()?;
        }
        if self.children {
            container.id2children().clear()?;
        }
        if self.subtree {
            container.id2subtree().clear()?;
        }
        if self.dn2uri {
            container.dn2uri().clear()?;
        }
        for tree in self.attribute_trees(container) {
            tree.clear()?;
        }
        Ok(())
    }

    fn set_trusted(&self, container: &dyn EntryContainer, trusted: bool) -> CoreResult<()> {
        if self.children {
            container.id2children().set_trusted(trusted)?;
        }
        if self.subtree {
            container.id2subtree().set_trusted(trusted)?;
        }
        if self.dn2uri {
            container.dn2uri().set_trusted(trusted)?;
        }
        for tree in self.attribute_trees(container) {
            tree.set_trusted(trusted)?;
        }
        Ok(())
    }
}

/// Hands out the entries of id2entry in id order to every worker.
struct EntryScan {
    entries: Arc<dyn EntryTree>,
    cursor: Mutex<EntryId>,
    counters: SourceCounters,
}

impl EntryScan {
    fn new(entries: Arc<dyn EntryTree>) -> Self {
        Self {
            entries,
            cursor: Mutex::new(EntryId::NONE),
            counters: SourceCounters::default(),
        }
    }

    fn next(&self) -> CoreResult<Option<(EntryId, Entry)>> {
        let mut cursor = self.cursor.lock();
        let next = self.entries.next_after(*cursor)?;
        if let Some((id, _)) = &next {
            *cursor = *id;
            self.counters.record_read();
        }
        Ok(next)
    }
}

impl EntrySource for EntryScan {
    fn next_entry(&self) -> CoreResult<Option<Entry>> {
        Ok(self.next()?.map(|(_, entry)| entry))
    }

    fn entries_read(&self) -> u64 {
        self.counters.read()
    }

    fn entries_rejected(&self) -> u64 {
        self.counters.rejected()
    }

    fn entries_ignored(&self) -> u64 {
        self.counters.ignored()
    }

    fn reject(&self, entry: &Entry, reason: &str) {
        self.counters.record_rejection(entry.dn().to_string(), reason);
    }

    fn ignore(&self, entry: &Entry) {
        self.counters.record_ignored(entry.dn().to_string());
    }
}

/// What every rebuild worker shares.
#[derive(Clone)]
struct RebuildJob {
    base: Dn,
    streams: Arc<StreamSet>,
    dn2uri: Option<Arc<dyn ReferralTree>>,
    scan: Arc<EntryScan>,
}

struct RebuildWorker {
    phase: Arc<PhaseOne>,
    job: RebuildJob,
}

impl RebuildWorker {
    fn run(&self) -> CoreResult<()> {
        let mut emitter = KeyEmitter::new(&self.phase);
        match self.process_all(&mut emitter) {
            Ok(()) => {
                emitter.finish();
                Ok(())
            }
            Err(err) => {
                emitter.abandon();
                self.phase.ctx().abort("rebuild worker", &err);
                Err(err)
            }
        }
    }

    fn process_all(&self, emitter: &mut KeyEmitter<'_>) -> CoreResult<()> {
        let ctx = self.phase.ctx();
        loop {
            ctx.check_canceled()?;
            let Some((id, entry)) = self.job.scan.next()? else {
                return Ok(());
            };
            if let Some((key, index_id)) = &self.job.streams.dn {
                emitter.emit(key, *index_id, &entry.dn().to_key(&self.job.base)?, id, true)?;
            }
            if let Some(dn2uri) = &self.job.dn2uri {
                dn2uri.add_entry(&entry)?;
            }
            self.job
                .streams
                .for_each_attribute_key(&entry, |key, index_id, bytes| emitter.emit(key, index_id, bytes, id, true))?;
            ctx.stats.record_imported();
        }
    }
}
