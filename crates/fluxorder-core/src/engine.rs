//! Reconciliation scheduler.
//!
//! The [`Engine`] owns the unit registry. Each [`Engine::tick`] walks the
//! current dependency graph in topological order and, for every unit that is
//! due and whose dependencies are all `Ready`, fetches and renders its
//! source and decides whether an apply is needed. Applies run as independent
//! tokio tasks bounded by a semaphore; their outcomes come back over a
//! channel and are folded into the registry on the next tick or by
//! [`Engine::process_next_completion`].
//!
//! Two invariants hold throughout:
//!
//! - at most one apply per unit is in flight (an owned per-unit mutex guard
//!   lives inside the apply task);
//! - `last_applied_revision` only changes when an apply completes.

use crate::apply::{ApplyError, ApplyRequest, Applier};
use crate::config::{BackoffConfig, Config};
use crate::declaration::UnitDeclaration;
use crate::error::{FluxError, Result};
use crate::graph::DependencyGraph;
use crate::render::Renderer;
use crate::resource::AppliedSet;
use crate::source::{FetchedSource, Source};
use crate::status::StatusSnapshot;
use crate::unit::{Transition, Trigger, UnitRecord, UnitStatus};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HISTORY_LIMIT: usize = 200;

const REASON_CANCELLED: &str = "apply cancelled";
const REASON_SUSPENDED: &str = "suspended";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub max_concurrent_applies: usize,
    pub stall_threshold: u32,
    pub apply_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_applies: config.scheduler.max_concurrent_applies,
            stall_threshold: config.scheduler.stall_threshold,
            apply_timeout: config.scheduler.apply_timeout(),
            backoff: config.backoff.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What a declaration reload changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub generation: u64,
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    /// Removed units whose resources were deleted.
    pub pruned: Vec<String>,
}

/// What one scheduling pass did, per unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Applies started this tick.
    pub dispatched: Vec<String>,
    /// Due units held back by a dependency that is not `Ready`.
    pub blocked: Vec<String>,
    /// Units checked and found in sync; no apply issued.
    pub up_to_date: Vec<String>,
    /// Units whose fetch, render or drift check failed.
    pub failed: Vec<String>,
    /// Due units left for a later tick because the concurrency limit was hit.
    pub deferred: Vec<String>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.dispatched.is_empty() && self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct UnitEntry {
    decl: UnitDeclaration,
    record: UnitRecord,
    /// Held by the apply task for its whole lifetime.
    lock: Arc<Mutex<()>>,
    triggered: bool,
    forced: bool,
}

struct InFlight {
    attempt: u64,
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
enum Outcome {
    Applied(AppliedSet),
    Failed(ApplyError),
    Cancelled,
}

/// Result of an apply task, delivered back to the engine.
#[derive(Debug)]
struct Completion {
    unit: String,
    attempt: u64,
    revision: String,
    outcome: Outcome,
}

/// Longest delay the scheduler will compute, about a century.
const MAX_DELAY_MS: u128 = 100 * 365 * 24 * 3600 * 1000;

fn chrono_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(MAX_DELAY_MS) as i64)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    source: Arc<dyn Source>,
    renderer: Arc<dyn Renderer>,
    applier: Arc<dyn Applier>,
    settings: EngineSettings,
    graph: Arc<DependencyGraph>,
    units: BTreeMap<String, UnitEntry>,
    /// Persisted records waiting for their declaration to be loaded.
    restored: BTreeMap<String, UnitRecord>,
    permits: Arc<Semaphore>,
    in_flight: HashMap<String, InFlight>,
    next_attempt: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    history: VecDeque<Transition>,
    /// Removed units whose prune failed, retried every tick.
    pending_prunes: Vec<(String, AppliedSet)>,
}

impl Engine {
    pub fn new(
        source: Arc<dyn Source>,
        renderer: Arc<dyn Renderer>,
        applier: Arc<dyn Applier>,
        settings: EngineSettings,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(StatusSnapshot::default());
        Self {
            source,
            renderer,
            applier,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_applies)),
            settings,
            graph: Arc::new(DependencyGraph::empty()),
            units: BTreeMap::new(),
            restored: BTreeMap::new(),
            in_flight: HashMap::new(),
            next_attempt: 0,
            completions_tx,
            completions_rx,
            snapshot_tx,
            history: VecDeque::new(),
            pending_prunes: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn graph(&self) -> Arc<DependencyGraph> {
        Arc::clone(&self.graph)
    }

    pub fn record(&self, unit: &str) -> Option<&UnitRecord> {
        self.units.get(unit).map(|e| &e.record)
    }

    /// Records of all loaded units, sorted by name.
    pub fn records(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.values().map(|e| &e.record)
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_applying(&self, unit: &str) -> bool {
        self.in_flight.contains_key(unit)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Seed the registry with persisted records. Records are matched to
    /// units by name when their declarations are loaded.
    pub fn restore(&mut self, records: impl IntoIterator<Item = UnitRecord>) {
        for mut record in records {
            if record.status == UnitStatus::Applying {
                record.status = UnitStatus::Failed;
                record.last_error = Some("interrupted before completion".to_string());
            }
            if let Some(entry) = self.units.get_mut(&record.name) {
                if !self.in_flight.contains_key(&record.name) {
                    entry.record = record;
                }
            } else {
                self.restored.insert(record.name.clone(), record);
            }
        }
        self.publish();
    }

    /// Replace the declaration set.
    ///
    /// The new graph is built in isolation first; on any validation error
    /// (cycle, unknown dependency, duplicate) the current graph and registry
    /// stay untouched and the error is returned. On success the graph is
    /// swapped in, removed units are cancelled and pruned, and edited units
    /// become eligible again.
    pub async fn load(&mut self, declarations: Vec<UnitDeclaration>) -> Result<LoadReport> {
        let generation = self.graph.generation() + 1;
        let graph = match DependencyGraph::build(&declarations, generation) {
            Ok(g) => g,
            Err(e) => {
                warn!(generation, error = %e, "declaration set rejected; keeping current graph");
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut report = LoadReport {
            generation,
            ..LoadReport::default()
        };

        let incoming: BTreeMap<String, UnitDeclaration> = declarations
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let removed: Vec<String> = self
            .units
            .keys()
            .filter(|name| !incoming.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if self.remove_unit(&name).await {
                report.pruned.push(name.clone());
            }
            report.removed.push(name);
        }

        // Restored records nobody declares any more belong to units removed
        // while the engine was down.
        let orphaned: Vec<String> = self
            .restored
            .keys()
            .filter(|name| !incoming.contains_key(*name))
            .cloned()
            .collect();
        for name in orphaned {
            let Some(record) = self.restored.remove(&name) else {
                continue;
            };
            if self.prune_removed(record).await {
                report.pruned.push(name.clone());
            }
            report.removed.push(name);
        }

        for (name, decl) in incoming {
            match self.units.get_mut(&name) {
                Some(entry) => {
                    if entry.decl == decl {
                        continue;
                    }
                    entry.decl = decl;
                    entry.triggered = true;
                    entry.record.failure_count = 0;
                    entry.record.next_retry_at = None;
                    report.changed.push(name.clone());
                    if entry.record.status == UnitStatus::Stalled {
                        self.transition(&name, UnitStatus::Pending, "declaration changed", now);
                    }
                }
                None => {
                    let record = self
                        .restored
                        .remove(&name)
                        .unwrap_or_else(|| UnitRecord::new(&name, now));
                    self.units.insert(
                        name.clone(),
                        UnitEntry {
                            decl,
                            record,
                            lock: Arc::new(Mutex::new(())),
                            triggered: false,
                            forced: false,
                        },
                    );
                    report.added.push(name);
                }
            }
        }

        self.graph = Arc::new(graph);
        info!(
            generation,
            units = self.units.len(),
            added = report.added.len(),
            changed = report.changed.len(),
            removed = report.removed.len(),
            "dependency graph loaded"
        );
        self.publish();
        Ok(report)
    }

    /// Cancel any in-flight apply for `name`, prune its resources if the
    /// unit asks for it, and drop it. Returns whether resources were deleted.
    async fn remove_unit(&mut self, name: &str) -> bool {
        self.cancel_and_wait(name).await;
        let Some(entry) = self.units.remove(name) else {
            return false;
        };
        self.restored.remove(name);
        let mut record = entry.record;
        // The current declaration decides, not the one last applied.
        record.prune = entry.decl.prune;
        self.prune_removed(record).await
    }

    async fn prune_removed(&mut self, record: UnitRecord) -> bool {
        let name = record.name;
        let applied = match (record.prune, record.applied) {
            (true, Some(applied)) => applied,
            _ => {
                info!(unit = %name, "unit removed; resources left in place");
                return false;
            }
        };
        match self.applier.delete(&name, &applied).await {
            Ok(()) => {
                info!(unit = %name, resources = applied.resources.len(), "unit removed; resources pruned");
                true
            }
            Err(e) => {
                warn!(unit = %name, error = %e, "prune of removed unit failed; will retry");
                self.pending_prunes.push((name, applied));
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Mark a unit for evaluation on the next tick regardless of its
    /// interval. Dependency gating still applies.
    pub fn trigger(&mut self, unit: &str, trigger: Trigger) -> Result<()> {
        let now = Utc::now();
        let entry = self
            .units
            .get_mut(unit)
            .ok_or_else(|| FluxError::UnitNotFound(unit.to_string()))?;
        entry.triggered = true;
        if trigger.forces_apply() {
            entry.forced = true;
        }
        if trigger == Trigger::Manual {
            entry.record.failure_count = 0;
            entry.record.next_retry_at = None;
            if entry.record.status == UnitStatus::Stalled {
                self.transition(unit, UnitStatus::Pending, "manual reconcile", now);
            }
        }
        debug!(unit, ?trigger, "trigger queued");
        self.publish();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    fn is_due(&self, entry: &UnitEntry, now: DateTime<Utc>) -> bool {
        if entry.triggered {
            return true;
        }
        let interval_elapsed = match entry.record.last_checked_at {
            Some(at) => now >= at + chrono_delta(entry.decl.interval),
            None => true,
        };
        match entry.record.status {
            UnitStatus::Pending => true,
            UnitStatus::Applying => false,
            UnitStatus::Ready => interval_elapsed,
            UnitStatus::Failed => entry.record.next_retry_at.map_or(true, |at| now >= at),
            // Only polled for a source change; no retry.
            UnitStatus::Stalled => interval_elapsed,
        }
    }

    /// First dependency (in topological order) that would block an apply.
    fn blocking_dependency(&self, unit: &str) -> Option<String> {
        self.graph
            .transitive_dependencies(unit)
            .into_iter()
            .find(|dep| {
                self.in_flight.contains_key(dep)
                    || self.units.get(dep).map_or(true, |e| {
                        e.decl.suspend || e.record.status != UnitStatus::Ready
                    })
            })
    }

    /// Run one scheduling pass at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        self.drain_completions(now);
        self.retry_prunes().await;

        let mut report = TickReport::default();
        let graph = Arc::clone(&self.graph);

        for name in graph.order() {
            if self.in_flight.contains_key(name) {
                continue;
            }
            let Some(entry) = self.units.get(name) else {
                continue;
            };

            if entry.decl.suspend {
                if entry.record.status != UnitStatus::Pending
                    || entry.record.last_error.as_deref() != Some(REASON_SUSPENDED)
                {
                    self.transition(name, UnitStatus::Pending, REASON_SUSPENDED, now);
                    if let Some(entry) = self.units.get_mut(name) {
                        entry.record.last_error = Some(REASON_SUSPENDED.to_string());
                    }
                }
                continue;
            }

            if !self.is_due(entry, now) {
                continue;
            }

            if let Some(dep) = self.blocking_dependency(name) {
                debug!(unit = %name, dependency = %dep, "dependency not ready; holding");
                report.blocked.push(name.clone());
                continue;
            }

            self.evaluate(name, now, &mut report).await;
        }

        self.publish();
        Ok(report)
    }

    /// Fetch, render and decide for one unit that is due and unblocked.
    async fn evaluate(&mut self, name: &str, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(entry) = self.units.get(name) else {
            return;
        };
        let decl = entry.decl.clone();

        let fetched: FetchedSource = match self.source.fetch(&decl.source_path).await {
            Ok(f) => f,
            Err(e) => {
                self.settle_without_apply(name, now);
                self.record_failure(name, ApplyError::Source(e.to_string()), now);
                report.failed.push(name.to_string());
                return;
            }
        };

        let Some(entry) = self.units.get(name) else {
            return;
        };
        let record = &entry.record;

        if record.status == UnitStatus::Stalled {
            if record.last_attempted_revision.as_deref() == Some(fetched.revision.as_str()) {
                debug!(unit = %name, "stalled; source unchanged");
                self.settle_without_apply(name, now);
                return;
            }
            if let Some(entry) = self.units.get_mut(name) {
                entry.record.failure_count = 0;
                entry.record.next_retry_at = None;
            }
            self.transition(name, UnitStatus::Pending, "source changed", now);
        }

        let Some(entry) = self.units.get(name) else {
            return;
        };
        let record = &entry.record;
        let forced = entry.forced;
        let changed = record.last_applied_revision.as_deref() != Some(fetched.revision.as_str());

        let mut reason = if record.last_applied_revision.is_none() {
            Some("initial apply".to_string())
        } else if changed {
            Some(format!("source changed to {}", fetched.revision))
        } else if forced {
            Some("forced reconcile".to_string())
        } else {
            None
        };

        if reason.is_none() {
            if let Some(applied) = record.applied.clone() {
                match self.applier.detect_drift(name, &applied).await {
                    Ok(drift) if drift.requires_correction(decl.prune) => {
                        info!(
                            unit = %name,
                            missing = drift.missing.len(),
                            mutated = drift.mutated.len(),
                            extra = drift.extra.len(),
                            "drift detected"
                        );
                        reason = Some("drift detected".to_string());
                    }
                    Ok(drift) => {
                        if !drift.extra.is_empty() {
                            debug!(unit = %name, extra = drift.extra.len(), "extra resources left in place; prune disabled");
                        }
                    }
                    Err(e) => {
                        self.settle_without_apply(name, now);
                        self.record_failure(name, e, now);
                        report.failed.push(name.to_string());
                        return;
                    }
                }
            }
        }

        let Some(reason) = reason else {
            self.settle_without_apply(name, now);
            if self
                .units
                .get(name)
                .is_some_and(|e| e.record.status != UnitStatus::Ready)
            {
                self.transition(name, UnitStatus::Ready, "up to date", now);
                if let Some(entry) = self.units.get_mut(name) {
                    entry.record.failure_count = 0;
                    entry.record.next_retry_at = None;
                    entry.record.last_error = None;
                }
            }
            report.up_to_date.push(name.to_string());
            return;
        };

        let resources = match self.renderer.render(&fetched.manifests, &decl.overlay) {
            Ok(r) => r,
            Err(e) => {
                self.settle_without_apply(name, now);
                if let Some(entry) = self.units.get_mut(name) {
                    entry.record.last_attempted_revision = Some(fetched.revision.clone());
                }
                self.record_failure(name, ApplyError::Render(e.to_string()), now);
                report.failed.push(name.to_string());
                return;
            }
        };

        if self.dispatch(name, &decl, fetched.revision, resources, &reason, now) {
            report.dispatched.push(name.to_string());
        } else {
            report.deferred.push(name.to_string());
        }
    }

    /// Start the apply task. Returns `false` when no permit is available.
    fn dispatch(
        &mut self,
        name: &str,
        decl: &UnitDeclaration,
        revision: String,
        resources: crate::resource::ResourceSet,
        reason: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            debug!(unit = %name, "concurrency limit reached; deferring");
            return false;
        };
        let Some(entry) = self.units.get_mut(name) else {
            return false;
        };
        let Ok(guard) = Arc::clone(&entry.lock).try_lock_owned() else {
            debug!(unit = %name, "apply lock held; deferring");
            return false;
        };

        entry.triggered = false;
        entry.forced = false;
        entry.record.last_checked_at = Some(now);
        entry.record.last_attempted_revision = Some(revision.clone());
        let request = ApplyRequest {
            unit: name.to_string(),
            revision: revision.clone(),
            resources,
            prune: decl.prune,
            previous: entry.record.applied.clone(),
        };

        self.transition(name, UnitStatus::Applying, reason, now);

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let applier = Arc::clone(&self.applier);
        let timeout = self.settings.apply_timeout;
        let tx = self.completions_tx.clone();
        let unit = name.to_string();

        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel_rx => Outcome::Cancelled,
                res = tokio::time::timeout(timeout, applier.apply(request)) => match res {
                    Ok(Ok(applied)) => Outcome::Applied(applied),
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(_) => Outcome::Failed(ApplyError::Timeout(timeout)),
                },
            };
            drop(guard);
            drop(permit);
            let _ = tx.send(Completion {
                unit,
                attempt,
                revision,
                outcome,
            });
        });

        self.in_flight.insert(
            name.to_string(),
            InFlight {
                attempt,
                cancel: Some(cancel_tx),
                handle,
            },
        );
        true
    }

    fn settle_without_apply(&mut self, name: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.units.get_mut(name) {
            entry.triggered = false;
            entry.forced = false;
            entry.record.last_checked_at = Some(now);
        }
    }

    // -----------------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------------

    /// Fold one apply outcome into the registry.
    fn process_completion(&mut self, completion: Completion, now: DateTime<Utc>) {
        let Completion {
            unit,
            attempt,
            revision,
            outcome,
        } = completion;

        match self.in_flight.get(&unit) {
            Some(f) if f.attempt == attempt => {
                self.in_flight.remove(&unit);
            }
            _ => {
                debug!(unit = %unit, attempt, "stale completion ignored");
                return;
            }
        }
        if !self.units.contains_key(&unit) {
            return;
        }

        match outcome {
            Outcome::Applied(applied) => {
                if let Some(entry) = self.units.get_mut(&unit) {
                    entry.record.last_applied_revision = Some(revision.clone());
                    entry.record.applied = Some(applied);
                    entry.record.prune = entry.decl.prune;
                    entry.record.failure_count = 0;
                    entry.record.next_retry_at = None;
                    entry.record.last_error = None;
                }
                self.transition(&unit, UnitStatus::Ready, &format!("applied {revision}"), now);
            }
            Outcome::Failed(e) => self.record_failure(&unit, e, now),
            Outcome::Cancelled => {
                if let Some(entry) = self.units.get_mut(&unit) {
                    entry.record.last_error = Some(REASON_CANCELLED.to_string());
                    entry.record.next_retry_at = None;
                }
                self.transition(&unit, UnitStatus::Failed, REASON_CANCELLED, now);
            }
        }
        self.publish();
    }

    fn drain_completions(&mut self, now: DateTime<Utc>) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.process_completion(completion, now);
        }
    }

    /// Wait for the next apply to finish and fold it in. Never resolves
    /// while nothing is in flight, so it can sit in a `select!` loop.
    pub async fn process_next_completion(&mut self) {
        if self.in_flight.is_empty() {
            std::future::pending::<()>().await;
        }
        if let Some(completion) = self.completions_rx.recv().await {
            self.process_completion(completion, Utc::now());
        }
    }

    /// Wait until every in-flight apply has completed.
    pub async fn wait_idle(&mut self) {
        while !self.in_flight.is_empty() {
            self.process_next_completion().await;
        }
    }

    fn record_failure(&mut self, name: &str, error: ApplyError, now: DateTime<Utc>) {
        let threshold = self.settings.stall_threshold;
        let backoff = self.settings.backoff.clone();
        let Some(entry) = self.units.get_mut(name) else {
            return;
        };
        entry.record.failure_count = entry.record.failure_count.saturating_add(1);
        entry.record.last_error = Some(error.to_string());
        let failures = entry.record.failure_count;

        if failures >= threshold {
            entry.record.next_retry_at = None;
            warn!(unit = %name, failures, error = %error, "apply retry budget exhausted; stalled");
            self.transition(name, UnitStatus::Stalled, &error.to_string(), now);
        } else {
            let delay = backoff.delay_for(failures);
            entry.record.next_retry_at = Some(now + chrono_delta(delay));
            warn!(unit = %name, failures, retry_in = ?delay, error = %error, "apply failed");
            self.transition(name, UnitStatus::Failed, &error.to_string(), now);
        }
    }

    async fn retry_prunes(&mut self) {
        if self.pending_prunes.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_prunes);
        for (name, applied) in pending {
            // A re-declared unit owns these resources again.
            if self.units.contains_key(&name) {
                continue;
            }
            match self.applier.delete(&name, &applied).await {
                Ok(()) => info!(unit = %name, "deferred prune completed"),
                Err(e) => {
                    warn!(unit = %name, error = %e, "prune still failing");
                    self.pending_prunes.push((name, applied));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    async fn cancel_and_wait(&mut self, name: &str) {
        let Some(flight) = self.in_flight.get_mut(name) else {
            return;
        };
        if let Some(cancel) = flight.cancel.take() {
            let _ = cancel.send(());
        }
        info!(unit = %name, "cancelling in-flight apply");
        while self.in_flight.contains_key(name) {
            match self.completions_rx.recv().await {
                Some(completion) => self.process_completion(completion, Utc::now()),
                None => break,
            }
        }
    }

    /// Cancel every in-flight apply and wait for the tasks to report back.
    /// Cancelled units end up `Failed`.
    pub async fn shutdown(&mut self) {
        let names: Vec<String> = self.in_flight.keys().cloned().collect();
        for name in &names {
            if let Some(cancel) = self.in_flight.get_mut(name).and_then(|f| f.cancel.take()) {
                let _ = cancel.send(());
            }
        }
        self.wait_idle().await;
        self.publish();
    }

    /// Tick until no apply is in flight and a tick dispatches nothing, or
    /// `max_rounds` ticks have run.
    pub async fn run_until_quiescent(&mut self, max_rounds: usize) -> Result<()> {
        for _ in 0..max_rounds {
            let report = self.tick(Utc::now()).await?;
            if report.dispatched.is_empty() && self.in_flight.is_empty() {
                return Ok(());
            }
            self.wait_idle().await;
        }
        warn!(max_rounds, "engine still busy after round limit");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn transition(&mut self, name: &str, to: UnitStatus, reason: &str, now: DateTime<Utc>) {
        let Some(entry) = self.units.get_mut(name) else {
            return;
        };
        let from = entry.record.status;
        entry.record.status = to;
        entry.record.last_transition_time = now;
        if from != to {
            info!(unit = %name, %from, %to, reason, "transition");
        }
        self.history.push_back(Transition {
            unit: name.to_string(),
            from,
            to,
            at: now,
            reason: reason.to_string(),
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn publish(&self) {
        let snapshot = StatusSnapshot::build(
            &self.graph,
            self.units.values().map(|e| (&e.record, e.decl.suspend)),
        );
        self.snapshot_tx.send_replace(snapshot);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for flight in self.in_flight.values() {
            flight.handle.abort();
        }
    }
}
