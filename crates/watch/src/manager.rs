//! Supervising one watch pipeline per definition.
//!
//! Every pipeline is an independent task: watcher, debouncer, then a sync
//! scoped to the debounced batch. A pipeline failing, or its sync failing,
//! only ever affects that watch.

use crate::debounce::{Debouncer, drive};
use crate::definition::WatchDefinition;
use crate::error::{ErrorKind, Result};
use crate::exclude::ExcludeSet;
use crate::state::{SyncRecord, Trigger, WatchState};
use crate::store::WatchStore;
use crate::watcher::Watcher;
use exn::ResultExt;
use ferry_storage::backend::LocalBackend;
use ferry_storage::{BackendRegistry, Location, Locator};
use ferry_sync::{CancellationToken, DEFAULT_CONCURRENCY, DEFAULT_PROGRESS_INTERVAL, SyncOptions};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub const DEFAULT_HISTORY: NonZeroUsize = NonZeroUsize::new(50).unwrap();

/// Settings shared by every watch of one manager.
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    /// Sync records kept per watch.
    pub history: NonZeroUsize,
    pub concurrency: NonZeroUsize,
    pub transfer_timeout: Option<Duration>,
    pub progress_interval: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            history: DEFAULT_HISTORY,
            concurrency: DEFAULT_CONCURRENCY,
            transfer_timeout: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Live state and recent history of one watch, shared with its pipeline.
#[derive(Default)]
struct Status {
    state: WatchState,
    history: VecDeque<SyncRecord>,
}

type SharedStatus = Arc<Mutex<Status>>;

struct Pipeline {
    cancel: CancellationToken,
    manual: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Pipeline {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Watch pipeline panicked");
        }
    }
}

struct Entry {
    definition: WatchDefinition,
    status: SharedStatus,
    pipeline: Option<Pipeline>,
}

#[derive(Default)]
struct Inner {
    loaded: bool,
    running: bool,
    watches: BTreeMap<String, Entry>,
}

/// Owns every configured watch.
///
/// ```no_run
/// use ferry_storage::BackendRegistry;
/// use ferry_watch::{ManagerSettings, WatchDefinition, WatchManager, WatchStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = WatchManager::new(
///     WatchStore::new("/var/lib/ferry/watches.json"),
///     BackendRegistry::local(),
///     ManagerSettings::default(),
/// );
/// manager.start().await?;
/// manager.add(WatchDefinition::new("beamline", "/data/beamline", "/mnt/archive/beamline")).await?;
/// for (definition, state) in manager.list().await? {
///     println!("{}: {}", definition.id, state.phase);
/// }
/// manager.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct WatchManager {
    store: WatchStore,
    registry: BackendRegistry,
    settings: ManagerSettings,
    inner: Mutex<Inner>,
}

impl WatchManager {
    pub fn new(store: WatchStore, registry: BackendRegistry, settings: ManagerSettings) -> Self {
        Self {
            store,
            registry,
            settings,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Start a pipeline for every persisted watch. Calling this on a running
    /// manager does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        if inner.running {
            return Ok(());
        }
        inner.running = true;
        for entry in inner.watches.values_mut() {
            entry.pipeline = Some(self.spawn(&entry.definition, &entry.status).await);
        }
        tracing::info!(watches = inner.watches.len(), "Watch manager started");
        Ok(())
    }

    /// Cancel every pipeline, including syncs in flight, and wait for them
    /// to wind down.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.running = false;
        let pipelines: Vec<Pipeline> = inner.watches.values_mut().filter_map(|e| e.pipeline.take()).collect();
        for pipeline in &pipelines {
            pipeline.cancel.cancel();
        }
        for pipeline in pipelines {
            pipeline.stop().await;
        }
        tracing::info!("Watch manager stopped");
    }

    pub async fn add(&self, definition: WatchDefinition) -> Result<()> {
        self.check(&definition).await?;
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        if inner.watches.contains_key(&definition.id) {
            exn::bail!(ErrorKind::DuplicateId(definition.id));
        }
        check_overlap(&inner, &definition)?;

        let mut definitions = definitions(&inner);
        definitions.push(definition.clone());
        self.store.save(&definitions).await?;

        let status = SharedStatus::default();
        let pipeline = match inner.running {
            true => Some(self.spawn(&definition, &status).await),
            false => None,
        };
        tracing::info!(id = %definition.id, source = %definition.source.display(), "Added watch");
        inner.watches.insert(
            definition.id.clone(),
            Entry {
                definition,
                status,
                pipeline,
            },
        );
        Ok(())
    }

    /// Replace a definition, restarting its pipeline if the manager is
    /// running. State and history carry over.
    pub async fn update(&self, definition: WatchDefinition) -> Result<()> {
        self.check(&definition).await?;
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        if !inner.watches.contains_key(&definition.id) {
            exn::bail!(ErrorKind::UnknownWatch(definition.id));
        }
        check_overlap(&inner, &definition)?;

        let definitions: Vec<WatchDefinition> = inner
            .watches
            .values()
            .map(|e| match e.definition.id == definition.id {
                true => definition.clone(),
                false => e.definition.clone(),
            })
            .collect();
        self.store.save(&definitions).await?;

        let running = inner.running;
        let Some(entry) = inner.watches.get_mut(&definition.id) else {
            exn::bail!(ErrorKind::UnknownWatch(definition.id));
        };
        if let Some(pipeline) = entry.pipeline.take() {
            pipeline.stop().await;
        }
        entry.definition = definition;
        if running {
            entry.pipeline = Some(self.spawn(&entry.definition, &entry.status).await);
        }
        tracing::info!(id = %entry.definition.id, "Updated watch");
        Ok(())
    }

    /// Stop a watch and forget it, state and history included.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        if !inner.watches.contains_key(id) {
            exn::bail!(ErrorKind::UnknownWatch(id.to_string()));
        }
        let remaining: Vec<WatchDefinition> =
            definitions(&inner).into_iter().filter(|d| d.id != id).collect();
        self.store.save(&remaining).await?;
        if let Some(pipeline) = inner.watches.remove(id).and_then(|e| e.pipeline) {
            pipeline.stop().await;
        }
        tracing::info!(id, "Removed watch");
        Ok(())
    }

    /// Every watch with its live state, ordered by id.
    pub async fn list(&self) -> Result<Vec<(WatchDefinition, WatchState)>> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        let mut list = Vec::with_capacity(inner.watches.len());
        for entry in inner.watches.values() {
            let state = entry.status.lock().await.state.clone();
            list.push((entry.definition.clone(), state));
        }
        Ok(list)
    }

    pub async fn status(&self, id: &str) -> Result<WatchState> {
        let status = self.status_of(id).await?;
        let state = status.lock().await.state.clone();
        Ok(state)
    }

    /// Recent sync cycles, oldest first.
    pub async fn history(&self, id: &str) -> Result<Vec<SyncRecord>> {
        let status = self.status_of(id).await?;
        let history = status.lock().await.history.iter().cloned().collect();
        Ok(history)
    }

    /// Ask a running watch for a full sync now. A request made while one is
    /// already queued is merged into it.
    pub async fn trigger(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        let entry = inner.watches.get(id).ok_or_else(|| exn::Exn::from(ErrorKind::UnknownWatch(id.to_string())))?;
        let Some(pipeline) = &entry.pipeline else {
            exn::bail!(ErrorKind::NotRunning);
        };
        match pipeline.manual.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => exn::bail!(ErrorKind::NotRunning),
        }
    }

    async fn status_of(&self, id: &str) -> Result<SharedStatus> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await?;
        inner
            .watches
            .get(id)
            .map(|e| e.status.clone())
            .ok_or_else(|| exn::Exn::from(ErrorKind::UnknownWatch(id.to_string())))
    }

    async fn ensure_loaded(&self, inner: &mut Inner) -> Result<()> {
        if inner.loaded {
            return Ok(());
        }
        for definition in self.store.load().await? {
            // A definition that is no longer valid still gets listed; its
            // pipeline reports why it can't run.
            if let Err(e) = definition.validate() {
                tracing::warn!(id = %definition.id, error = %e, "Stored watch definition is invalid");
            }
            inner.watches.insert(
                definition.id.clone(),
                Entry {
                    definition,
                    status: SharedStatus::default(),
                    pipeline: None,
                },
            );
        }
        inner.loaded = true;
        Ok(())
    }

    /// Everything about a definition that can be checked without looking
    /// at other watches.
    async fn check(&self, definition: &WatchDefinition) -> Result<()> {
        definition.validate()?;
        let invalid = |reason: String| ErrorKind::InvalidDefinition(format!("{}: {reason}", definition.id));
        let metadata = tokio::fs::metadata(&definition.source)
            .await
            .or_raise(|| invalid(format!("source {} is not accessible", definition.source.display())))?;
        if !metadata.is_dir() {
            exn::bail!(invalid(format!("source {} is not a directory", definition.source.display())));
        }
        let locator = Locator::parse(&definition.destination)
            .or_raise(|| invalid(format!("invalid destination `{}`", definition.destination)))?;
        if !self.registry.supports(&locator.scheme) {
            exn::bail!(invalid(format!("unsupported destination scheme `{}`", locator.scheme)));
        }
        if locator.scheme == "file" && nested(&definition.source, &locator.path) {
            exn::bail!(invalid("destination and source overlap".to_string()));
        }
        Ok(())
    }

    async fn spawn(&self, definition: &WatchDefinition, status: &SharedStatus) -> Pipeline {
        status.lock().await.state.resume(OffsetDateTime::now_utc());
        let cancel = CancellationToken::new();
        // One queued request is enough; more would only repeat it.
        let (manual, manual_rx) = mpsc::channel(1);
        let run = Run {
            definition: definition.clone(),
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            status: status.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.run(manual_rx));
        Pipeline { cancel, manual, task }
    }
}

fn definitions(inner: &Inner) -> Vec<WatchDefinition> {
    inner.watches.values().map(|e| e.definition.clone()).collect()
}

/// Two watches must never observe the same files.
fn check_overlap(inner: &Inner, definition: &WatchDefinition) -> Result<()> {
    match inner
        .watches
        .values()
        .find(|e| e.definition.id != definition.id && nested(&e.definition.source, &definition.source))
    {
        Some(other) => exn::bail!(ErrorKind::OverlappingRoots(other.definition.id.clone())),
        None => Ok(()),
    }
}

/// Whether either path contains (or is) the other.
fn nested(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// How long ago a file under `root` was last modified, if that can be told.
fn file_age(root: &Path, relative: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(root.join(relative)).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Both ends of a running watch, and what to leave out between them.
struct Endpoints {
    source: Location,
    destination: Location,
    excludes: ExcludeSet,
}

/// Everything one pipeline task needs.
struct Run {
    definition: WatchDefinition,
    registry: BackendRegistry,
    settings: ManagerSettings,
    status: SharedStatus,
    cancel: CancellationToken,
}

impl Run {
    #[tracing::instrument(name = "watch", skip_all, fields(id = %self.definition.id))]
    async fn run(self, manual: mpsc::Receiver<()>) {
        let error = match self.watch(manual).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(error = ?e, "Watch terminated");
                Some(e.to_string())
            },
        };
        self.status.lock().await.state.stopped(error);
    }

    async fn watch(&self, mut manual: mpsc::Receiver<()>) -> Result<()> {
        let excludes = self.definition.excludes()?;
        // Before the source backend, which would create a missing root.
        let (watcher, events) = Watcher::start(&self.definition.source, excludes.clone())?;
        let locator = Locator::parse(&self.definition.destination).or_raise(|| ErrorKind::Storage)?;
        let destination = self.registry.resolve(&locator).await.or_raise(|| ErrorKind::Storage)?;
        let source_backend = LocalBackend::new(self.definition.id.clone(), &self.definition.source)
            .or_raise(|| ErrorKind::Storage)?
            .with_hashing(false);
        let ends = Endpoints {
            source: Location::root(Arc::new(source_backend)),
            destination,
            excludes,
        };

        let (batches_tx, mut batches) = mpsc::channel(1);
        let root = watcher.root().to_path_buf();
        let debouncer = Debouncer::new(self.definition.debounce(), self.definition.minimum_age());
        let driver = tokio::spawn(drive(
            events,
            debouncer,
            move |relative: &Path| file_age(&root, relative),
            batches_tx,
            self.cancel.child_token(),
        ));

        if self.definition.sync_on_start {
            self.cycle(&ends, Trigger::Startup, None).await;
        }
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(()) = manual.recv() => self.cycle(&ends, Trigger::Manual, None).await,
                batch = batches.recv() => match batch {
                    Some(batch) => self.cycle(&ends, Trigger::Changes, Some(batch)).await,
                    // The debouncer only ever stops once its event stream has.
                    None => break,
                },
            }
        }

        self.cancel.cancel();
        drop(watcher);
        match driver.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Debouncer panicked");
                exn::bail!(ErrorKind::Watcher)
            },
        }
    }

    /// Run one sync and record its outcome. Never fails the pipeline.
    async fn cycle(&self, ends: &Endpoints, trigger: Trigger, batch: Option<BTreeSet<PathBuf>>) {
        self.status.lock().await.state.syncing();
        let at = OffsetDateTime::now_utc();
        let started = std::time::Instant::now();
        let batch_len = batch.as_ref().map_or(0, BTreeSet::len);

        let mut options = SyncOptions::default()
            .with_delete_extraneous(self.definition.delete_extraneous)
            .with_concurrency(self.settings.concurrency)
            .with_progress_interval(self.settings.progress_interval)
            .with_cancellation(self.cancel.child_token());
        if let Some(timeout) = self.settings.transfer_timeout {
            options = options.with_transfer_timeout(timeout);
        }
        if let Some(batch) = batch {
            options = options.with_scope(batch);
        }
        if !ends.excludes.is_empty() {
            let excludes = ends.excludes.clone();
            options = options.with_exclude(move |path: &Path| excludes.is_excluded(path));
        }

        let record = match ferry_sync::sync(&ends.source, &ends.destination, &options).await {
            Ok(result) => {
                tracing::info!(
                    %trigger,
                    batch = batch_len,
                    transferred = result.files_transferred(),
                    deleted = result.files_deleted(),
                    errors = result.errors.len(),
                    "Watch sync finished"
                );
                if self.definition.delete_source && !result.cancelled {
                    self.delete_transferred(&ends.source, &result.transferred, at).await;
                }
                SyncRecord::completed(at, trigger, batch_len, &result)
            },
            Err(e) => {
                tracing::warn!(%trigger, error = ?e, "Watch sync failed");
                SyncRecord::failed(at, trigger, batch_len, started.elapsed(), e.to_string())
            },
        };

        let mut status = self.status.lock().await;
        status.state.record(&record);
        status.history.push_back(record);
        while status.history.len() > self.settings.history.get() {
            status.history.pop_front();
        }
    }

    /// Remove source files that made it to the destination, unless they
    /// were written to again after the sync started.
    async fn delete_transferred(&self, source: &Location, transferred: &[PathBuf], started: OffsetDateTime) {
        for path in transferred {
            match source.backend.stat(path).await {
                Ok(record) if record.modified > started => {
                    tracing::debug!(path = %path.display(), "Source changed during sync; keeping it");
                },
                Ok(_) => {
                    if let Err(e) = source.backend.delete(path).await {
                        tracing::warn!(path = %path.display(), error = ?e, "Failed to delete source file");
                    }
                },
                Err(e) if e.is_not_found() => {},
                Err(e) => tracing::warn!(path = %path.display(), error = ?e, "Failed to stat source file"),
            }
        }
    }
}
