//! The derivative pipeline service.
//!
//! Owns the queue, the generation registry and the cache, and drives a
//! small worker pool. All bookkeeping happens synchronously under one
//! lock; the only suspension points are the durable read, the byte
//! provider and the codec, which workers run with no lock held.
//!
//! Staleness is decided once, at commit time, by comparing the generation
//! an item captured at enqueue time with the registry's current value. A
//! service-wide epoch does the same for whole-folder clears.

use super::codec::Codec;
use super::generation::GenerationRegistry;
use super::observer::{NoopObserver, PipelineObserver};
use super::queue::{Enqueued, PriorityQueue, QueueItem};
use super::source::ByteProvider;
use super::worker::{run_worker, Derived, Job};
use crate::cache::{CacheStats, DerivativeCache, DisplayHandle, DropReleaser, HandleReleaser};
use crate::cache::{DurableStore, MemoryStore};
use crate::config::PipelineConfig;
use crate::error::{ConfigError, ThumbnailError};
use crate::state::edit::fingerprint_of;
use crate::state::{AssetId, DerivativeKind, EditFingerprint, EditParams, Priority};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of [`ThumbnailPipelineService::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Served from memory; `on_ready` has already been called
    Ready,
    /// New queue entry
    Queued,
    /// Existing queue entry updated in place
    Updated,
    /// Identical work is already running
    InFlight,
    /// Queue full of better-or-equal work; nothing was queued
    QueueFull,
}

/// Read-only view of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingInfo {
    pub priority: Priority,
    pub sequence: u64,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub pending: usize,
    /// Pending per priority, in `Priority::ALL` order
    pub pending_by_priority: [usize; 4],
    /// Regenerations waiting for queue room
    pub deferred: usize,
    pub in_flight: usize,
    /// Results committed to the cache
    pub completed: u64,
    /// Results dropped because they were superseded
    pub discarded: u64,
    /// Failures reported to the observer
    pub failed: u64,
    /// Requests turned away by a full queue
    pub rejected: u64,
    pub cache: CacheStats,
}

/// Latest request parameters for an asset the caller still cares about.
#[derive(Clone)]
struct Interest {
    provider: Arc<dyn ByteProvider>,
    edit: Option<EditParams>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    generation: u64,
    epoch: u64,
    edit: Option<EditFingerprint>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    completed: u64,
    discarded: u64,
    failed: u64,
    rejected: u64,
}

pub(crate) struct PipelineState {
    queue: PriorityQueue,
    registry: GenerationRegistry,
    interest: HashMap<AssetId, Interest>,
    in_flight: HashMap<AssetId, InFlight>,
    /// Handles detached by `invalidate`, kept alive until the replacement lands
    superseded: HashMap<AssetId, DisplayHandle>,
    /// Invalidated assets whose regeneration found the queue full
    deferred: VecDeque<AssetId>,
    epoch: u64,
    counters: Counters,
}

impl PipelineState {
    fn is_current(&mut self, job: &Job) -> bool {
        job.epoch == self.epoch && self.registry.is_current(&job.item.asset, job.item.generation)
    }

    fn finish_flight(&mut self, job: &Job) {
        let ours = self.in_flight.get(&job.item.asset).is_some_and(|flight| {
            flight.generation == job.item.generation && flight.epoch == job.epoch
        });
        if ours {
            self.in_flight.remove(&job.item.asset);
        }
    }
}

/// State shared between the service handle and its workers.
pub(crate) struct Shared {
    state: Mutex<PipelineState>,
    cache: DerivativeCache,
    codec: Arc<dyn Codec>,
    observer: Arc<dyn PipelineObserver>,
    kind: DerivativeKind,
    work_available: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        // Every state mutation completes before observer or releaser code
        // runs, so a poisoned lock still guards consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    pub(crate) fn cache(&self) -> &DerivativeCache {
        &self.cache
    }

    pub(crate) fn kind(&self) -> DerivativeKind {
        self.kind
    }

    pub(crate) fn work_available(&self) -> &Notify {
        &self.work_available
    }

    /// Enqueue (or serve from memory) with the lock held.
    fn submit(
        &self,
        state: &mut PipelineState,
        asset: AssetId,
        provider: Arc<dyn ByteProvider>,
        priority: Priority,
        edit: Option<EditParams>,
    ) -> RequestStatus {
        let fingerprint = fingerprint_of(edit.as_ref());
        let current = state.registry.current(&asset);

        if let Some(handle) = self.cache.lookup(&asset, fingerprint) {
            // The caller now wants what is resident; pending or running work
            // for other edits is moot.
            state.queue.remove(&asset);
            let other_flight = state
                .in_flight
                .get(&asset)
                .is_some_and(|flight| flight.generation == current && flight.edit != fingerprint);
            if other_flight {
                state.registry.bump(&asset);
            }
            self.observer.on_ready(&asset, &handle);
            return RequestStatus::Ready;
        }

        if let Some(flight) = state.in_flight.get(&asset).copied() {
            if flight.generation == current {
                if flight.edit == fingerprint {
                    state.queue.remove(&asset);
                    return RequestStatus::InFlight;
                }
                debug!(asset = %asset, "superseding in-flight work rendered with other edits");
                state.registry.bump(&asset);
            }
        }

        let generation = state.registry.snapshot(&asset);
        let item = QueueItem::new(asset.clone(), priority, generation, provider, edit);
        match state.queue.enqueue_or_update(item) {
            Ok(Enqueued::Updated) => {
                self.work_available.notify_one();
                RequestStatus::Updated
            }
            Ok(Enqueued::Inserted { evicted }) => {
                if let Some(evicted) = evicted {
                    debug!(
                        asset = %evicted.asset,
                        priority = ?evicted.priority,
                        "queue full, dropped pending request"
                    );
                }
                self.work_available.notify_one();
                RequestStatus::Queued
            }
            Err(full) => {
                debug!(asset = %full.asset, capacity = full.capacity, "queue full, request rejected");
                state.counters.rejected += 1;
                RequestStatus::QueueFull
            }
        }
    }

    fn release_superseded(&self, state: &mut PipelineState, asset: &AssetId) {
        if let Some(handle) = state.superseded.remove(asset) {
            self.cache.release(handle);
        }
    }

    /// Resubmit deferred regenerations while the queue has room.
    fn refill_deferred(&self, state: &mut PipelineState) {
        while state.queue.len() < state.queue.capacity() {
            let Some(asset) = state.deferred.pop_front() else {
                break;
            };
            if state.queue.contains(&asset) {
                continue;
            }
            let Some(interest) = state.interest.get(&asset).cloned() else {
                continue;
            };
            let status = self.submit(
                state,
                asset.clone(),
                interest.provider,
                Priority::Background,
                interest.edit,
            );
            debug!(asset = %asset, ?status, "resubmitted deferred regeneration");
        }
    }

    /// Take the next item off the queue and mark it in flight.
    pub(crate) fn next_job(&self) -> Option<Job> {
        let mut state = self.lock();
        self.refill_deferred(&mut state);
        let item = state.queue.dequeue_highest()?;
        self.refill_deferred(&mut state);
        let edit = fingerprint_of(item.edit.as_ref());
        let epoch = state.epoch;
        state.in_flight.insert(
            item.asset.clone(),
            InFlight {
                generation: item.generation,
                epoch,
                edit,
            },
        );
        if !state.queue.is_empty() {
            // Wake a peer for the rest
            self.work_available.notify_one();
        }
        Some(Job { item, epoch, edit })
    }

    /// Whether a job is still worth running.
    pub(crate) fn is_current(&self, job: &Job) -> bool {
        self.lock().is_current(job)
    }

    /// Drop a job that was superseded before it finished.
    pub(crate) fn discard(&self, job: &Job) {
        let mut state = self.lock();
        state.finish_flight(job);
        state.counters.discarded += 1;
        debug!(asset = %job.item.asset, generation = job.item.generation, "discarding stale work");
    }

    /// Commit a finished derivative if the job is still current.
    pub(crate) fn commit(&self, job: &Job, derived: Derived) {
        let mut state = self.lock();
        state.finish_flight(job);
        if !state.is_current(job) {
            state.counters.discarded += 1;
            debug!(asset = %job.item.asset, generation = job.item.generation, "discarding stale result");
            return;
        }

        let asset = &job.item.asset;
        let handle = match derived {
            Derived::Rendered(bytes) => self.cache.put(asset, bytes, job.edit),
            Derived::Stored(bytes) => self.cache.promote(asset, bytes, job.edit),
        };
        state.counters.completed += 1;
        self.observer.on_ready(asset, &handle);
        self.release_superseded(&mut state, asset);
    }

    /// Report a failure if the job is still current.
    pub(crate) fn fail(&self, job: &Job, error: ThumbnailError) {
        let mut state = self.lock();
        state.finish_flight(job);
        if !state.is_current(job) {
            state.counters.discarded += 1;
            debug!(asset = %job.item.asset, error = %error, "dropping failure of stale work");
            return;
        }
        state.counters.failed += 1;
        warn!(asset = %job.item.asset, error = %error, "derivative generation failed");
        self.observer.on_error(&job.item.asset, &error);
        self.release_superseded(&mut state, &job.item.asset);
    }
}

/// Accepts derivative requests and resolves them through a worker pool.
///
/// Dropping the service stops its workers; use [`shutdown`](Self::shutdown)
/// to also wait for them and for pending durable writes.
pub struct ThumbnailPipelineService {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ThumbnailPipelineService {
    pub fn builder(codec: Arc<dyn Codec>) -> PipelineBuilder {
        PipelineBuilder::new(codec)
    }

    /// Request a derivative.
    ///
    /// Served synchronously from memory when a derivative with the same edit
    /// identity is resident; otherwise queued (or the pending entry updated)
    /// with the asset's current generation.
    pub fn request(
        &self,
        asset: impl Into<AssetId>,
        provider: Arc<dyn ByteProvider>,
        priority: Priority,
        edit: Option<EditParams>,
    ) -> RequestStatus {
        let asset = asset.into();
        let mut state = self.shared.lock();
        state.interest.insert(
            asset.clone(),
            Interest {
                provider: Arc::clone(&provider),
                edit,
            },
        );
        let status = self
            .shared
            .submit(&mut state, asset.clone(), provider, priority, edit);
        if status != RequestStatus::QueueFull {
            state.deferred.retain(|deferred| deferred != &asset);
        }
        status
    }

    /// Re-prioritize a pending request. Returns false when nothing is pending
    /// (already running or resolved).
    pub fn update_priority(&self, asset: &AssetId, priority: Priority) -> bool {
        self.shared.lock().queue.update_priority(asset, priority)
    }

    /// Drop interest in an asset.
    ///
    /// A pending request is removed; a running one keeps running but its
    /// result is discarded.
    pub fn cancel(&self, asset: &AssetId) {
        let mut state = self.shared.lock();
        state.interest.remove(asset);
        let was_pending = state.queue.remove(asset).is_some();
        let in_flight = state.in_flight.contains_key(asset);
        if in_flight {
            state.registry.bump(asset);
        }
        state.deferred.retain(|deferred| deferred != asset);
        self.shared.release_superseded(&mut state, asset);
        self.shared.refill_deferred(&mut state);
        debug!(asset = %asset, was_pending, in_flight, "request cancelled");
    }

    /// The asset's source or edits changed: drop cached derivatives, supersede
    /// outstanding work and, if the asset is still of interest, regenerate it
    /// at `Background` priority.
    ///
    /// The old handle stays alive until the fresh derivative is ready, so a
    /// display can keep showing it in the meantime. When the queue is full the
    /// regeneration is held back and submitted once a slot frees up.
    pub fn invalidate(&self, asset: &AssetId) {
        let mut state = self.shared.lock();
        self.invalidate_locked(&mut state, asset);
    }

    fn invalidate_locked(&self, state: &mut PipelineState, asset: &AssetId) {
        let detached = self.shared.cache.detach(asset);
        let generation = state.registry.bump(asset);

        let Some(interest) = state.interest.get(asset).cloned() else {
            state.queue.remove(asset);
            if let Some(handle) = detached {
                self.shared.cache.release(handle);
            }
            debug!(asset = %asset, generation, "invalidated");
            return;
        };

        if let Some(handle) = detached {
            if let Some(older) = state.superseded.insert(asset.clone(), handle) {
                self.shared.cache.release(older);
            }
        }
        // Regeneration never demotes a request that is already waiting
        let priority = state
            .queue
            .peek(asset)
            .map_or(Priority::Background, |pending| pending.priority.min(Priority::Background));
        let status = self
            .shared
            .submit(state, asset.clone(), interest.provider, priority, interest.edit);
        if status == RequestStatus::QueueFull && !state.deferred.contains(asset) {
            // Retried by the workers as soon as the queue has room
            state.deferred.push_back(asset.clone());
        }
        debug!(asset = %asset, generation, ?status, "invalidated, regenerating");
    }

    /// Replace the edit parameters of an asset and regenerate it.
    pub fn apply_edit(&self, asset: &AssetId, edit: Option<EditParams>) {
        let mut state = self.shared.lock();
        if let Some(interest) = state.interest.get_mut(asset) {
            interest.edit = edit;
        }
        self.invalidate_locked(&mut state, asset);
    }

    /// Switch folders: drop every pending request, the whole cache and all
    /// generation state. Work still running for the previous folder is
    /// discarded when it completes.
    pub fn clear_folder(&self) {
        let mut state = self.shared.lock();
        let dropped = state.queue.drain().len();
        state.interest.clear();
        state.in_flight.clear();
        state.deferred.clear();
        for (_, handle) in state.superseded.drain() {
            self.shared.cache.release(handle);
        }
        self.shared.cache.clear();
        state.registry.clear();
        state.epoch += 1;
        info!(dropped, epoch = state.epoch, "folder cleared");
    }

    /// Pending request for an asset, if any.
    pub fn pending(&self, asset: &AssetId) -> Option<PendingInfo> {
        self.shared.lock().queue.peek(asset).map(|item| PendingInfo {
            priority: item.priority,
            sequence: item.sequence(),
            generation: item.generation,
        })
    }

    /// Whether a worker is currently processing the asset.
    pub fn is_in_flight(&self, asset: &AssetId) -> bool {
        self.shared.lock().in_flight.contains_key(asset)
    }

    pub fn stats(&self) -> PipelineStats {
        let state = self.shared.lock();
        PipelineStats {
            pending: state.queue.len(),
            pending_by_priority: state.queue.depth_by_priority(),
            deferred: state.deferred.len(),
            in_flight: state.in_flight.len(),
            completed: state.counters.completed,
            discarded: state.counters.discarded,
            failed: state.counters.failed,
            rejected: state.counters.rejected,
            cache: self.shared.cache.stats(),
        }
    }

    pub fn kind(&self) -> DerivativeKind {
        self.shared.kind
    }

    /// Stop the workers, wait for them, and flush durable writes.
    ///
    /// Codec calls already running are awaited, not aborted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "thumbnail worker ended abnormally");
            }
        }
        self.shared.cache.flush().await;
        debug!("thumbnail pipeline stopped");
    }
}

impl Drop for ThumbnailPipelineService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ThumbnailPipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailPipelineService")
            .field("kind", &self.shared.kind)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Assembles a [`ThumbnailPipelineService`].
///
/// Defaults: [`PipelineConfig::default`], an in-memory durable store, a
/// releaser that just drops handles, and no observer.
pub struct PipelineBuilder {
    config: PipelineConfig,
    codec: Arc<dyn Codec>,
    store: Option<Arc<dyn DurableStore>>,
    releaser: Arc<dyn HandleReleaser>,
    observer: Arc<dyn PipelineObserver>,
}

impl PipelineBuilder {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            config: PipelineConfig::default(),
            codec,
            store: None,
            releaser: Arc::new(DropReleaser),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable store. The builder does not open `config.store` itself; use
    /// [`StoreConfig::open`](crate::config::StoreConfig::open) for that.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn releaser(mut self, releaser: Arc<dyn HandleReleaser>) -> Self {
        self.releaser = releaser;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate the configuration and spawn the workers on the current
    /// tokio runtime.
    pub fn start(self) -> Result<ThumbnailPipelineService, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn DurableStore>);

        let shared = Arc::new(Shared {
            state: Mutex::new(PipelineState {
                queue: PriorityQueue::new(config.queue_capacity),
                registry: GenerationRegistry::new(),
                interest: HashMap::new(),
                in_flight: HashMap::new(),
                superseded: HashMap::new(),
                deferred: VecDeque::new(),
                epoch: 0,
                counters: Counters::default(),
            }),
            cache: DerivativeCache::new(config.memory_capacity, store, self.releaser),
            codec: self.codec,
            observer: self.observer,
            kind: config.kind,
            work_available: Notify::new(),
        });

        let shutdown = CancellationToken::new();
        let workers = (0..config.workers)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&shared), shutdown.clone())))
            .collect();

        info!(
            workers = config.workers,
            kind = ?config.kind,
            memory_capacity = config.memory_capacity,
            queue_capacity = config.queue_capacity,
            "thumbnail pipeline started"
        );

        Ok(ThumbnailPipelineService {
            shared,
            workers: Mutex::new(workers),
            shutdown,
        })
    }
}
