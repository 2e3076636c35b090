//! Capacity-bounded pool of Excel instances keyed by workbook path.
//!
//! Each workbook path gets its own host process, started on first use and
//! kept warm afterwards so repeated short operations only pay for the host
//! startup once. At most [`PoolConfig::max_instances`] hosts are alive at a
//! time; a background task shuts down the ones left idle.
//!
//! # Locking
//!
//! Every instance has a Tokio mutex around its host and document. Work runs on
//! a blocking thread that owns the lock guard, so a caller that stops waiting
//! (timeout, cancellation) never leaves the lock held: it is released when the
//! host call returns.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::host::{HostError, HostFactory, HostHandle};
use crate::instance::{OpenMode, PooledInstance, RunMode, Slot};
use crate::path::{absolute_path, PathKey};

/// The document type produced by a factory's hosts.
pub type Document<F> = <<F as HostFactory>::Host as HostHandle>::Document;

type Instance<F> = PooledInstance<<F as HostFactory>::Host>;

/// Bounds for one batch execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Give up waiting after this long (lock wait included).
    pub timeout: Option<Duration>,
    /// Give up waiting when this token is cancelled.
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Pool of Excel instances. Cheap to clone; clones share the same pool.
pub struct InstancePool<F: HostFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: HostFactory> Clone for InstancePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<F: HostFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    instances: DashMap<PathKey, Arc<Instance<F>>>,
    gate: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl<F: HostFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<F: HostFactory> InstancePool<F> {
    /// Create a pool and start its idle reclaimer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let max_instances = config.max_instances.max(1);
        let reclaim_interval = config.reclaim_interval.max(Duration::from_millis(10));

        let inner = Arc::new(PoolInner {
            factory: Arc::new(factory),
            config: PoolConfig {
                max_instances,
                ..config
            },
            instances: DashMap::new(),
            gate: Arc::new(Semaphore::new(max_instances)),
            shutdown: CancellationToken::new(),
        });

        spawn_reclaimer(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            reclaim_interval,
        );

        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Number of pooled instances (each holds one admission permit).
    pub fn live_instances(&self) -> usize {
        self.inner.instances.len()
    }

    /// Instance slots still free.
    pub fn available_permits(&self) -> usize {
        self.inner.gate.available_permits()
    }

    /// Whether an instance is pooled for this path.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        key_for(path.as_ref())
            .map(|(_, key)| self.inner.instances.contains_key(&key))
            .unwrap_or(false)
    }

    /// Run `work` against the workbook at `path`, reusing the pooled instance
    /// for that file or starting one.
    ///
    /// With `persist` the workbook is saved after `work` succeeds. The document
    /// stays open afterwards; use [`InstancePool::close_document`] to release
    /// the file. If `work` (or the save) fails, the document is closed without
    /// saving and the host is kept for the next call.
    pub async fn with_workbook<T, W>(
        &self,
        path: impl AsRef<Path>,
        persist: bool,
        work: W,
    ) -> Result<T>
    where
        T: Send + 'static,
        W: FnMut(&mut F::Host, &mut Document<F>) -> std::result::Result<T, HostError>
            + Send
            + 'static,
    {
        let (path, key) = key_for(path.as_ref())?;
        if !path.exists() {
            return Err(Error::FileNotFound(path));
        }
        let mode = RunMode {
            open: OpenMode::Existing,
            persist,
            close_on_failure: true,
        };

        loop {
            let instance = self.checkout(&key, &path).await?;
            if instance.is_leased() {
                return Err(Error::SessionActive { path });
            }
            let slot = instance.lock().await;
            if instance.is_retired() {
                // Evicted or reclaimed while we waited for the lock.
                drop(slot);
                self.forget(&instance);
                tokio::task::yield_now().await;
                continue;
            }
            if instance.is_leased() {
                return Err(Error::SessionActive { path });
            }
            return self.run_locked(instance, slot, mode, work).await;
        }
    }

    /// Close the workbook open for `path` but keep its Excel instance pooled.
    ///
    /// Returns `false` if nothing was open.
    pub async fn close_document(&self, path: impl AsRef<Path>) -> Result<bool> {
        let (path, key) = key_for(path.as_ref())?;
        let Some(instance) = self.lookup(&key) else {
            return Ok(false);
        };
        if instance.is_leased() {
            return Err(Error::SessionActive { path });
        }

        let slot = instance.lock().await;
        if instance.is_retired() || !slot.has_document() {
            return Ok(false);
        }

        let closed = self.settle(instance, slot, |slot| slot.close_document()).await?;
        closed.map_err(|source| Error::Close { path, source })
    }

    /// Remove the instance for `path` and shut its Excel down.
    ///
    /// Waits for in-flight work on that instance. Returns `false` if the path
    /// had no instance.
    pub async fn evict(&self, path: impl AsRef<Path>) -> Result<bool> {
        let (_, key) = key_for(path.as_ref())?;
        let Some(instance) = self.lookup(&key) else {
            return Ok(false);
        };

        // Stays mapped until the host is gone; callers for this file wait on
        // the lock and never see a second host.
        let slot = instance.lock().await;
        if instance.is_retired() {
            self.forget(&instance);
            return Ok(false);
        }

        tracing::info!(path = %instance.path().display(), "Evicting Excel instance");
        self.retire(Arc::clone(&instance), slot).await;
        self.forget(&instance);
        Ok(true)
    }

    /// Retire every instance idle for longer than the idle timeout.
    ///
    /// Instances leased by a session or currently running work are skipped.
    /// Returns how many were retired. The background reclaimer calls this on
    /// every tick.
    pub async fn reclaim_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let snapshot: Vec<Arc<Instance<F>>> = self
            .inner
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut retired = 0;
        for instance in snapshot {
            if instance.is_retired() {
                self.forget(&instance);
                continue;
            }
            if instance.is_leased() || instance.idle_for() < idle_timeout {
                continue;
            }
            let Some(slot) = instance.try_lock() else {
                continue;
            };
            if instance.is_retired()
                || instance.is_leased()
                || instance.idle_for() < idle_timeout
                || !self.is_mapped(&instance)
            {
                continue;
            }

            tracing::info!(
                path = %instance.path().display(),
                idle_secs = instance.idle_for().as_secs(),
                "Retiring idle Excel instance"
            );
            self.retire(Arc::clone(&instance), slot).await;
            self.forget(&instance);
            retired += 1;
        }
        retired
    }

    /// Stop the reclaimer, refuse new instances and shut down every pooled one.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.gate.close();

        let keys: Vec<PathKey> = self
            .inner
            .instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            let removed = self.inner.instances.remove(&key);
            if let Some((_, instance)) = removed {
                let slot = instance.lock().await;
                self.retire(instance, slot).await;
            }
        }
        tracing::info!("Instance pool shut down");
    }

    // -- Session support --

    /// Claim the instance for `path` for exclusive use by one session.
    pub(crate) async fn lease(&self, path: &Path) -> Result<Arc<Instance<F>>> {
        let key = PathKey::new(path)?;
        loop {
            let instance = self.checkout(&key, path).await?;
            if !instance.try_lease() {
                return Err(Error::SessionActive {
                    path: path.to_path_buf(),
                });
            }
            if instance.is_retired() {
                instance.end_lease();
                self.forget(&instance);
                tokio::task::yield_now().await;
                continue;
            }
            return Ok(instance);
        }
    }

    /// Run work on a leased instance, bounded by `options`.
    pub(crate) async fn run_leased<T, W>(
        &self,
        instance: &Arc<Instance<F>>,
        options: ExecuteOptions,
        mode: RunMode,
        work: W,
    ) -> Result<T>
    where
        T: Send + 'static,
        W: FnMut(&mut F::Host, &mut Document<F>) -> std::result::Result<T, HostError>
            + Send
            + 'static,
    {
        let pool = self.clone();
        let instance = Arc::clone(instance);
        let run = async move {
            let slot = instance.lock().await;
            if instance.is_retired() {
                return Err(Error::InstanceRetired(instance.path().to_path_buf()));
            }
            pool.run_locked(instance, slot, mode, work).await
        };
        bounded(run, options).await
    }

    /// Close the session's document and end its lease. The host stays pooled.
    pub(crate) async fn release(&self, instance: &Arc<Instance<F>>) -> Result<()> {
        let slot = instance.lock().await;
        if instance.is_retired() {
            instance.end_lease();
            return Ok(());
        }

        let path = instance.path().to_path_buf();
        let closed = self
            .settle(Arc::clone(instance), slot, |slot| slot.close_document())
            .await;
        instance.end_lease();
        instance.touch();

        match closed? {
            Ok(_) => Ok(()),
            Err(source) => Err(Error::Close { path, source }),
        }
    }

    /// End a lease that never became a session.
    pub(crate) fn abandon_lease(&self, instance: &Arc<Instance<F>>) {
        instance.end_lease();
        instance.touch();
    }

    // -- Internals --

    fn lookup(&self, key: &PathKey) -> Option<Arc<Instance<F>>> {
        self.inner
            .instances
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Find the instance for `key`, admitting a new one if there is none.
    async fn checkout(&self, key: &PathKey, path: &Path) -> Result<Arc<Instance<F>>> {
        if let Some(instance) = self.lookup(key) {
            return Ok(instance);
        }

        let permit = self.admit().await?;

        let instance = match self.inner.instances.entry(key.clone()) {
            // Lost the race for this key; our permit goes back to the gate.
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let instance = Arc::new(PooledInstance::new(
                    key.clone(),
                    path.to_path_buf(),
                    permit,
                ));
                entry.insert(Arc::clone(&instance));
                instance
            }
        };
        tracing::debug!(key = %key, live = self.live_instances(), "Checked out instance");
        Ok(instance)
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        let config = &self.inner.config;
        let gate = Arc::clone(&self.inner.gate);

        match tokio::time::timeout(config.admission_wait, gate.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(Error::ShuttingDown),
            Err(_elapsed) => {
                let live = self.live_instances();
                tracing::warn!(
                    live,
                    max = config.max_instances,
                    "Excel instance limit reached"
                );
                Err(Error::CapacityExceeded {
                    live,
                    max: config.max_instances,
                    idle_timeout: config.idle_timeout,
                })
            }
        }
    }

    async fn run_locked<T, W>(
        &self,
        instance: Arc<Instance<F>>,
        slot: OwnedMutexGuard<Slot<F::Host>>,
        mode: RunMode,
        mut work: W,
    ) -> Result<T>
    where
        T: Send + 'static,
        W: FnMut(&mut F::Host, &mut Document<F>) -> std::result::Result<T, HostError>
            + Send
            + 'static,
    {
        let factory = Arc::clone(&self.inner.factory);
        let path = instance.path().to_path_buf();
        self.settle(instance, slot, move |slot| {
            slot.run(&*factory, &path, mode, &mut work)
        })
        .await?
    }

    /// Run `op` on the locked slot in a blocking thread.
    ///
    /// An instance left without a host afterwards (launch failure, or a host
    /// that died and could not be replaced) is retired and dropped from the pool
    /// so its permit is freed.
    async fn settle<R, Op>(
        &self,
        instance: Arc<Instance<F>>,
        slot: OwnedMutexGuard<Slot<F::Host>>,
        op: Op,
    ) -> Result<R>
    where
        R: Send + 'static,
        Op: FnOnce(&mut Slot<F::Host>) -> R + Send + 'static,
    {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut slot = slot;
            instance.touch();
            let result = op(&mut *slot);
            if !slot.has_host() {
                instance.mark_retired();
                slot.retire(instance.path());
                if pool.forget(&instance) {
                    tracing::info!(path = %instance.path().display(), "Dropped instance without a running host");
                }
            }
            instance.touch();
            result
        })
        .await
        .map_err(|e| Error::WorkerPanicked(e.to_string()))
    }

    async fn retire(&self, instance: Arc<Instance<F>>, slot: OwnedMutexGuard<Slot<F::Host>>) {
        instance.mark_retired();
        let worker = Arc::clone(&instance);
        let joined = tokio::task::spawn_blocking(move || {
            let mut slot = slot;
            slot.retire(worker.path());
        })
        .await;
        if let Err(e) = joined {
            tracing::warn!(path = %instance.path().display(), error = %e, "Retiring instance panicked");
        }
    }

    fn is_mapped(&self, instance: &Arc<Instance<F>>) -> bool {
        self.inner
            .instances
            .get(instance.key())
            .is_some_and(|current| Arc::ptr_eq(current.value(), instance))
    }

    /// Remove this exact instance from the map. False if it was already gone
    /// or replaced.
    fn forget(&self, instance: &Arc<Instance<F>>) -> bool {
        self.inner
            .instances
            .remove_if(instance.key(), |_, current| Arc::ptr_eq(current, instance))
            .is_some()
    }
}

fn key_for(path: &Path) -> Result<(std::path::PathBuf, PathKey)> {
    let path = absolute_path(path)?;
    let key = PathKey::new(&path)?;
    Ok((path, key))
}

/// Apply the timeout and cancellation in `options` to `run`.
async fn bounded<T>(run: impl Future<Output = Result<T>>, options: ExecuteOptions) -> Result<T> {
    let timed = async move {
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .unwrap_or(Err(Error::Timeout(limit))),
            None => run.await,
        }
    };

    match options.cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = timed => result,
        },
        None => timed.await,
    }
}

fn spawn_reclaimer<F: HostFactory>(
    inner: Weak<PoolInner<F>>,
    shutdown: CancellationToken,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let retired = InstancePool { inner }.reclaim_idle().await;
            if retired > 0 {
                tracing::debug!(retired, "Idle scan finished");
            }
        }
    });
}
