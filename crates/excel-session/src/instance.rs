//! A single pooled Excel instance and the attempt/retry logic that runs under
//! its lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit};

use crate::error::{Error, Result};
use crate::host::{FailureClass, HostError, HostFactory, HostHandle};
use crate::path::PathKey;

/// One host process bound to one workbook path.
///
/// The host and its document live in the [`Slot`] behind the async lock; the
/// flags and the timestamp are readable without it.
pub(crate) struct PooledInstance<H: HostHandle> {
    key: PathKey,
    path: PathBuf,
    slot: Arc<AsyncMutex<Slot<H>>>,
    last_used: Mutex<Instant>,
    leased: AtomicBool,
    retired: AtomicBool,
}

impl<H: HostHandle> PooledInstance<H> {
    pub(crate) fn new(key: PathKey, path: PathBuf, permit: OwnedSemaphorePermit) -> Self {
        Self {
            key,
            path,
            slot: Arc::new(AsyncMutex::new(Slot {
                host: None,
                document: None,
                permit: Some(permit),
            })),
            last_used: Mutex::new(Instant::now()),
            leased: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &PathKey {
        &self.key
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn lock(&self) -> OwnedMutexGuard<Slot<H>> {
        Arc::clone(&self.slot).lock_owned().await
    }

    pub(crate) fn try_lock(&self) -> Option<OwnedMutexGuard<Slot<H>>> {
        Arc::clone(&self.slot).try_lock_owned().ok()
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Claim the instance for a session. Fails if another session holds it.
    pub(crate) fn try_lease(&self) -> bool {
        self.leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_lease(&self) {
        self.leased.store(false, Ordering::Release);
    }

    pub(crate) fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Only called while holding the slot lock.
    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// What to do when the document is not open yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMode {
    Existing,
    /// Create the workbook at the path unless an earlier attempt already did.
    Create,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RunMode {
    pub open: OpenMode,
    /// Save the document after the work succeeds.
    pub persist: bool,
    /// Close the document when the work (or the save) fails.
    pub close_on_failure: bool,
}

enum AttemptError {
    Invalidated(HostError),
    Failed(Error),
}

/// Lock-protected state of a [`PooledInstance`].
pub(crate) struct Slot<H: HostHandle> {
    host: Option<H>,
    document: Option<H::Document>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<H: HostHandle> Slot<H> {
    pub(crate) fn has_host(&self) -> bool {
        self.host.is_some()
    }

    pub(crate) fn has_document(&self) -> bool {
        self.document.is_some()
    }

    /// Run `work` against the open document, launching the host and opening
    /// the document first if needed.
    ///
    /// An invalidated host is replaced and the whole attempt is repeated once.
    pub(crate) fn run<F, T, W>(
        &mut self,
        factory: &F,
        path: &Path,
        mode: RunMode,
        work: &mut W,
    ) -> Result<T>
    where
        F: HostFactory<Host = H>,
        W: FnMut(&mut H, &mut H::Document) -> std::result::Result<T, HostError>,
    {
        let first = match self.attempt(factory, path, mode, work) {
            Ok(value) => return Ok(value),
            Err(AttemptError::Failed(err)) => return Err(self.after_failure(err, path, mode)),
            Err(AttemptError::Invalidated(source)) => source,
        };

        tracing::warn!(
            path = %path.display(),
            error = %first,
            "Excel instance invalidated, relaunching and retrying once"
        );
        self.discard_host();

        match self.attempt(factory, path, mode, work) {
            Ok(value) => {
                tracing::info!(path = %path.display(), "Recovered from invalidated Excel instance");
                Ok(value)
            }
            Err(AttemptError::Failed(err)) => Err(self.after_failure(err, path, mode)),
            Err(AttemptError::Invalidated(source)) => {
                self.discard_host();
                Err(Error::HandleInvalidated {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    fn attempt<F, T, W>(
        &mut self,
        factory: &F,
        path: &Path,
        mode: RunMode,
        work: &mut W,
    ) -> std::result::Result<T, AttemptError>
    where
        F: HostFactory<Host = H>,
        W: FnMut(&mut H, &mut H::Document) -> std::result::Result<T, HostError>,
    {
        let (host, document) = self.ready(factory, path, mode.open)?;

        let value = work(&mut *host, &mut *document).map_err(|err| match err.classify() {
            FailureClass::HandleInvalidated => AttemptError::Invalidated(err),
            _ => AttemptError::Failed(Error::Work(err)),
        })?;

        if mode.persist {
            host.save_document(document)
                .map_err(|source| match source.classify() {
                    FailureClass::HandleInvalidated => AttemptError::Invalidated(source),
                    _ => AttemptError::Failed(Error::Save {
                        path: path.to_path_buf(),
                        source,
                    }),
                })?;
        }

        Ok(value)
    }

    fn ready<F>(
        &mut self,
        factory: &F,
        path: &Path,
        open: OpenMode,
    ) -> std::result::Result<(&mut H, &mut H::Document), AttemptError>
    where
        F: HostFactory<Host = H>,
    {
        let host = match self.host.take() {
            Some(host) => host,
            None => {
                let host = factory
                    .launch()
                    .map_err(|e| AttemptError::Failed(Error::Launch(e)))?;
                tracing::info!(path = %path.display(), "Launched Excel instance");
                host
            }
        };
        let host = self.host.insert(host);

        let document = match self.document.take() {
            Some(document) => document,
            None => open_document(host, path, open)?,
        };
        let document = self.document.insert(document);

        Ok((host, document))
    }

    fn after_failure(&mut self, err: Error, path: &Path, mode: RunMode) -> Error {
        if mode.close_on_failure && matches!(err, Error::Work(_) | Error::Save { .. }) {
            // Next call on this key starts from the saved file.
            if let Err(e) = self.close_document() {
                tracing::debug!(path = %path.display(), error = %e, "Closing document after failure failed");
            }
        }
        err
    }

    /// Close the open document without saving. Returns whether one was open.
    pub(crate) fn close_document(&mut self) -> std::result::Result<bool, HostError> {
        let Some(document) = self.document.take() else {
            return Ok(false);
        };
        let Some(host) = self.host.as_mut() else {
            return Ok(false);
        };

        match host.close_document(document) {
            Ok(()) => Ok(true),
            Err(e) => {
                if e.classify() == FailureClass::HandleInvalidated {
                    self.discard_host();
                }
                Err(e)
            }
        }
    }

    /// Drop the document and stop the host without touching the permit.
    fn discard_host(&mut self) {
        self.document = None;
        if let Some(host) = self.host.take() {
            if let Err(e) = host.terminate() {
                tracing::debug!(error = %e, "Ignoring shutdown failure of discarded host");
            }
        }
    }

    /// Close the document, stop the host and give the admission permit back.
    pub(crate) fn retire(&mut self, path: &Path) {
        if let Err(e) = self.close_document() {
            tracing::debug!(path = %path.display(), error = %e, "Closing document during retire failed");
        }
        if let Some(host) = self.host.take() {
            if let Err(e) = host.terminate() {
                tracing::warn!(path = %path.display(), error = %e, "Excel did not shut down cleanly");
            }
        }
        drop(self.permit.take());
    }
}

fn open_document<H: HostHandle>(
    host: &mut H,
    path: &Path,
    mode: OpenMode,
) -> std::result::Result<H::Document, AttemptError> {
    let opened = match mode {
        OpenMode::Create if !path.exists() => host.create_document(path),
        _ => host.open_document(path),
    };

    opened.map_err(|source| {
        let class = source.classify();
        if class != FailureClass::Fatal {
            tracing::debug!(path = %path.display(), error = %source, ?class, "Open failed");
        }
        let path = path.to_path_buf();
        match class {
            FailureClass::HandleInvalidated => AttemptError::Invalidated(source),
            FailureClass::HostBusy => AttemptError::Failed(Error::HostBusy { path }),
            FailureClass::FileLocked => AttemptError::Failed(Error::FileLocked { path }),
            FailureClass::Fatal => AttemptError::Failed(Error::Open { path, source }),
        }
    })
}
