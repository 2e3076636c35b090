//! Session layer: opaque ids over leased pool instances.
//!
//! A session holds one workbook open in its pooled Excel instance between
//! calls. Callers thread the id through [`SessionManager::execute`] and
//! [`SessionManager::save`], then [`SessionManager::close`] it; the Excel
//! process stays warm in the pool afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::host::{HostError, HostFactory, HostHandle};
use crate::instance::{OpenMode, PooledInstance, RunMode};
use crate::path::absolute_path;
use crate::pool::{Document, ExecuteOptions, InstancePool};

/// An open workbook bound to a session id.
pub struct Session<H: HostHandle> {
    id: String,
    path: PathBuf,
    opened_at: DateTime<Utc>,
    instance: Arc<PooledInstance<H>>,
}

impl<H: HostHandle> Session<H> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            path: self.path.clone(),
            opened_at: self.opened_at,
        }
    }
}

impl<H: HostHandle> std::fmt::Debug for Session<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

/// Serializable summary of an open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub path: PathBuf,
    pub opened_at: DateTime<Utc>,
}

/// Registry of open sessions. Cheap to clone; clones share the registry.
pub struct SessionManager<F: HostFactory> {
    pool: InstancePool<F>,
    sessions: Arc<DashMap<String, Arc<Session<F::Host>>>>,
}

impl<F: HostFactory> Clone for SessionManager<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<F: HostFactory> SessionManager<F> {
    pub fn new(pool: InstancePool<F>) -> Self {
        Self {
            pool,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn pool(&self) -> &InstancePool<F> {
        &self.pool
    }

    /// Open an existing workbook and return the new session id.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = absolute_path(path.as_ref())?;
        if !path.exists() {
            return Err(Error::FileNotFound(path));
        }
        self.start(path, OpenMode::Existing).await
    }

    /// Create a new empty workbook at `path` and open a session on it.
    pub async fn create(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = absolute_path(path.as_ref())?;
        if path.exists() {
            return Err(Error::FileExists(path));
        }
        self.start(path, OpenMode::Create).await
    }

    async fn start(&self, path: PathBuf, open: OpenMode) -> Result<String> {
        let mode = RunMode {
            open,
            persist: false,
            close_on_failure: false,
        };

        let instance = loop {
            let instance = self.pool.lease(&path).await?;
            let opened = self
                .pool
                .run_leased(&instance, ExecuteOptions::default(), mode, |_, _| Ok(()))
                .await;
            match opened {
                Ok(()) => break instance,
                Err(Error::InstanceRetired(_)) => {
                    self.pool.abandon_lease(&instance);
                    tracing::debug!(path = %path.display(), "Instance retired during open, leasing again");
                }
                Err(e) => {
                    self.pool.abandon_lease(&instance);
                    return Err(e);
                }
            }
        };

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session {
            id: id.clone(),
            path: path.clone(),
            opened_at: Utc::now(),
            instance: Arc::clone(&instance),
        });

        let collided = match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(entry) => {
                entry.insert(session);
                false
            }
        };
        if collided {
            if let Err(e) = self.pool.release(&instance).await {
                tracing::warn!(path = %path.display(), error = %e, "Releasing collided session failed");
            }
            return Err(Error::SessionIdCollision(id));
        }

        tracing::info!(session = %id, path = %path.display(), "Session opened");
        Ok(id)
    }

    /// Look up a session. `None` for unknown or closed ids.
    pub fn get(&self, id: &str) -> Option<Arc<Session<F::Host>>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// All open sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Run `work` against the session's workbook, optionally bounded by
    /// `timeout`. Calls on the same session run one at a time.
    pub async fn execute<T, W>(&self, id: &str, timeout: Option<Duration>, work: W) -> Result<T>
    where
        T: Send + 'static,
        W: FnMut(&mut F::Host, &mut Document<F>) -> std::result::Result<T, HostError>
            + Send
            + 'static,
    {
        let options = ExecuteOptions {
            timeout,
            cancel: None,
        };
        self.execute_with(id, options, work).await
    }

    /// Like [`SessionManager::execute`] with a cancellation token as well.
    ///
    /// A timed-out or cancelled call stops waiting immediately. Work already
    /// running inside Excel finishes in the background and releases the
    /// instance when it does.
    pub async fn execute_with<T, W>(&self, id: &str, options: ExecuteOptions, work: W) -> Result<T>
    where
        T: Send + 'static,
        W: FnMut(&mut F::Host, &mut Document<F>) -> std::result::Result<T, HostError>
            + Send
            + 'static,
    {
        let session = self
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let mode = RunMode {
            open: OpenMode::Existing,
            persist: false,
            close_on_failure: false,
        };
        self.pool
            .run_leased(&session.instance, options, mode, work)
            .await
    }

    /// Save the session's workbook. `Ok(false)` if the id is unknown.
    pub async fn save(&self, id: &str) -> Result<bool> {
        let Some(session) = self.get(id) else {
            return Ok(false);
        };
        let mode = RunMode {
            open: OpenMode::Existing,
            persist: true,
            close_on_failure: false,
        };
        self.pool
            .run_leased(&session.instance, ExecuteOptions::default(), mode, |_, _| {
                Ok(())
            })
            .await?;
        tracing::debug!(session = %id, "Session saved");
        Ok(true)
    }

    /// Close the session without saving. `Ok(false)` if the id is unknown.
    ///
    /// The id is unregistered before the workbook is closed, so no other call
    /// can reach a half-closed session.
    pub async fn close(&self, id: &str) -> Result<bool> {
        let Some((_, session)) = self.sessions.remove(id) else {
            return Ok(false);
        };
        let released = self.pool.release(&session.instance).await;
        tracing::info!(session = %id, path = %session.path.display(), "Session closed");
        released.map(|()| true)
    }

    /// Close every session, then shut the pool down. Close failures are logged
    /// and skipped.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!(session = %id, error = %e, "Failed to close session during shutdown");
            }
        }
        self.pool.shutdown().await;
    }
}
