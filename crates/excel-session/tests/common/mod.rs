//! In-process stand-in for the Excel bridge.
//!
//! Workbooks are JSON files on disk so saves and reopen round trips are real.
//! The shared [`FakeState`] counts launches and lets a test kill hosts, mark
//! paths busy or locked, fail closes and slow every cell call down.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use excel_session::host::hresult;
use excel_session::{
    CellValue, DocumentContext, HostError, HostFactory, HostHandle, InstancePool, PoolConfig,
    SheetRef,
};
use serde::{Deserialize, Serialize};

#[derive(Default)]
pub struct FakeState {
    pub launches: AtomicUsize,
    pub terminations: AtomicUsize,
    pub opens: AtomicUsize,
    pub fail_launch: AtomicBool,
    kills_pending: AtomicUsize,
    busy: Mutex<HashSet<PathBuf>>,
    locked: Mutex<HashSet<PathBuf>>,
    failing_close: Mutex<HashSet<PathBuf>>,
    delay: Mutex<Duration>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeState {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// The next `n` host calls each kill the host they run on.
    pub fn kill_next(&self, n: usize) {
        self.kills_pending.store(n, Ordering::SeqCst);
    }

    pub fn mark_busy(&self, path: &Path) {
        self.busy.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn mark_locked(&self, path: &Path) {
        self.locked.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn unmark(&self, path: &Path) {
        self.busy.lock().unwrap().remove(path);
        self.locked.lock().unwrap().remove(path);
    }

    pub fn fail_close(&self, path: &Path) {
        self.failing_close.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn slow_calls(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn take_kill(&self) -> bool {
        self.kills_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn disconnected() -> HostError {
    HostError::Com {
        hresult: hresult::RPC_E_DISCONNECTED,
        message: "The object invoked has disconnected from its clients.".into(),
    }
}

/// Liveness shared by a host and the documents it opened.
#[derive(Clone)]
struct Liveness {
    alive: Arc<AtomicBool>,
    state: Arc<FakeState>,
}

impl Liveness {
    fn check(&self) -> Result<(), HostError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(disconnected());
        }
        if self.state.take_kill() {
            self.alive.store(false, Ordering::SeqCst);
            return Err(disconnected());
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeFactory {
    pub state: Arc<FakeState>,
}

impl HostFactory for FakeFactory {
    type Host = FakeHost;

    fn launch(&self) -> Result<FakeHost, HostError> {
        if self.state.fail_launch.load(Ordering::SeqCst) {
            return Err(HostError::WineNotFound);
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        Ok(FakeHost {
            live: Liveness {
                alive: Arc::new(AtomicBool::new(true)),
                state: Arc::clone(&self.state),
            },
        })
    }
}

pub struct FakeHost {
    live: Liveness,
}

#[derive(Default, Serialize, Deserialize)]
struct Stored {
    cells: BTreeMap<String, CellValue>,
    formulas: BTreeMap<String, String>,
}

pub struct FakeBook {
    path: PathBuf,
    stored: Stored,
    live: Liveness,
}

impl FakeBook {
    fn call<T>(&mut self, op: impl FnOnce(&mut Stored) -> T) -> Result<T, HostError> {
        self.live.check()?;
        let state = &self.live.state;
        let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = *state.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let out = op(&mut self.stored);
        state.active.fetch_sub(1, Ordering::SeqCst);
        Ok(out)
    }
}

fn cell_key(sheet: &SheetRef, cell: &str) -> String {
    format!("{sheet}!{}", cell.to_uppercase())
}

impl HostHandle for FakeHost {
    type Document = FakeBook;

    fn open_document(&mut self, path: &Path) -> Result<FakeBook, HostError> {
        self.live.check()?;
        let state = &self.live.state;
        if state.busy.lock().unwrap().contains(path) {
            return Err(HostError::Com {
                hresult: hresult::RPC_E_CALL_REJECTED,
                message: "Call was rejected by callee.".into(),
            });
        }
        if state.locked.lock().unwrap().contains(path) {
            return Err(HostError::Com {
                hresult: hresult::ERROR_SHARING_VIOLATION,
                message: "The file is locked for editing by another user.".into(),
            });
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| HostError::failed(format!("cannot open {}: {e}", path.display())))?;
        let stored: Stored = serde_json::from_str(&text).unwrap_or_default();
        state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(FakeBook {
            path: path.to_path_buf(),
            stored,
            live: self.live.clone(),
        })
    }

    fn create_document(&mut self, path: &Path) -> Result<FakeBook, HostError> {
        self.live.check()?;
        std::fs::write(path, "{}").map_err(|e| HostError::failed(e.to_string()))?;
        self.live.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(FakeBook {
            path: path.to_path_buf(),
            stored: Stored::default(),
            live: self.live.clone(),
        })
    }

    fn save_document(&mut self, document: &mut FakeBook) -> Result<(), HostError> {
        self.live.check()?;
        let text = serde_json::to_string(&document.stored)?;
        std::fs::write(&document.path, text).map_err(|e| HostError::failed(e.to_string()))
    }

    fn close_document(&mut self, document: FakeBook) -> Result<(), HostError> {
        self.live.check()?;
        if self.live.state.failing_close.lock().unwrap().contains(&document.path) {
            return Err(HostError::failed("workbook refused to close"));
        }
        Ok(())
    }

    fn recalculate(&mut self) -> Result<(), HostError> {
        self.live.check()
    }

    fn terminate(self) -> Result<(), HostError> {
        self.live.state.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl DocumentContext for FakeBook {
    fn path(&self) -> &Path {
        &self.path
    }

    fn set_cell_value(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        value: CellValue,
    ) -> Result<(), HostError> {
        let key = cell_key(sheet, cell);
        self.call(|stored| {
            stored.formulas.remove(&key);
            stored.cells.insert(key, value);
        })
    }

    fn get_cell_value(&mut self, sheet: &SheetRef, cell: &str) -> Result<CellValue, HostError> {
        let key = cell_key(sheet, cell);
        self.call(|stored| stored.cells.get(&key).cloned().unwrap_or(CellValue::Null))
    }

    fn set_cell_formula(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        formula: &str,
    ) -> Result<(), HostError> {
        let key = cell_key(sheet, cell);
        self.call(|stored| {
            stored.formulas.insert(key, formula.to_string());
        })
    }

    fn get_cell_formula(&mut self, sheet: &SheetRef, cell: &str) -> Result<String, HostError> {
        let key = cell_key(sheet, cell);
        self.call(|stored| stored.formulas.get(&key).cloned().unwrap_or_default())
    }
}

/// A workbook file the fake host can open.
pub fn workbook(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "{}").unwrap();
    path
}

pub fn pool(config: PoolConfig) -> (InstancePool<FakeFactory>, Arc<FakeState>) {
    let factory = FakeFactory::default();
    let state = Arc::clone(&factory.state);
    (InstancePool::new(factory, config), state)
}

/// Config with a short admission wait and no background reclaim during the test.
pub fn test_config(max_instances: usize) -> PoolConfig {
    PoolConfig::default()
        .with_max_instances(max_instances)
        .with_admission_wait(Duration::from_millis(100))
        .with_reclaim_interval(Duration::from_secs(3600))
}

pub fn set(
    cell: &'static str,
    value: f64,
) -> impl FnMut(&mut FakeHost, &mut FakeBook) -> Result<(), HostError> + Send + 'static {
    move |_, book| book.set_cell_value(&SheetRef::default(), cell, value.into())
}

pub fn get(
    cell: &'static str,
) -> impl FnMut(&mut FakeHost, &mut FakeBook) -> Result<CellValue, HostError> + Send + 'static {
    move |_, book| book.get_cell_value(&SheetRef::default(), cell)
}
