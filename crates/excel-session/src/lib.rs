//! Pooled Excel automation sessions over a WINE-hosted COM bridge.
//!
//! Excel is slow to start and not safe to drive from several threads at once.
//! This crate keeps one warm Excel process per workbook path, bounds how many
//! exist at a time, retires idle ones, and serializes every call against a
//! given workbook. On top of the pool, [`SessionManager`] hands out opaque
//! session ids for multi-step work on one open workbook.
//!
//! # Architecture
//!
//! ```text
//! SessionManager (opaque ids, timeouts, cancellation)
//!     └── InstancePool (one instance per path, admission gate, idle reclaim)
//!           └── HostFactory / HostHandle (ExcelBridgeFactory in production)
//!                 └── spawns: wine excel-com-bridge.exe
//!                       └── COM: Excel.Application
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use excel_session::{
//!     DocumentContext, ExcelBridgeConfig, ExcelBridgeFactory, InstancePool, PoolConfig,
//!     SessionManager, SheetRef,
//! };
//! use std::time::Duration;
//!
//! # async fn run() -> excel_session::Result<()> {
//! let factory = ExcelBridgeFactory::new(ExcelBridgeConfig::default());
//! let sessions = SessionManager::new(InstancePool::new(factory, PoolConfig::default()));
//!
//! let id = sessions.create("report.xlsx").await?;
//! sessions
//!     .execute(&id, Some(Duration::from_secs(30)), |_, book| {
//!         book.set_cell_value(&SheetRef::default(), "A1", 42.0.into())
//!     })
//!     .await?;
//! sessions.save(&id).await?;
//! sessions.close(&id).await?;
//! sessions.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod bridge;
mod config;
mod error;
pub mod host;
mod instance;
mod path;
mod pool;
mod session;
mod workbook;

pub use bridge::{linux_to_wine_path, BridgeProcess, ExcelBridgeConfig, ExcelBridgeFactory};
pub use config::PoolConfig;
pub use error::{Error, Result};
pub use excel_com_protocol::{CellError, CellValue, HostOptions, SheetRef};
pub use host::{DocumentContext, FailureClass, HostError, HostFactory, HostHandle};
pub use path::{absolute_path, PathKey};
pub use pool::{Document, ExecuteOptions, InstancePool};
pub use session::{Session, SessionInfo, SessionManager};
pub use tokio_util::sync::CancellationToken;
pub use workbook::{ExcelHost, ExcelWorkbook};
