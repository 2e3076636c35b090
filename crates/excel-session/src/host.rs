//! The automation host boundary.
//!
//! The pool only talks to Excel through these traits. [`crate::ExcelBridgeFactory`]
//! implements them on top of the WINE bridge process; tests plug in an
//! in-process fake.

use std::path::Path;

use excel_com_protocol::{CellValue, SheetRef};
use thiserror::Error;

/// COM / Win32 failure codes the pool reacts to.
pub mod hresult {
    /// The object invoked has disconnected from its clients.
    pub const RPC_E_DISCONNECTED: u32 = 0x8001_0108;
    /// The callee (server process) died.
    pub const RPC_E_SERVER_DIED: u32 = 0x8001_0007;
    /// The callee died and the call was not executed.
    pub const RPC_E_SERVER_DIED_DNE: u32 = 0x8001_0012;
    /// The RPC server is unavailable.
    pub const RPC_S_SERVER_UNAVAILABLE: u32 = 0x8007_06BA;
    /// Object is not connected to server.
    pub const CO_E_OBJNOTCONNECTED: u32 = 0x8004_01FD;
    /// Call was rejected by callee (Excel is in a modal state or editing a cell).
    pub const RPC_E_CALL_REJECTED: u32 = 0x8001_0001;
    /// The message filter asked the caller to retry later.
    pub const RPC_E_SERVERCALL_RETRYLATER: u32 = 0x8001_010A;
    /// The file is being used by another process.
    pub const ERROR_SHARING_VIOLATION: u32 = 0x8007_0020;
    /// Another process has locked a portion of the file.
    pub const ERROR_LOCK_VIOLATION: u32 = 0x8007_0021;
}

/// Errors reported by an automation host or its transport.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to spawn Excel bridge process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("WINE not found. Install WINE and ensure 'wine' is in PATH.")]
    WineNotFound,

    #[error("Bridge executable not found at: {0}")]
    BridgeExeNotFound(String),

    #[error("Bridge process not running")]
    NotRunning,

    #[error("Failed to send command to bridge: {0}")]
    SendFailed(String),

    #[error("Failed to read response from bridge: {0}")]
    ReadFailed(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Excel COM error 0x{hresult:08X}: {message}")]
    Com { hresult: u32, message: String },

    #[error("Bridge returned error: {0}")]
    Bridge(String),

    #[error("Unexpected response data")]
    UnexpectedResponse,

    /// Failure raised by caller-supplied work rather than by the host.
    #[error("{0}")]
    Failed(String),
}

impl HostError {
    pub fn failed(message: impl Into<String>) -> Self {
        HostError::Failed(message.into())
    }

    /// Decide how the pool treats this failure.
    pub fn classify(&self) -> FailureClass {
        match self {
            HostError::NotRunning | HostError::SendFailed(_) | HostError::ReadFailed(_) => {
                FailureClass::HandleInvalidated
            }
            HostError::Com { hresult, message } => classify_com(*hresult, message),
            _ => FailureClass::Fatal,
        }
    }
}

fn classify_com(code: u32, message: &str) -> FailureClass {
    use hresult::*;

    match code {
        RPC_E_DISCONNECTED
        | RPC_E_SERVER_DIED
        | RPC_E_SERVER_DIED_DNE
        | RPC_S_SERVER_UNAVAILABLE
        | CO_E_OBJNOTCONNECTED => FailureClass::HandleInvalidated,
        RPC_E_CALL_REJECTED | RPC_E_SERVERCALL_RETRYLATER => FailureClass::HostBusy,
        ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION => FailureClass::FileLocked,
        _ => {
            // Excel reports "locked for editing" through its generic 0x800A03EC.
            let message = message.to_ascii_lowercase();
            if message.contains("locked") || message.contains("being used by another") {
                FailureClass::FileLocked
            } else {
                FailureClass::Fatal
            }
        }
    }
}

/// How a [`HostError`] is handled at the pool boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The host process died or the reference went stale. Recovered by
    /// relaunching the host and retrying once.
    HandleInvalidated,
    /// The host is alive but refused the call for now.
    HostBusy,
    /// The target file is held by another process.
    FileLocked,
    /// Not recoverable by the pool.
    Fatal,
}

/// Starts automation hosts. One factory serves a whole pool.
pub trait HostFactory: Send + Sync + 'static {
    type Host: HostHandle;

    /// Start a new host configured for unattended use: hidden, no alerts,
    /// non-interactive.
    fn launch(&self) -> Result<Self::Host, HostError>;
}

/// A live automation host process.
///
/// All methods block on the host; the pool calls them from blocking worker
/// threads and never concurrently on the same handle.
pub trait HostHandle: Send + 'static {
    type Document: DocumentContext;

    fn open_document(&mut self, path: &Path) -> Result<Self::Document, HostError>;

    /// Create an empty workbook and save it as `path`.
    fn create_document(&mut self, path: &Path) -> Result<Self::Document, HostError>;

    /// Persist the document to its own path.
    fn save_document(&mut self, document: &mut Self::Document) -> Result<(), HostError>;

    /// Close without saving, releasing the file lock.
    fn close_document(&mut self, document: Self::Document) -> Result<(), HostError>;

    fn recalculate(&mut self) -> Result<(), HostError>;

    /// Quit the host and wait for the process to exit.
    fn terminate(self) -> Result<(), HostError>
    where
        Self: Sized;
}

/// A workbook open inside a [`HostHandle`].
pub trait DocumentContext: Send + 'static {
    fn path(&self) -> &Path;

    fn set_cell_value(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        value: CellValue,
    ) -> Result<(), HostError>;

    fn get_cell_value(&mut self, sheet: &SheetRef, cell: &str) -> Result<CellValue, HostError>;

    fn set_cell_formula(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        formula: &str,
    ) -> Result<(), HostError>;

    /// Empty string when the cell holds no formula.
    fn get_cell_formula(&mut self, sheet: &SheetRef, cell: &str) -> Result<String, HostError>;
}
