//! Wire types exchanged between the pooled session client and the Excel COM
//! bridge process.
//!
//! The protocol is JSON-over-stdio: one JSON object per line in each direction.
//! Failures carry the COM `HRESULT` when there is one, so the client can tell a
//! dead host apart from a busy one or a locked file.

use serde::{Deserialize, Serialize};

/// A command sent from the client to the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Monotonically increasing request ID for correlating responses.
    pub id: u64,
    #[serde(flatten)]
    pub command: Command,
}

/// Commands the client can send to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum Command {
    /// Initialize COM, create the `Excel.Application` instance and apply the
    /// unattended-automation settings.
    Init(HostOptions),

    /// Create a new empty workbook. Returns a workbook handle.
    CreateWorkbook,

    /// Open an existing workbook (Windows path). Returns a workbook handle.
    OpenWorkbook { path: String },

    SetCellValue {
        workbook: u64,
        sheet: SheetRef,
        cell: String,
        value: CellValue,
    },

    SetCellFormula {
        workbook: u64,
        sheet: SheetRef,
        cell: String,
        formula: String,
    },

    GetCellValue {
        workbook: u64,
        sheet: SheetRef,
        cell: String,
    },

    /// Empty string when the cell holds no formula.
    GetCellFormula {
        workbook: u64,
        sheet: SheetRef,
        cell: String,
    },

    Recalculate,

    /// Save the workbook. With `path` the workbook is saved as that file
    /// (format inferred from the extension); without it, saved in place.
    SaveWorkbook {
        workbook: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// Close a workbook without saving.
    CloseWorkbook { workbook: u64 },

    /// Close all workbooks, quit Excel, uninitialize COM and exit.
    Shutdown,
}

/// Application settings applied right after `Excel.Application` is created.
///
/// The defaults describe a headless automation host: no window, no modal
/// alerts, no screen repaint and no user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOptions {
    pub visible: bool,
    pub display_alerts: bool,
    pub screen_updating: bool,
    pub interactive: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            visible: false,
            display_alerts: false,
            screen_updating: false,
            interactive: false,
        }
    }
}

/// Reference to a worksheet, by 0-based index or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SheetRef {
    Index(u32),
    Name(String),
}

impl Default for SheetRef {
    fn default() -> Self {
        SheetRef::Index(0)
    }
}

impl std::fmt::Display for SheetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SheetRef::Index(i) => write!(f, "#{i}"),
            SheetRef::Name(name) => write!(f, "{name}"),
        }
    }
}

/// A cell value that can be sent to/from Excel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Error(CellError),
}

/// Excel error values (`#DIV/0!`, `#N/A`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellError {
    pub code: String,
}

/// A response sent from the bridge back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The request ID this response corresponds to (0 if the request could not be parsed).
    pub id: u64,
    #[serde(flatten)]
    pub result: ResponseResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ResponseResult {
    #[serde(rename = "ok")]
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        /// The failing COM call's HRESULT, when the failure came from COM.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hresult: Option<u32>,
    },
}

impl ResponseResult {
    pub fn ok() -> Self {
        ResponseResult::Ok { data: None }
    }

    pub fn with_data(data: ResponseData) -> Self {
        ResponseResult::Ok { data: Some(data) }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ResponseResult::Error {
            message: message.into(),
            hresult: None,
        }
    }
}

/// Data returned in successful responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    WorkbookHandle { workbook: u64 },
    Value { value: CellValue },
    Formula { formula: String },
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::String(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::String(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Null => write!(f, "<empty>"),
            CellValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::String(s) => write!(f, "{s}"),
            CellValue::Error(e) => write!(f, "{}", e.code),
        }
    }
}
