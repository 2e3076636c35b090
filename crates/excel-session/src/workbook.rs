//! [`HostHandle`] and [`DocumentContext`] over a bridge process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use excel_com_protocol::{CellValue, Command as BridgeCommand, ResponseData, SheetRef};

use crate::bridge::{BridgeProcess, ExcelBridgeConfig};
use crate::host::{DocumentContext, HostError, HostHandle};

/// One Excel instance, owned by exactly one pooled entry.
pub struct ExcelHost {
    process: Arc<BridgeProcess>,
    config: Arc<ExcelBridgeConfig>,
}

impl ExcelHost {
    pub(crate) fn new(process: Arc<BridgeProcess>, config: Arc<ExcelBridgeConfig>) -> Self {
        Self { process, config }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    fn workbook_handle(data: Option<ResponseData>) -> Result<u64, HostError> {
        match data {
            Some(ResponseData::WorkbookHandle { workbook }) => Ok(workbook),
            _ => Err(HostError::UnexpectedResponse),
        }
    }
}

impl HostHandle for ExcelHost {
    type Document = ExcelWorkbook;

    fn open_document(&mut self, path: &Path) -> Result<ExcelWorkbook, HostError> {
        let data = self.process.send(BridgeCommand::OpenWorkbook {
            path: self.config.host_path(path),
        })?;
        let handle = Self::workbook_handle(data)?;
        tracing::debug!(path = %path.display(), handle, "Opened workbook");
        Ok(ExcelWorkbook::new(Arc::clone(&self.process), handle, path))
    }

    fn create_document(&mut self, path: &Path) -> Result<ExcelWorkbook, HostError> {
        let handle = Self::workbook_handle(self.process.send(BridgeCommand::CreateWorkbook)?)?;
        let saved = self.process.send(BridgeCommand::SaveWorkbook {
            workbook: handle,
            path: Some(self.config.host_path(path)),
        });
        if let Err(e) = saved {
            if let Err(close) = self
                .process
                .send(BridgeCommand::CloseWorkbook { workbook: handle })
            {
                tracing::debug!(path = %path.display(), handle, error = %close, "Closing unsaved new workbook failed");
            }
            return Err(e);
        }
        tracing::debug!(path = %path.display(), handle, "Created workbook");
        Ok(ExcelWorkbook::new(Arc::clone(&self.process), handle, path))
    }

    fn save_document(&mut self, document: &mut ExcelWorkbook) -> Result<(), HostError> {
        self.process.send(BridgeCommand::SaveWorkbook {
            workbook: document.handle,
            path: None,
        })?;
        Ok(())
    }

    fn close_document(&mut self, document: ExcelWorkbook) -> Result<(), HostError> {
        self.process.send(BridgeCommand::CloseWorkbook {
            workbook: document.handle,
        })?;
        Ok(())
    }

    fn recalculate(&mut self) -> Result<(), HostError> {
        self.process.send(BridgeCommand::Recalculate)?;
        Ok(())
    }

    fn terminate(self) -> Result<(), HostError> {
        let pid = self.process.pid();
        let result = self.process.shutdown();
        tracing::info!(pid, "Excel bridge stopped");
        result
    }
}

/// A workbook open in an [`ExcelHost`].
pub struct ExcelWorkbook {
    process: Arc<BridgeProcess>,
    handle: u64,
    path: PathBuf,
}

impl ExcelWorkbook {
    fn new(process: Arc<BridgeProcess>, handle: u64, path: &Path) -> Self {
        Self {
            process,
            handle,
            path: path.to_path_buf(),
        }
    }

    /// The bridge's handle ID for this workbook.
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

impl DocumentContext for ExcelWorkbook {
    fn path(&self) -> &Path {
        &self.path
    }

    fn set_cell_value(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        value: CellValue,
    ) -> Result<(), HostError> {
        self.process.send(BridgeCommand::SetCellValue {
            workbook: self.handle,
            sheet: sheet.clone(),
            cell: cell.to_string(),
            value,
        })?;
        Ok(())
    }

    fn get_cell_value(&mut self, sheet: &SheetRef, cell: &str) -> Result<CellValue, HostError> {
        let data = self.process.send(BridgeCommand::GetCellValue {
            workbook: self.handle,
            sheet: sheet.clone(),
            cell: cell.to_string(),
        })?;
        match data {
            Some(ResponseData::Value { value }) => Ok(value),
            _ => Err(HostError::UnexpectedResponse),
        }
    }

    fn set_cell_formula(
        &mut self,
        sheet: &SheetRef,
        cell: &str,
        formula: &str,
    ) -> Result<(), HostError> {
        self.process.send(BridgeCommand::SetCellFormula {
            workbook: self.handle,
            sheet: sheet.clone(),
            cell: cell.to_string(),
            formula: formula.to_string(),
        })?;
        Ok(())
    }

    fn get_cell_formula(&mut self, sheet: &SheetRef, cell: &str) -> Result<String, HostError> {
        let data = self.process.send(BridgeCommand::GetCellFormula {
            workbook: self.handle,
            sheet: sheet.clone(),
            cell: cell.to_string(),
        })?;
        match data {
            Some(ResponseData::Formula { formula }) => Ok(formula),
            _ => Err(HostError::UnexpectedResponse),
        }
    }
}
