//! Excel object model on top of [`DispatchObject`].

#![cfg(windows)]

use std::collections::HashMap;

use excel_com_protocol::{CellError, CellValue, HostOptions, SheetRef};

use crate::dispatch::{Arg, ComError, DispatchObject, Returned};

// XlFileFormat
const XL_OPEN_XML_WORKBOOK: i32 = 51;
const XL_OPEN_XML_WORKBOOK_MACRO_ENABLED: i32 = 52;
const XL_WORKBOOK_NORMAL: i32 = -4143;
const XL_CSV: i32 = 6;

/// One Excel.Application and the workbooks opened through it.
pub struct ExcelApp {
    app: DispatchObject,
    books: DispatchObject,
    open: HashMap<u64, DispatchObject>,
    next_handle: u64,
}

impl ExcelApp {
    pub fn launch(options: &HostOptions) -> Result<Self, ComError> {
        let app = DispatchObject::create("Excel.Application")?;

        app.put("Visible", Arg::Bool(options.visible))?;
        app.put("DisplayAlerts", Arg::Bool(options.display_alerts))?;
        app.put("ScreenUpdating", Arg::Bool(options.screen_updating))?;
        app.put("Interactive", Arg::Bool(options.interactive))?;

        let books = app.get_object("Workbooks")?;
        Ok(Self {
            app,
            books,
            open: HashMap::new(),
            next_handle: 1,
        })
    }

    fn register(&mut self, book: DispatchObject) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open.insert(handle, book);
        handle
    }

    fn book(&self, handle: u64) -> Result<&DispatchObject, ComError> {
        self.open
            .get(&handle)
            .ok_or_else(|| ComError::new(format!("Unknown workbook handle: {handle}")))
    }

    pub fn create_workbook(&mut self) -> Result<u64, ComError> {
        let book = self.books.invoke("Add", &[])?.into_object("Add")?;
        Ok(self.register(book))
    }

    pub fn open_workbook(&mut self, path: &str) -> Result<u64, ComError> {
        let book = self
            .books
            .invoke("Open", &[Arg::Str(path)])?
            .into_object("Open")?;
        Ok(self.register(book))
    }

    fn range(&self, handle: u64, sheet: &SheetRef, cell: &str) -> Result<DispatchObject, ComError> {
        let sheets = self.book(handle)?.get_object("Worksheets")?;
        let sheet = match sheet {
            // Excel counts sheets from 1.
            SheetRef::Index(i) => sheets.get_item("Item", Arg::I32(*i as i32 + 1))?,
            SheetRef::Name(name) => sheets.get_item("Item", Arg::Str(name))?,
        };
        sheet.get_item("Range", Arg::Str(cell))
    }

    pub fn set_cell_value(
        &self,
        handle: u64,
        sheet: &SheetRef,
        cell: &str,
        value: &CellValue,
    ) -> Result<(), ComError> {
        let arg = match value {
            CellValue::Null => Arg::Empty,
            CellValue::Bool(b) => Arg::Bool(*b),
            CellValue::Number(n) => Arg::F64(*n),
            CellValue::String(s) => Arg::Str(s),
            CellValue::Error(e) => {
                return Err(ComError::new(format!("Cannot write error value {}", e.code)))
            }
        };
        self.range(handle, sheet, cell)?.put("Value", arg)
    }

    pub fn set_cell_formula(
        &self,
        handle: u64,
        sheet: &SheetRef,
        cell: &str,
        formula: &str,
    ) -> Result<(), ComError> {
        self.range(handle, sheet, cell)?
            .put("Formula", Arg::Str(formula))
    }

    pub fn get_cell_value(
        &self,
        handle: u64,
        sheet: &SheetRef,
        cell: &str,
    ) -> Result<CellValue, ComError> {
        let value = self.range(handle, sheet, cell)?.get("Value")?;
        Ok(match value {
            Returned::Bool(b) => CellValue::Bool(b),
            Returned::Number(n) => CellValue::Number(n),
            Returned::Str(s) => CellValue::String(s),
            Returned::Error(scode) => CellValue::Error(CellError {
                code: cell_error_code(scode).to_string(),
            }),
            Returned::Empty | Returned::Object(_) | Returned::Other(_) => CellValue::Null,
        })
    }

    pub fn get_cell_formula(
        &self,
        handle: u64,
        sheet: &SheetRef,
        cell: &str,
    ) -> Result<String, ComError> {
        match self.range(handle, sheet, cell)?.get("Formula")? {
            Returned::Str(s) => Ok(s),
            _ => Ok(String::new()),
        }
    }

    pub fn recalculate(&self) -> Result<(), ComError> {
        self.app.invoke("Calculate", &[]).map(|_| ())
    }

    /// `Save` in place, or `SaveAs` when a path is given.
    pub fn save_workbook(&self, handle: u64, path: Option<&str>) -> Result<(), ComError> {
        let book = self.book(handle)?;
        match path {
            None => book.invoke("Save", &[])?,
            Some(path) => book.invoke("SaveAs", &[Arg::Str(path), Arg::I32(file_format(path))])?,
        };
        Ok(())
    }

    pub fn close_workbook(&mut self, handle: u64) -> Result<(), ComError> {
        let book = self
            .open
            .remove(&handle)
            .ok_or_else(|| ComError::new(format!("Unknown workbook handle: {handle}")))?;
        book.invoke("Close", &[Arg::Bool(false)]).map(|_| ())
    }

    /// Close every workbook without saving and quit Excel.
    pub fn quit(mut self) -> Result<(), ComError> {
        let handles: Vec<u64> = self.open.keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.close_workbook(handle) {
                eprintln!("[excel-com-bridge] closing workbook {handle} failed: {e}");
            }
        }
        self.app.invoke("Quit", &[]).map(|_| ())
    }
}

fn file_format(path: &str) -> i32 {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".xlsm") {
        XL_OPEN_XML_WORKBOOK_MACRO_ENABLED
    } else if lower.ends_with(".xls") {
        XL_WORKBOOK_NORMAL
    } else if lower.ends_with(".csv") {
        XL_CSV
    } else {
        XL_OPEN_XML_WORKBOOK
    }
}

/// Excel reports cell errors as `VT_ERROR` with codes in the 2000 range.
fn cell_error_code(scode: i32) -> &'static str {
    match scode & 0xFFFF {
        2000 => "#NULL!",
        2007 => "#DIV/0!",
        2015 => "#VALUE!",
        2023 => "#REF!",
        2029 => "#NAME?",
        2036 => "#NUM!",
        2042 => "#N/A",
        _ => "#ERROR",
    }
}
