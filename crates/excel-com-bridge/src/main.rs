//! Excel COM bridge: a Windows process that automates one Excel instance,
//! driven by newline-delimited JSON on stdin/stdout.
//!
//! Cross-compiled from Linux and run under WINE. Responses go to stdout;
//! diagnostics go to stderr only.

#[cfg(windows)]
mod dispatch;
#[cfg(windows)]
mod excel;

#[cfg(not(windows))]
fn main() {
    eprintln!("excel-com-bridge must be compiled for Windows (--target x86_64-pc-windows-gnu)");
    eprintln!("and run under WINE on Linux.");
    std::process::exit(1);
}

#[cfg(windows)]
fn main() {
    use std::io::{self, BufRead, Write};

    use excel_com_protocol::{Command, Request, Response, ResponseResult};

    eprintln!("[excel-com-bridge] Starting up...");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut bridge = Bridge::default();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                eprintln!("[excel-com-bridge] stdin read error: {e}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (response, shutdown) = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                let result = bridge.handle(&request.command);
                let shutdown = matches!(request.command, Command::Shutdown)
                    && matches!(result, ResponseResult::Ok { .. });
                (
                    Response {
                        id: request.id,
                        result,
                    },
                    shutdown,
                )
            }
            Err(e) => {
                eprintln!("[excel-com-bridge] JSON parse error: {e}");
                (
                    Response {
                        id: 0,
                        result: ResponseResult::error(format!("JSON parse error: {e}")),
                    },
                    false,
                )
            }
        };

        match serde_json::to_string(&response) {
            Ok(json) => {
                if writeln!(out, "{json}").and_then(|()| out.flush()).is_err() {
                    eprintln!("[excel-com-bridge] stdout closed");
                    break;
                }
            }
            Err(e) => eprintln!("[excel-com-bridge] cannot encode response: {e}"),
        }

        if shutdown {
            eprintln!("[excel-com-bridge] Shutdown complete, exiting.");
            break;
        }
    }

    // stdin closed without a Shutdown: the client is gone.
    bridge.quit();
    eprintln!("[excel-com-bridge] Process exiting.");
}

#[cfg(windows)]
#[derive(Default)]
struct Bridge {
    excel: Option<excel::ExcelApp>,
    com_initialized: bool,
}

#[cfg(windows)]
impl Bridge {
    fn handle(&mut self, command: &excel_com_protocol::Command) -> excel_com_protocol::ResponseResult {
        use excel_com_protocol::{Command, ResponseData, ResponseResult};

        let outcome = match command {
            Command::Init(options) => self.init(options).map(|()| None),
            Command::CreateWorkbook => self.with_excel(|app| {
                let workbook = app.create_workbook()?;
                Ok(Some(ResponseData::WorkbookHandle { workbook }))
            }),
            Command::OpenWorkbook { path } => self.with_excel(|app| {
                let workbook = app.open_workbook(path)?;
                Ok(Some(ResponseData::WorkbookHandle { workbook }))
            }),
            Command::SetCellValue {
                workbook,
                sheet,
                cell,
                value,
            } => self.with_excel(|app| {
                app.set_cell_value(*workbook, sheet, cell, value)
                    .map(|()| None)
            }),
            Command::SetCellFormula {
                workbook,
                sheet,
                cell,
                formula,
            } => self.with_excel(|app| {
                app.set_cell_formula(*workbook, sheet, cell, formula)
                    .map(|()| None)
            }),
            Command::GetCellValue {
                workbook,
                sheet,
                cell,
            } => self.with_excel(|app| {
                let value = app.get_cell_value(*workbook, sheet, cell)?;
                Ok(Some(ResponseData::Value { value }))
            }),
            Command::GetCellFormula {
                workbook,
                sheet,
                cell,
            } => self.with_excel(|app| {
                let formula = app.get_cell_formula(*workbook, sheet, cell)?;
                Ok(Some(ResponseData::Formula { formula }))
            }),
            Command::Recalculate => self.with_excel(|app| app.recalculate().map(|()| None)),
            Command::SaveWorkbook { workbook, path } => self.with_excel(|app| {
                app.save_workbook(*workbook, path.as_deref())
                    .map(|()| None)
            }),
            Command::CloseWorkbook { workbook } => {
                self.with_excel(|app| app.close_workbook(*workbook).map(|()| None))
            }
            Command::Shutdown => self.shutdown().map(|()| None),
        };

        match outcome {
            Ok(data) => ResponseResult::Ok { data },
            Err(e) => {
                eprintln!("[excel-com-bridge] {e}");
                ResponseResult::Error {
                    message: e.message,
                    hresult: e.hresult,
                }
            }
        }
    }

    fn init(&mut self, options: &excel_com_protocol::HostOptions) -> Result<(), dispatch::ComError> {
        use windows::Win32::System::Com::{CoInitializeEx, COINIT_APARTMENTTHREADED};

        if self.excel.is_some() {
            return Ok(());
        }
        if !self.com_initialized {
            // Excel requires a single-threaded apartment.
            unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) }
                .ok()
                .map_err(|e| dispatch::ComError {
                    hresult: Some(e.code().0 as u32),
                    message: format!("CoInitializeEx failed: {}", e.message()),
                })?;
            self.com_initialized = true;
            eprintln!("[excel-com-bridge] COM initialized (STA)");
        }

        self.excel = Some(excel::ExcelApp::launch(options)?);
        eprintln!("[excel-com-bridge] Excel.Application created");
        Ok(())
    }

    fn with_excel<T>(
        &mut self,
        f: impl FnOnce(&mut excel::ExcelApp) -> Result<T, dispatch::ComError>,
    ) -> Result<T, dispatch::ComError> {
        match self.excel.as_mut() {
            Some(app) => f(app),
            None => Err(dispatch::ComError::new(
                "Excel not initialized. Send 'Init' command first.",
            )),
        }
    }

    fn shutdown(&mut self) -> Result<(), dispatch::ComError> {
        let quit = match self.excel.take() {
            Some(app) => app.quit(),
            None => Ok(()),
        };
        self.uninit();
        quit
    }

    fn quit(&mut self) {
        if let Some(app) = self.excel.take() {
            eprintln!("[excel-com-bridge] stdin closed, shutting down Excel...");
            if let Err(e) = app.quit() {
                eprintln!("[excel-com-bridge] Quit failed: {e}");
            }
        }
        self.uninit();
    }

    fn uninit(&mut self) {
        if self.com_initialized {
            unsafe { windows::Win32::System::Com::CoUninitialize() };
            self.com_initialized = false;
            eprintln!("[excel-com-bridge] COM uninitialized");
        }
    }
}
