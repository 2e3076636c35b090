//! Subprocess management and JSON IPC for the Excel COM bridge process.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use excel_com_protocol::{
    Command as BridgeCommand, HostOptions, Request, Response, ResponseData, ResponseResult,
};
use parking_lot::Mutex;

use crate::host::{HostError, HostFactory};
use crate::workbook::ExcelHost;

/// Configuration for launching Excel COM bridge processes.
#[derive(Debug, Clone)]
pub struct ExcelBridgeConfig {
    /// Path to the `excel-com-bridge.exe` Windows executable.
    /// If None, will search in common locations relative to the current binary.
    pub bridge_exe_path: Option<PathBuf>,

    /// WINE executable used to run the bridge. `None` runs the bridge directly,
    /// which is what you want on Windows.
    pub wine_path: Option<PathBuf>,

    /// Optional WINEPREFIX to use (for isolating the WINE environment).
    pub wine_prefix: Option<PathBuf>,

    /// Application settings sent with `Init`.
    pub host_options: HostOptions,
}

impl Default for ExcelBridgeConfig {
    fn default() -> Self {
        Self {
            bridge_exe_path: None,
            wine_path: (!cfg!(windows)).then(|| PathBuf::from("wine")),
            wine_prefix: None,
            host_options: HostOptions::default(),
        }
    }
}

impl ExcelBridgeConfig {
    /// Translate a local path into the path Excel sees.
    pub fn host_path(&self, path: &Path) -> String {
        if self.wine_path.is_some() {
            linux_to_wine_path(path)
        } else {
            path.display().to_string()
        }
    }
}

/// Launches one bridge process (and therefore one Excel instance) per call.
#[derive(Debug, Clone, Default)]
pub struct ExcelBridgeFactory {
    config: Arc<ExcelBridgeConfig>,
}

impl ExcelBridgeFactory {
    pub fn new(config: ExcelBridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ExcelBridgeConfig {
        &self.config
    }
}

impl HostFactory for ExcelBridgeFactory {
    type Host = ExcelHost;

    fn launch(&self) -> Result<ExcelHost, HostError> {
        let process = BridgeProcess::start(&self.config)?;
        Ok(ExcelHost::new(Arc::new(process), Arc::clone(&self.config)))
    }
}

struct Channel {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A running bridge process.
///
/// Requests are strictly request/response, so a single lock covers both pipes.
/// The child is killed if the process handle is dropped without a clean
/// [`BridgeProcess::shutdown`].
pub struct BridgeProcess {
    child: Mutex<Child>,
    channel: Mutex<Channel>,
    next_id: AtomicU64,
}

impl BridgeProcess {
    /// Spawn the bridge and initialize Excel.
    pub fn start(config: &ExcelBridgeConfig) -> Result<Self, HostError> {
        let exe_path = config
            .bridge_exe_path
            .clone()
            .unwrap_or_else(find_bridge_exe);

        if !exe_path.exists() {
            return Err(HostError::BridgeExeNotFound(exe_path.display().to_string()));
        }

        let mut cmd = match &config.wine_path {
            Some(wine) => {
                let mut cmd = std::process::Command::new(wine);
                cmd.arg(&exe_path);
                cmd
            }
            None => std::process::Command::new(&exe_path),
        };

        if let Some(prefix) = &config.wine_prefix {
            cmd.env("WINEPREFIX", prefix);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Bridge diagnostics go to our stderr

        tracing::debug!("Starting Excel bridge: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound && config.wine_path.is_some() {
                HostError::WineNotFound
            } else {
                HostError::SpawnFailed(e)
            }
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(HostError::NotRunning);
        };

        let process = Self {
            child: Mutex::new(child),
            channel: Mutex::new(Channel {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(1),
        };

        process.send(BridgeCommand::Init(config.host_options))?;
        tracing::info!(pid = process.pid(), "Excel bridge started");

        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.child.lock().id()
    }

    /// Send a command to the bridge and wait for the response.
    pub fn send(&self, command: BridgeCommand) -> Result<Option<ResponseData>, HostError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&Request { id, command })?;

        let mut channel = self.channel.lock();
        writeln!(channel.stdin, "{json}").map_err(|e| HostError::SendFailed(e.to_string()))?;
        channel
            .stdin
            .flush()
            .map_err(|e| HostError::SendFailed(e.to_string()))?;

        let mut line = String::new();
        channel
            .stdout
            .read_line(&mut line)
            .map_err(|e| HostError::ReadFailed(e.to_string()))?;
        drop(channel);

        if line.is_empty() {
            return Err(HostError::NotRunning);
        }

        let response: Response = serde_json::from_str(&line)?;
        if response.id != id {
            tracing::warn!(expected = id, got = response.id, "Bridge response out of order");
            return Err(HostError::UnexpectedResponse);
        }

        match response.result {
            ResponseResult::Ok { data } => Ok(data),
            ResponseResult::Error {
                message,
                hresult: Some(hresult),
            } => Err(HostError::Com { hresult, message }),
            ResponseResult::Error {
                message,
                hresult: None,
            } => Err(HostError::Bridge(message)),
        }
    }

    /// Quit Excel and wait for the bridge to exit.
    pub fn shutdown(&self) -> Result<(), HostError> {
        let result = self.send(BridgeCommand::Shutdown).map(|_| ());

        let mut child = self.child.lock();
        if result.is_err() {
            let _ = child.kill();
        }
        let _ = child.wait();

        result
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        let child = self.child.get_mut();
        if let Ok(None) = child.try_wait() {
            tracing::debug!(pid = child.id(), "Killing Excel bridge left running");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Convert a Linux filesystem path to a WINE (Windows) path.
///
/// WINE maps `/` to `Z:\`, so `/home/user/file.xlsx` becomes `Z:\home\user\file.xlsx`.
pub fn linux_to_wine_path(linux_path: &Path) -> String {
    let abs = if linux_path.is_absolute() {
        linux_path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(linux_path)
    };

    format!("Z:{}", abs.display()).replace('/', "\\")
}

/// Attempt to locate the bridge exe relative to the current executable or in common paths.
fn find_bridge_exe() -> PathBuf {
    if let Ok(mut exe) = std::env::current_exe() {
        exe.pop();
        let candidate = exe.join("excel-com-bridge.exe");
        if candidate.exists() {
            return candidate;
        }
    }

    ["release", "debug"]
        .iter()
        .map(|profile| {
            PathBuf::from(format!(
                "target/x86_64-pc-windows-gnu/{profile}/excel-com-bridge.exe"
            ))
        })
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("excel-com-bridge.exe"))
}
