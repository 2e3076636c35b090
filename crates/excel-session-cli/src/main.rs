//! excelcli - drive Excel through pooled automation sessions

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use excel_session::{
    CellValue, DocumentContext, ExcelBridgeConfig, ExcelBridgeFactory, HostHandle, InstancePool,
    PoolConfig, SessionManager, SheetRef,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "excelcli")]
#[command(author, version, about = "Excel automation over a WINE-hosted COM bridge")]
struct Cli {
    #[command(flatten)]
    bridge: BridgeArgs,

    #[command(flatten)]
    pool: PoolArgs,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BridgeArgs {
    /// Path to excel-com-bridge.exe
    #[arg(long, env = "EXCEL_BRIDGE_EXE", global = true)]
    bridge_exe: Option<PathBuf>,

    /// WINE executable used to run the bridge
    #[arg(long, env = "EXCEL_BRIDGE_WINE", global = true)]
    wine: Option<PathBuf>,

    /// Run the bridge directly instead of through WINE
    #[arg(long, global = true, conflicts_with = "wine")]
    no_wine: bool,

    /// WINEPREFIX containing the Excel installation
    #[arg(long, env = "WINEPREFIX", global = true)]
    wine_prefix: Option<PathBuf>,
}

#[derive(Args)]
struct PoolArgs {
    /// Maximum number of Excel instances alive at once
    #[arg(long, default_value_t = 4, global = true)]
    max_instances: usize,

    /// Seconds to wait for a free instance slot
    #[arg(long, default_value_t = 5, global = true)]
    admission_wait: u64,

    /// Seconds allowed for each batch of work inside Excel
    #[arg(long, default_value_t = 120, global = true)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty workbook
    Create {
        /// Workbook to create (must not exist)
        path: PathBuf,
    },

    /// Read a cell's value and formula
    Get {
        path: PathBuf,
        /// Cell address, e.g. B7
        cell: String,
        #[command(flatten)]
        sheet: SheetArg,
    },

    /// Write a cell and save the workbook
    Set {
        path: PathBuf,
        /// Cell address, e.g. B7
        cell: String,
        /// Value to write: a number, true/false, or text
        value: String,
        /// Treat VALUE as a formula (e.g. "=SUM(A1:A3)")
        #[arg(short, long)]
        formula: bool,
        #[command(flatten)]
        sheet: SheetArg,
    },

    /// Run a JSON script of steps against one workbook in a single session
    ///
    /// The script is an array of steps such as
    /// {"op": "set", "cell": "A1", "value": 1}, {"op": "formula", "cell": "B1",
    /// "formula": "=A1*2"}, {"op": "recalculate"}, {"op": "get", "cell": "B1"},
    /// {"op": "save"}.
    Run {
        path: PathBuf,
        /// Script file, or - for stdin
        script: PathBuf,
        /// Create the workbook first
        #[arg(long)]
        create: bool,
    },
}

#[derive(Args)]
struct SheetArg {
    /// Worksheet name (default: the first sheet)
    #[arg(short, long)]
    sheet: Option<String>,
}

impl SheetArg {
    fn to_ref(&self) -> SheetRef {
        self.sheet
            .as_ref()
            .map(|name| SheetRef::Name(name.clone()))
            .unwrap_or_default()
    }
}

/// One step of a `run` script.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Step {
    Set {
        #[serde(default)]
        sheet: SheetRef,
        cell: String,
        value: CellValue,
    },
    Formula {
        #[serde(default)]
        sheet: SheetRef,
        cell: String,
        formula: String,
    },
    Get {
        #[serde(default)]
        sheet: SheetRef,
        cell: String,
    },
    GetFormula {
        #[serde(default)]
        sheet: SheetRef,
        cell: String,
    },
    Recalculate,
    Save,
}

#[derive(Debug, Serialize)]
struct CellReport {
    sheet: String,
    cell: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<CellValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    formula: Option<String>,
}

type Sessions = SessionManager<ExcelBridgeFactory>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let factory = ExcelBridgeFactory::new(bridge_config(&cli.bridge));
    let config = PoolConfig::default()
        .with_max_instances(cli.pool.max_instances)
        .with_admission_wait(Duration::from_secs(cli.pool.admission_wait));
    let sessions = SessionManager::new(InstancePool::new(factory, config));
    let timeout = Duration::from_secs(cli.pool.timeout);

    let result = dispatch(&sessions, cli.command, timeout, cli.json).await;
    sessions.shutdown().await;
    result
}

fn bridge_config(args: &BridgeArgs) -> ExcelBridgeConfig {
    let mut config = ExcelBridgeConfig::default();
    if let Some(exe) = &args.bridge_exe {
        config.bridge_exe_path = Some(exe.clone());
    }
    if args.no_wine {
        config.wine_path = None;
    } else if let Some(wine) = &args.wine {
        config.wine_path = Some(wine.clone());
    }
    if let Some(prefix) = &args.wine_prefix {
        config.wine_prefix = Some(prefix.clone());
    }
    config
}

async fn dispatch(
    sessions: &Sessions,
    command: Commands,
    timeout: Duration,
    json: bool,
) -> Result<()> {
    match command {
        Commands::Create { path } => create(sessions, &path, json).await,
        Commands::Get { path, cell, sheet } => {
            get(sessions, &path, cell, sheet.to_ref(), timeout, json).await
        }
        Commands::Set {
            path,
            cell,
            value,
            formula,
            sheet,
        } => set(sessions, &path, cell, value, formula, sheet.to_ref(), timeout).await,
        Commands::Run {
            path,
            script,
            create,
        } => run_script(sessions, &path, &script, create, timeout, json).await,
    }
}

async fn create(sessions: &Sessions, path: &Path, json: bool) -> Result<()> {
    let id = sessions
        .create(path)
        .await
        .with_context(|| format!("Failed to create '{}'", path.display()))?;
    let info = sessions.get(&id).map(|session| session.info());
    sessions.close(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Created {}", path.display());
    }
    Ok(())
}

async fn get(
    sessions: &Sessions,
    path: &Path,
    cell: String,
    sheet: SheetRef,
    timeout: Duration,
    json: bool,
) -> Result<()> {
    let work = sessions.pool().with_workbook(path, false, move |_, book| {
        Ok(CellReport {
            sheet: sheet.to_string(),
            cell: cell.clone(),
            value: Some(book.get_cell_value(&sheet, &cell)?),
            formula: Some(book.get_cell_formula(&sheet, &cell)?).filter(|f| !f.is_empty()),
        })
    });
    let report = tokio::time::timeout(timeout, work)
        .await
        .with_context(|| format!("Timed out after {timeout:?}"))?
        .with_context(|| format!("Failed to read '{}'", path.display()))?;

    print_reports(&[report], json)
}

async fn set(
    sessions: &Sessions,
    path: &Path,
    cell: String,
    value: String,
    formula: bool,
    sheet: SheetRef,
    timeout: Duration,
) -> Result<()> {
    let pool = sessions.pool();
    let work = pool.with_workbook(path, true, move |_, book| {
        if formula {
            book.set_cell_formula(&sheet, &cell, &value)
        } else {
            book.set_cell_value(&sheet, &cell, parse_value(&value))
        }
    });
    tokio::time::timeout(timeout, work)
        .await
        .with_context(|| format!("Timed out after {timeout:?}"))?
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    pool.close_document(path).await?;
    Ok(())
}

async fn run_script(
    sessions: &Sessions,
    path: &Path,
    script: &Path,
    create: bool,
    timeout: Duration,
    json: bool,
) -> Result<()> {
    let text = if script == Path::new("-") {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read script from stdin")?;
        text
    } else {
        std::fs::read_to_string(script)
            .with_context(|| format!("Failed to read '{}'", script.display()))?
    };
    let steps: Vec<Step> = serde_json::from_str(&text).context("Invalid script")?;
    if steps.is_empty() {
        bail!("Script has no steps");
    }

    let id = if create {
        sessions.create(path).await
    } else {
        sessions.open(path).await
    }
    .with_context(|| format!("Failed to open '{}'", path.display()))?;

    let outcome = run_steps(sessions, &id, steps, timeout).await;
    sessions.close(&id).await?;

    print_reports(&outcome?, json)
}

async fn run_steps(
    sessions: &Sessions,
    id: &str,
    steps: Vec<Step>,
    timeout: Duration,
) -> Result<Vec<CellReport>> {
    let mut reports = Vec::new();

    for (n, step) in steps.into_iter().enumerate() {
        tracing::debug!(step = n, ?step, "Running step");
        let context = || format!("Step {} failed", n + 1);

        if let Step::Save = step {
            sessions.save(id).await.with_context(context)?;
            continue;
        }

        let report = sessions
            .execute(id, Some(timeout), move |excel, book| match &step {
                Step::Set { sheet, cell, value } => {
                    book.set_cell_value(sheet, cell, value.clone()).map(|()| None)
                }
                Step::Formula {
                    sheet,
                    cell,
                    formula,
                } => book.set_cell_formula(sheet, cell, formula).map(|()| None),
                Step::Get { sheet, cell } => Ok(Some(CellReport {
                    sheet: sheet.to_string(),
                    cell: cell.clone(),
                    value: Some(book.get_cell_value(sheet, cell)?),
                    formula: None,
                })),
                Step::GetFormula { sheet, cell } => Ok(Some(CellReport {
                    sheet: sheet.to_string(),
                    cell: cell.clone(),
                    value: None,
                    formula: Some(book.get_cell_formula(sheet, cell)?),
                })),
                Step::Recalculate => excel.recalculate().map(|()| None),
                Step::Save => Ok(None),
            })
            .await
            .with_context(context)?;
        reports.extend(report);
    }
    Ok(reports)
}

fn print_reports(reports: &[CellReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    for report in reports {
        let mut line = format!("{}!{}", report.sheet, report.cell);
        if let Some(value) = &report.value {
            line.push_str(&format!(" = {value}"));
        }
        if let Some(formula) = &report.formula {
            line.push_str(&format!("  [{formula}]"));
        }
        println!("{line}");
    }
    Ok(())
}

/// Interpret command-line text as a cell value.
fn parse_value(text: &str) -> CellValue {
    match text {
        "" => CellValue::Null,
        "true" | "TRUE" => CellValue::Bool(true),
        "false" | "FALSE" => CellValue::Bool(false),
        _ => text
            .parse::<f64>()
            .map(CellValue::Number)
            .unwrap_or_else(|_| CellValue::String(text.to_string())),
    }
}
