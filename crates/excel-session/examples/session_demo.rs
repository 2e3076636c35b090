//! Example: a multi-step session against a real Excel instance.
//!
//! Creates a workbook, fills it in one session, saves and closes it, then
//! reopens the same file and reads the recalculated totals back. The second
//! open reuses the warm Excel process from the pool.
//!
//! Prerequisites:
//!   - WINE installed and in PATH
//!   - Microsoft Excel installed in the WINE prefix
//!   - excel-com-bridge.exe built:
//!     cargo build --target x86_64-pc-windows-gnu -p excel-com-bridge --release
//!
//! Run:
//!   cargo run --example session_demo -p excel-session

use std::time::{Duration, Instant};

use excel_session::{
    DocumentContext, ExcelBridgeConfig, ExcelBridgeFactory, HostHandle, InstancePool, PoolConfig,
    SessionManager, SheetRef,
};

const OUTPUT: &str = "/tmp/session_demo.xlsx";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = std::fs::remove_file(OUTPUT);

    let factory = ExcelBridgeFactory::new(ExcelBridgeConfig::default());
    let sessions = SessionManager::new(InstancePool::new(factory, PoolConfig::default()));

    println!("Creating {OUTPUT}...");
    let started = Instant::now();
    let id = sessions.create(OUTPUT).await?;
    println!("  session {id} ready in {:?}", started.elapsed());

    sessions
        .execute(&id, Some(Duration::from_secs(60)), |_, book| {
            let sheet = SheetRef::default();
            let rows = [
                ("Widget", [1500.0, 2300.0, 1800.0, 3100.0]),
                ("Gadget", [800.0, 950.0, 1100.0, 1400.0]),
                ("Doohickey", [3200.0, 2800.0, 3500.0, 4100.0]),
            ];
            for (col, header) in ["A1", "B1", "C1", "D1", "E1", "F1"]
                .iter()
                .zip(["Product", "Q1", "Q2", "Q3", "Q4", "Total"])
            {
                book.set_cell_value(&sheet, col, header.into())?;
            }
            for (i, (name, quarters)) in rows.iter().enumerate() {
                let row = i + 2;
                book.set_cell_value(&sheet, &format!("A{row}"), (*name).into())?;
                for (col, amount) in ["B", "C", "D", "E"].iter().zip(quarters) {
                    book.set_cell_value(&sheet, &format!("{col}{row}"), (*amount).into())?;
                }
                book.set_cell_formula(&sheet, &format!("F{row}"), &format!("=SUM(B{row}:E{row})"))?;
            }
            book.set_cell_formula(&sheet, "F6", "=SUM(F2:F4)")
        })
        .await?;

    sessions.save(&id).await?;
    sessions.close(&id).await?;
    println!("Saved and closed. Live instances: {}", sessions.pool().live_instances());

    println!("\nReopening...");
    let started = Instant::now();
    let id = sessions.open(OUTPUT).await?;
    println!("  session {id} ready in {:?} (warm instance)", started.elapsed());

    let totals = sessions
        .execute(&id, Some(Duration::from_secs(60)), |excel, book| {
            excel.recalculate()?;
            let sheet = SheetRef::default();
            ["F2", "F3", "F4", "F6"]
                .iter()
                .map(|cell| book.get_cell_value(&sheet, cell).map(|value| (*cell, value)))
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;

    println!("\n--- Results from Excel ---\n");
    for (cell, value) in &totals {
        println!("  {cell}: {value:>12}");
    }

    sessions.shutdown().await;
    println!("\nDone!");
    Ok(())
}
