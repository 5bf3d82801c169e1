//! Operator CLI: reset stuck work after a crashed process.
//!
//! Flips non-terminal runs, reviews, cycle states, and jobs to a terminal
//! status with reason "reset by admin".
//!
//! ```text
//! reset-stuck --dry-run            # show what would be reset
//! reset-stuck --details            # list the stuck records
//! reset-stuck --breakdown          # group counts by task
//! reset-stuck --table runs -y      # reset one table, no confirmation
//! reset-stuck --db /path/to/gyre.db -y
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::io::Write;

use gyre::constants::RESET_BY_ADMIN;
use gyre::storage::Database;

const TABLES: [&str; 4] = ["runs", "reviews", "cycle_states", "jobs"];

#[derive(Parser, Debug)]
#[command(
    name = "reset-stuck",
    about = "Reset stuck (non-terminal) orchestrator records to a terminal status"
)]
struct Args {
    /// Path to the SQLite database file
    #[arg(long, default_value = "gyre.db")]
    db: String,

    /// Show what would be reset without making changes
    #[arg(long)]
    dry_run: bool,

    /// List the individual stuck records
    #[arg(long)]
    details: bool,

    /// Group stuck counts by task
    #[arg(long)]
    breakdown: bool,

    /// Only reset this table (runs, reviews, cycle_states, jobs)
    #[arg(long)]
    table: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,
}

/// Predicate selecting stuck rows for a table.
fn pending_filter(table: &str) -> &'static str {
    match table {
        "cycle_states" => "phase NOT IN ('completed', 'failed')",
        _ => "status IN ('queued', 'running')",
    }
}

async fn count_pending(pool: &SqlitePool, table: &str) -> Result<i64> {
    let row = sqlx::query(&format!(
        "SELECT COUNT(*) AS n FROM {table} WHERE {}",
        pending_filter(table)
    ))
    .fetch_one(pool)
    .await?;
    Ok(row.get("n"))
}

async fn show_details(pool: &SqlitePool, table: &str) -> Result<()> {
    let (id_col, status_col) = match table {
        "cycle_states" => ("task_id", "phase"),
        _ => ("id", "status"),
    };
    let rows = sqlx::query(&format!(
        "SELECT {id_col} AS id, {status_col} AS status FROM {table} WHERE {}",
        pending_filter(table)
    ))
    .fetch_all(pool)
    .await?;
    for row in rows {
        println!(
            "    {} ({})",
            row.get::<String, _>("id"),
            row.get::<String, _>("status")
        );
    }
    Ok(())
}

async fn show_breakdown(pool: &SqlitePool, table: &str) -> Result<()> {
    let task_col = match table {
        "cycle_states" => "task_id",
        "jobs" => {
            // Jobs reference runs/reviews, not tasks; group by kind instead.
            let rows = sqlx::query(&format!(
                "SELECT kind AS grp, COUNT(*) AS n FROM jobs WHERE {} GROUP BY kind",
                pending_filter("jobs")
            ))
            .fetch_all(pool)
            .await?;
            for row in rows {
                println!(
                    "    {}: {}",
                    row.get::<String, _>("grp"),
                    row.get::<i64, _>("n")
                );
            }
            return Ok(());
        }
        _ => "task_id",
    };
    let rows = sqlx::query(&format!(
        "SELECT {task_col} AS grp, COUNT(*) AS n FROM {table} WHERE {} GROUP BY {task_col}",
        pending_filter(table)
    ))
    .fetch_all(pool)
    .await?;
    for row in rows {
        println!(
            "    task {}: {}",
            row.get::<String, _>("grp"),
            row.get::<i64, _>("n")
        );
    }
    Ok(())
}

async fn reset_table(pool: &SqlitePool, table: &str) -> Result<u64> {
    let now = chrono::Utc::now();
    let affected = match table {
        "runs" | "reviews" => {
            sqlx::query(&format!(
                "UPDATE {table} SET status = 'failed', error = ?, completed_at = ? WHERE {}",
                pending_filter(table)
            ))
            .bind(RESET_BY_ADMIN)
            .bind(now)
            .execute(pool)
            .await?
            .rows_affected()
        }
        "cycle_states" => {
            sqlx::query(&format!(
                "UPDATE cycle_states SET phase = 'failed', error = ?, last_activity_at = ? WHERE {}",
                pending_filter("cycle_states")
            ))
            .bind(RESET_BY_ADMIN)
            .bind(now)
            .execute(pool)
            .await?
            .rows_affected()
        }
        "jobs" => {
            sqlx::query(&format!(
                "UPDATE jobs SET status = 'failed', locked_at = NULL, locked_by = NULL,
                                 last_error = ?, updated_at = ? WHERE {}",
                pending_filter("jobs")
            ))
            .bind(RESET_BY_ADMIN)
            .bind(now.timestamp_millis())
            .execute(pool)
            .await?
            .rows_affected()
        }
        other => bail!("unknown table: {other}"),
    };
    Ok(affected)
}

fn confirm() -> Result<bool> {
    print!("Reset the records listed above? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let tables: Vec<&str> = match &args.table {
        Some(name) => {
            let name = name.as_str();
            if !TABLES.contains(&name) {
                bail!("unknown table '{name}', expected one of: {}", TABLES.join(", "));
            }
            vec![name]
        }
        None => TABLES.to_vec(),
    };

    let db = Database::connect(&args.db).await?;
    let pool = db.pool();

    let mut pending: BTreeMap<&str, i64> = BTreeMap::new();
    for table in &tables {
        pending.insert(table, count_pending(pool, table).await?);
    }
    let total: i64 = pending.values().sum();

    if total == 0 {
        println!("Nothing to reset.");
        return Ok(());
    }

    println!(
        "{}",
        if args.dry_run {
            "[DRY RUN] Would reset:"
        } else {
            "Stuck records:"
        }
    );
    for (table, count) in &pending {
        if *count == 0 {
            continue;
        }
        println!("  - {table}: {count} item(s)");
        if args.details {
            show_details(pool, table).await?;
        }
        if args.breakdown {
            show_breakdown(pool, table).await?;
        }
    }

    if args.dry_run {
        return Ok(());
    }
    if !args.yes && !confirm()? {
        println!("Aborted.");
        return Ok(());
    }

    for table in &tables {
        let affected = reset_table(pool, table).await?;
        if affected > 0 {
            println!("  - {table}: {affected} item(s) reset");
        }
    }
    Ok(())
}
