//! Archive status: aggregate counts plus the most recent failures.

use anyhow::Result;
use clap::Parser;
use paperflow::db::{migrate, Db};
use paperflow::{store, Config};
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "status")]
#[command(about = "Show archive processing status")]
struct Args {
    /// How many recent failures to list
    #[arg(short, long, default_value = "10")]
    failures: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "warn")
    ).init();

    let args = Args::parse();

    let config = Config::load()?;
    let db = Db::new(config.db_path());
    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    let counts = store::status_counts(&db).await?;
    println!("Papers:      {}", counts.total);
    println!("  processed:   {}", counts.processed);
    println!("  pending:     {}", counts.pending);
    println!("  in progress: {}", counts.in_progress);
    println!("  failed:      {}", counts.failed);

    if counts.failed > 0 {
        let failures = store::recent_failures(&db, args.failures).await?;
        println!("\nRecent failures:");
        for row in failures {
            println!(
                "  {}  attempts={}  {}\n      {}",
                row.id,
                row.attempt_count,
                row.source_path,
                row.last_error.as_deref().unwrap_or("(no error recorded)")
            );
        }
    }

    Ok(())
}
