//! Migration runner for relay-api.
//!
//! Usage:
//!   cargo run -p relay-api --bin relay-migrate             # apply pending
//!   cargo run -p relay-api --bin relay-migrate -- pending  # list without applying
//!   cargo run -p relay-api --bin relay-migrate -- revert   # roll back the newest
//!
//! Reads DATABASE_URL from the environment (or .env via dotenvy).

use std::path::Path;
use std::process::ExitCode;

use diesel::migration::Migration;
use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let command = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    match run(&command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("relay-migrate {command}: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: &str) -> Result<(), BoxError> {
    let database_url = std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL is not set")?;
    let mut conn = PgConnection::establish(&database_url)?;

    match command {
        "run" => {
            let applied = conn.run_pending_migrations(MIGRATIONS)?;
            if applied.is_empty() {
                println!("No pending migrations.");
            }
            for version in &applied {
                println!("  Applied: {version}");
            }
        }
        "pending" => {
            let pending = conn.pending_migrations(MIGRATIONS)?;
            if pending.is_empty() {
                println!("Schema is up to date.");
            }
            for migration in &pending {
                println!("  Pending: {}", migration.name());
            }
        }
        "revert" => {
            let version = conn.revert_last_migration(MIGRATIONS)?;
            println!("  Reverted: {version}");
        }
        other => return Err(format!("unknown command `{other}` (expected run, pending or revert)").into()),
    }
    Ok(())
}
