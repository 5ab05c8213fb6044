//! Query CLI
//!
//! Evaluates one query against a store and prints the matching entities as
//! pretty-printed JSON on stdout, with timing on stderr:
//!
//! ```text
//! arkiv-query 'type = "document" && version >= 2' --db-path arkiv-data.db
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use arkiv_bitmap_store::{IncludeData, Options, SqliteStore, StoreConfig};

#[derive(Parser)]
#[command(name = "arkiv-query", about = "Query the bitmap-indexed entity store")]
struct Cli {
    /// The query string, e.g. 'type = "document" && version >= 2'.
    query: String,

    /// Path to the database file.
    #[arg(long, env = "DB_PATH", default_value = "arkiv-data.db")]
    db_path: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> arkiv_bitmap_store::Result<()> {
    let store = SqliteStore::open(&cli.db_path, StoreConfig::default())?;

    let options = Options {
        include_data: Some(IncludeData {
            key: true,
            content_type: true,
            payload: true,
            attributes: true,
            ..IncludeData::default()
        }),
        ..Options::default()
    };

    let started = Instant::now();
    let token = CancellationToken::new();
    let response = store
        .query_entities(&cli.query, Some(options), &token)
        .await?;
    let elapsed = started.elapsed();

    println!(
        "{}",
        serde_json::to_string_pretty(&response)
            .map_err(|e| arkiv_bitmap_store::Error::Codec(e.to_string()))?
    );
    eprintln!("Query time: {elapsed:?}");

    store.close();
    Ok(())
}
