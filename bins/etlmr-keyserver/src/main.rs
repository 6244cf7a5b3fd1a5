//! Standalone surrogate-key server binary, launched by `etlmr-cli` as a
//! subprocess for ODAT's dimension-load step (`--load-method 2
//! --load-step 1`), mirroring `paralleletl`'s `seq_server` being
//! spawned and terminated around the dimension load.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "etlmr-keyserver", about = "Central surrogate-key server for ODAT loads")]
struct Args {
    /// Postgres connection string used to seed each dimension's
    /// starting counter from `SELECT MAX(key) FROM name`.
    #[arg(long)]
    conninfo: String,

    /// `name:key` pairs for every dimension the server should seed,
    /// e.g. `pagedim:pageid`. Snowflake children are listed alongside
    /// their parent.
    #[arg(long = "dimension", value_parser = parse_dim)]
    dimensions: Vec<(String, String)>,

    #[arg(long, default_value_t = etlmr_cluster::keyserver::DEFAULT_PORT)]
    port: u16,
}

fn parse_dim(s: &str) -> Result<(String, String), String> {
    let (name, key) = s.split_once(':').ok_or_else(|| format!("expected name:key, got {s}"))?;
    Ok((name.to_string(), key.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let (client, connection) = tokio_postgres::connect(&args.conninfo, tokio_postgres::NoTls)
        .await
        .context("connecting to warehouse to seed key counters")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "warehouse connection for key seeding terminated");
        }
    });

    let seeds = etlmr_cluster::keys::seed_from_warehouse(&client, &args.dimensions).await?;
    tracing::info!(seeded = seeds.len(), "key counters seeded");

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let addr: SocketAddr = ([0, 0, 0, 0], args.port).into();

    tokio::select! {
        result = etlmr_cluster::keyserver::run(addr, seeds, server_cancel) => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            Ok(())
        }
    }
}
