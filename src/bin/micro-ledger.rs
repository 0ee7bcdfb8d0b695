use std::fs::File;

use anyhow::{Context, Result};
use micro_ledger::{
    bin_utils::{ReplayError, Service},
    config::EngineConfig,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let customers = args
        .next()
        .context("Expected a customers file name as the first argument")?;
    let transfers = args
        .next()
        .context("Expected a transfers file name as the second argument")?;
    let config = EngineConfig::from_env()?;

    let service = Service {
        customers: File::open(&customers)
            .with_context(|| format!("Failed to open `{customers}`"))?,
        transfers: File::open(&transfers)
            .with_context(|| format!("Failed to open `{transfers}`"))?,
        output: &mut std::io::stdout(),
        config,
        error_printer: Box::new(|line, err| match err {
            ReplayError::Transfer(err) => {
                // rejected transfers are business outcomes, not broken input
                warn!(line, kind = ?err.kind(), status = err.status_code(), "{err}")
            }
            err => eprintln!("Error at line {line}: {err}"),
        }),
    };
    service.run().await
}
