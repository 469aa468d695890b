//! KLB upload command-line entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the result.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = app::Args::parse(std::env::args().skip(1))?;
    let config = config::load()?;
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        api_base = %config.api_base,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(app::run(config, args))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
