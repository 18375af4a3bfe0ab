use minicoin::cli::commands::run_cli;
use minicoin::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load().unwrap_or_default();

    // Run CLI (logging is initialized there based on the debug flag)
    run_cli(config).await?;

    Ok(())
}
