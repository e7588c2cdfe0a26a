use anyhow::Result;
use clap::Parser;

mod commands;
mod telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = commands::Cli::parse();
    telemetry::init()?;
    let output = commands::run(cli).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
