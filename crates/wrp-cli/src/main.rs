use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "wrp-cli")]
#[command(about = "Weigh-off results pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, clean, and stage every enabled category/year partition.
    Sync,
    /// Copy everything currently staged into the core store.
    Promote,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = wrp_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} partitions={} entries={} sites={} failed_batches={} duplicates={}",
                summary.run_id,
                summary.partitions.len(),
                summary.committed_entries,
                summary.committed_sites,
                summary.failed_batches,
                summary.duplicates_discarded
            );
            if let Some(report) = summary.report_file {
                println!("report: {}", report.display());
            }
        }
        Commands::Promote => {
            let report = wrp_sync::promote_from_env().await?;
            if report.ok() {
                println!("promotion complete: entries and sites copied into core");
            } else {
                for error in &report.errors {
                    eprintln!("promotion error: {error}");
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
