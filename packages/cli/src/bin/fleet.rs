use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use fleet_cli::{app, logging, FleetSummary};
use fleet_config::FleetConfig;
use std::process;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Fleet - sandboxed coding agents with steerable sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the delivery dispatcher, sandbox sweeper and session orchestrator
    Serve,
    /// Expire lapsed warm sandboxes and stop idle ones, then exit
    Sweep,
    /// Show sandbox and conversation counts
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = FleetConfig::from_env().context("Invalid fleet configuration")?;
    logging::init(&config.log_level);

    match command {
        Commands::Serve => app::serve(config).await,
        Commands::Sweep => {
            let report = app::sweep(config).await?;
            println!(
                "{} expired {} warm, stopped {} idle",
                "✓".green(),
                report.expired_warm,
                report.stopped_idle
            );
            Ok(())
        }
        Commands::Status { json } => {
            let summary = app::status(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary.to_json())?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
    }
}

fn print_summary(summary: &FleetSummary) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Sandbox status", "Count"]);
    for (status, count) in &summary.sandboxes {
        table.add_row(vec![Cell::new(status), Cell::new(count)]);
    }
    println!("{}", table);
    println!(
        "{} {}",
        "Open conversations:".bold(),
        summary.open_conversations
    );
}
