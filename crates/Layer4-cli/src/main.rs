//! IOC launcher CLI - Main entry point

mod cli;

use clap::{Parser, Subcommand};
use ioc_foundation::LauncherConfig;
use ioc_task::Scanner;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// IOC launcher - discover and supervise EPICS IOC instances
#[derive(Parser, Debug)]
#[command(name = "ioc-launcher")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Read configuration from this file instead of the global/project files
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the IOC instances found under the root directory
    Scan {
        /// Root directory (overrides config and environment)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start one IOC and attach to its console
    Run {
        /// Instance ID from `scan`, instance name or camera name
        target: String,

        /// Root directory (overrides config and environment)
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to ./.ioc-launcher/launcher.json
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries IOC output
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => LauncherConfig::load_from(path)?,
        None => LauncherConfig::load()?,
    };

    match args.command {
        Command::Scan { root, json } => {
            if let Some(root) = root {
                config.root = root;
            }
            scan_cmd(&config, json)
        }
        Command::Run { target, root } => {
            if let Some(root) = root {
                config.root = root;
            }
            cli::run_instance(&config, &target).await
        }
        Command::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save_project()?;
                eprintln!("saved {}", path.display());
            }
            Ok(())
        }
    }
}

/// Discover instances and print them as a table or JSON
fn scan_cmd(config: &LauncherConfig, json: bool) -> anyhow::Result<()> {
    let outcome = Scanner::new(&config.root).scan();

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.descriptors)?);
        return Ok(());
    }

    if outcome.descriptors.is_empty() {
        println!("No IOCs found under {}.", config.root.display());
    } else {
        println!(
            "{:<4} {:<24} {:<20} {:<32} {}",
            "ID", "NAME", "PREFIX", "DEVICE", "STAGE"
        );
        println!("{}", "-".repeat(100));
        for (id, d) in outcome.descriptors.iter().enumerate() {
            println!(
                "{:<4} {:<24} {:<20} {:<32} {}",
                id,
                d.instance_name(),
                d.prefix(),
                d.device_name(),
                d.stage_path().display()
            );
        }
    }

    for file in &outcome.skipped {
        eprintln!("skipped {}", file.display());
    }
    Ok(())
}
