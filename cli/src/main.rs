//! AppVM CLI - Command-line interface for the AppVM session launcher
//!
//! Launches application sessions from a dispatch request, previews the
//! container command a request would produce, and inspects image selection.

use std::fs;
use std::io::Read;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::info;

use appvm_launcher::config::LauncherConfig;
use appvm_launcher::container::ImageSelector;
use appvm_launcher::logging::init_logging;
use appvm_launcher::models::Subscription;
use appvm_launcher::{ConnectivityDescriptor, LaunchRequest, SessionLauncher};

/// AppVM CLI - Start containerised application sessions
#[derive(Parser)]
#[command(name = "appvm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the AppVM session launcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a session and print how to reach it
    Launch {
        /// Request JSON file, or `-` for stdin
        #[arg(short, long)]
        request: String,

        /// Bus address advertised to the session (defaults to the configured broker host)
        #[arg(long)]
        bus_host: Option<String>,

        /// Session secret used when the request carries none
        #[arg(long)]
        secret: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Print the container command a request would run
    Plan {
        /// Request JSON file, or `-` for stdin
        #[arg(short, long)]
        request: String,

        /// Subscription address (`/exchange/<name>/<name>`) or bare exchange name
        #[arg(short, long)]
        subscription: String,

        /// Bus address advertised to the session (defaults to the configured broker host)
        #[arg(long)]
        bus_host: Option<String>,
    },

    /// Print the image selected for an application
    Image {
        /// Application name, e.g. `writer`
        application: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn read_request(source: &str) -> Result<LaunchRequest> {
    let json = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        fs::read_to_string(source)
            .with_context(|| format!("Failed to read request file: {}", source))?
    };

    LaunchRequest::from_json(&json).context("Invalid launch request")
}

fn load_config() -> Result<LauncherConfig> {
    let config = LauncherConfig::load()?;
    init_logging(&config.log_level, config.log_file.as_deref())?;
    Ok(config)
}

fn print_descriptor(descriptor: &ConnectivityDescriptor) {
    println!("{}", "=".repeat(60).bright_blue());
    let display = format!("{}://{}:{}", descriptor.protocol, descriptor.host, descriptor.port);
    println!("{} {}", "Display:".bright_cyan(), display.green());
    println!("{} {}", "Token:".bright_cyan(), descriptor.token);
    println!("{} {}:{}", "Bus:".bright_cyan(), descriptor.bus_host, descriptor.bus_port);
    if let Some(user) = &descriptor.bus_user {
        println!("{} {}", "Bus User:".bright_cyan(), user);
    }
    for subscription in &descriptor.bus_subscriptions {
        println!("{} {}", "Subscription:".bright_cyan(), subscription);
    }
    if let Some(ws_host) = &descriptor.ws_host {
        let port = descriptor
            .ws_port
            .as_ref()
            .map(|p| p.to_string().trim_matches('"').to_string())
            .unwrap_or_default();
        println!("{} {}:{}", "WebSocket:".bright_cyan(), ws_host, port);
    }
    println!("{}", "=".repeat(60).bright_blue());
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Launch {
            request,
            bus_host,
            secret,
            output,
        } => {
            let request = read_request(&request)?;
            let config = load_config()?;
            let bus_host = bus_host.unwrap_or_else(|| config.broker.host.clone());

            info!(version = env!("CARGO_PKG_VERSION"), "Starting AppVM launch");
            let launcher = SessionLauncher::new(config, bus_host, secret);
            let descriptor = launcher.launch(&request).await?;

            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&descriptor)?),
                OutputFormat::Text => print_descriptor(&descriptor),
            }
        }

        Commands::Plan {
            request,
            subscription,
            bus_host,
        } => {
            let request = read_request(&request)?;
            let config = load_config()?;
            let bus_host = bus_host.unwrap_or_else(|| config.broker.host.clone());

            let launcher = SessionLauncher::new(config, bus_host, None);
            let invocation = launcher.plan(&request, &Subscription::parse(&subscription)).await?;

            println!("{} {}", "Container:".bright_cyan(), invocation.container_name());
            println!("{} {}", "Image:".bright_cyan(), invocation.image());
            println!("{}", invocation.command_line().join(" "));
        }

        Commands::Image { application } => {
            let config = LauncherConfig::load()?;
            let selected = ImageSelector::new(config.images).select(&application);

            if selected.fallback {
                println!("{} {}", selected.reference, "(fallback)".yellow());
            } else {
                println!("{}", selected.reference);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "✗ Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
