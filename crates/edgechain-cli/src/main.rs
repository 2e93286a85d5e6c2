//! edgechain: provision a private container service behind a TLS balancer
//! chain.
//!
//! # Usage
//!
//! ```text
//! edgechain init --name fin-chat --image registry.local/fin-chat:v1 --certificate arn:aws:acm:...
//! edgechain plan
//! edgechain apply
//! edgechain health --ticks 3
//! edgechain destroy
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "edgechain",
    about = "Private container service behind an internal TLS balancer and an external passthrough",
    version,
    propagate_version = true
)]
struct Cli {
    /// Stack config file.
    #[arg(short, long, global = true, default_value = "edgechain.toml")]
    config: PathBuf,

    /// Directory holding the observed-state database.
    #[arg(long, global = true, default_value = ".edgechain")]
    state_dir: PathBuf,

    /// Environment name. Several environments can share one state directory.
    #[arg(short, long, global = true, default_value = "default")]
    env: String,

    /// Emit logs and command output as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config for the reference stack.
    Init {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "ca-central-1")]
        region: String,
        /// Container image reference (tag or digest).
        #[arg(long)]
        image: String,
        /// Certificate reference bound to the HTTPS listener.
        #[arg(long)]
        certificate: String,
        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },
    /// Check the config and build every step without provisioning.
    Validate,
    /// Show what `apply` would change.
    Plan,
    /// Provision or update the environment.
    Apply,
    /// Delete every resource of the environment.
    Destroy,
    /// Print the recorded outputs.
    Outputs,
    /// Evaluate health propagation through the balancer chain.
    Health {
        /// Probe intervals to simulate.
        #[arg(long, default_value = "3")]
        ticks: u32,
        /// Simulate tasks that fail their health check.
        #[arg(long)]
        failing: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let ctx = commands::Context {
        config: cli.config,
        state_dir: cli.state_dir,
        env: cli.env,
        json: cli.json,
    };
    match cli.command {
        Command::Init {
            name,
            region,
            image,
            certificate,
            force,
        } => commands::stack::init(&ctx, &name, &region, &image, &certificate, force),
        Command::Validate => commands::stack::validate(&ctx),
        Command::Plan => commands::provision::plan(&ctx),
        Command::Apply => commands::provision::apply(&ctx).await,
        Command::Destroy => commands::provision::destroy(&ctx).await,
        Command::Outputs => commands::provision::outputs(&ctx),
        Command::Health { ticks, failing } => commands::health::run(&ctx, ticks, failing),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,edgechain=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
