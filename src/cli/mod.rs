use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use xare::xmpp::Jid;

pub mod config;
pub mod credential;
pub mod run;
pub mod trust;
pub mod version;

#[derive(Parser)]
#[command(name = "xare")]
#[command(author = "Xare Project")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Single-peer OMEMO bot for XMPP", long_about = None)]
pub struct Cli {
    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    pub quiet: bool,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect, print the peer's backlog, optionally send, disconnect
    ///
    /// This build links no networked XMPP transport: the run is simulated
    /// against the server described by the --simulate fixture.
    Run(RunArgs),

    /// List persisted device trust decisions
    Trust {
        /// Path to config file (default: next to the store)
        #[arg(long)]
        config: Option<String>,

        /// Path to the session table (optional, uses default if not specified)
        #[arg(long)]
        store_path: Option<String>,
    },

    /// Display version information
    Version,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to config file (default: next to the store at ~/.local/share/xare/config.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Own JID, e.g. bot@example.org/xare
    #[arg(short, long)]
    pub jid: Option<Jid>,

    /// Account password (prefer XARE_PASSWORD or the prompt)
    #[arg(short, long)]
    pub password: Option<String>,

    /// JID of the peer
    #[arg(short, long)]
    pub to: Option<Jid>,

    /// Encrypted text message to send after the backlog
    #[arg(short = 'm', long)]
    pub send_msg: Option<String>,

    /// File to upload and send after the message
    #[arg(short = 'f', long)]
    pub send_file: Option<String>,

    /// Path to the session table (optional, uses default if not specified)
    #[arg(long)]
    pub store_path: Option<String>,

    /// Simulated server to run against, as a JSON fixture (required)
    #[arg(long)]
    pub simulate: Option<std::path::PathBuf>,
}

impl Cli {
    /// Log level forced by -q / -d, if any
    pub fn level_override(&self) -> Option<&'static str> {
        if self.quiet {
            Some("error")
        } else if self.debug {
            Some("debug")
        } else {
            None
        }
    }
}

/// Install the fmt subscriber.
///
/// `RUST_LOG` wins over `level` when set. Output is `LEVEL message` on stderr
/// so stdout carries only the backlog.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .try_init();
}

pub async fn execute(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let level_override = cli.level_override();
    match cli.command {
        Commands::Run(args) => {
            let status = run::execute(args, level_override).await?;
            Ok(ExitCode::from(status))
        }
        Commands::Trust { config, store_path } => {
            init_logging(level_override.unwrap_or("warn"));
            trust::execute(config, store_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => {
            version::execute();
            Ok(ExitCode::SUCCESS)
        }
    }
}
