use anyhow::Result;
use clap::{Parser, Subcommand};

mod shell;

#[derive(Parser)]
#[command(name = "shrikedb-cli")]
#[command(about = "CLI for shrikedb-server over TCP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a shrikedb-server and start an interactive shell
    Shell {
        /// Server address (host:port). Default: 127.0.0.1:7171
        #[arg(short = 'H', long)]
        host: Option<String>,
        /// Execute one shell line and exit (non-interactive mode)
        #[arg(short = 'c', long)]
        command: Option<String>,
    },
    /// Send a single JSON request and print the undecorated response
    Send {
        /// Server address (host:port). Default: 127.0.0.1:7171
        #[arg(short = 'H', long)]
        host: Option<String>,
        /// Request body, e.g. '{"command": "show_tables"}'
        json: String,
    },
    /// Check that a server answers ping
    Ping {
        /// Server address (host:port). Default: 127.0.0.1:7171
        #[arg(short = 'H', long)]
        host: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Shell { host, command } => {
            shell::run_shell(host.as_deref(), command.as_deref())
        }
        Commands::Send { host, json } => shell::send_once(host.as_deref(), json),
        Commands::Ping { host } => shell::ping(host.as_deref()),
    }
}
