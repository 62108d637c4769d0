//! Corvid CLI entry point.
//!
//! Commands:
//! - `run`: Send a prompt to a session
//! - `command`: Expand a configured command template and send it
//! - `shell`: Run a shell command inside a session
//! - `sessions`: List sessions
//! - `messages`: Print a session's messages
//! - `compact`: Summarize a session
//! - `config`: Print the effective configuration
//! - `completions`: Generate shell completions

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

mod commands;
mod engine;
mod render;

#[derive(Parser)]
#[command(name = "corvid", about = "Corvid: session-based coding agent", version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use this config file instead of ~/.corvid/config.toml
    #[arg(long, global = true, env = "CORVID_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Approve every permission ask (otherwise asks are rejected)
    #[arg(short, long, global = true)]
    yes: bool,

    /// Run against a scripted model loaded from a JSON file
    #[arg(long, global = true, value_name = "FILE")]
    scripted: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a prompt and print the answer
    Run {
        /// The message to send
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,

        /// Continue this session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,

        /// Agent to answer with
        #[arg(short, long)]
        agent: Option<String>,

        /// Model as provider/model
        #[arg(short, long)]
        model: Option<String>,

        /// Attach a file or directory (repeatable)
        #[arg(short, long)]
        file: Vec<PathBuf>,
    },

    /// Run a configured command template
    Command {
        name: String,
        arguments: Vec<String>,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// Run a shell command and record it in a session
    Shell {
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// List sessions, most recent first
    Sessions,

    /// Print every message of a session
    Messages { session: String },

    /// Summarize a session's history
    Compact {
        session: String,

        /// Model as provider/model
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Generate shell completions
    Completions { shell: Shell },
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let options = engine::Options {
        config: cli.config,
        yes: cli.yes,
        scripted: cli.scripted,
    };

    match cli.command {
        Commands::Run {
            message,
            session,
            agent,
            model,
            file,
        } => {
            commands::run::run(
                &options,
                commands::run::RunArgs {
                    message: message.join(" "),
                    session,
                    agent,
                    model,
                    files: file,
                },
            )
            .await?
        }
        Commands::Command {
            name,
            arguments,
            session,
        } => commands::run::command(&options, name, arguments.join(" "), session).await?,
        Commands::Shell { command, session } => commands::run::shell(&options, command.join(" "), session).await?,
        Commands::Sessions => commands::sessions::list(&options).await?,
        Commands::Messages { session } => commands::sessions::messages(&options, &session).await?,
        Commands::Compact { session, model } => commands::sessions::compact(&options, &session, model).await?,
        Commands::Config => commands::config_cmd::show(&options)?,
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "corvid", &mut std::io::stdout());
        }
    }

    Ok(())
}
