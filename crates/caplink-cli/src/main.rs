//! caplink: manage capability servers and execute their tools

mod commands;
mod shell;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "caplink")]
#[command(about = "Connect to capability servers and execute their tools", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage server definitions
    Servers {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// Connect to a server (all enabled servers when no id is given)
    Connect {
        /// Server id to connect
        id: Option<String>,
    },

    /// Disconnect a server
    Disconnect {
        /// Server id to disconnect
        id: String,
    },

    /// Re-read the config file and reconcile connections
    Reload,

    /// List tools exposed by connected servers
    Tools {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a tool and print its result
    Call {
        /// Tool name (bare or server-qualified)
        tool: String,

        /// Tool arguments as a JSON object
        args: Option<String>,

        /// Session id to record the invocation under
        #[arg(short, long, default_value = "cli")]
        session: String,

        /// Output the full execution record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Probe every configured server and report health
    Health,

    /// Watch the config file, reloading and reconnecting on changes
    Watch,

    /// Interactive session (connect, call, cancel, inspect history)
    Shell,
}

#[derive(Debug, Subcommand)]
enum ServerAction {
    /// List configured servers and their states
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a server definition
    Add {
        /// Unique server id
        id: String,

        /// Command to launch the server
        command: String,

        /// Arguments passed to the command
        args: Vec<String>,

        /// Environment variables as KEY=VALUE (supports ${VAR} expansion)
        #[arg(short, long)]
        env: Vec<String>,

        /// Human-readable name
        #[arg(long)]
        name: Option<String>,

        /// Base URL for an HTTP server instead of a command
        #[arg(long)]
        url: Option<String>,

        /// Register the server without enabling it
        #[arg(long)]
        disabled: bool,

        /// Handshake and request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// Remove a server definition
    Rm {
        /// Server id to remove
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Some(Commands::Servers { action }) => match action {
            ServerAction::List { json } => commands::servers_list(json).await,
            ServerAction::Add {
                id,
                command,
                args,
                env,
                name,
                url,
                disabled,
                timeout,
            } => commands::servers_add(&id, &command, args, env, name, url, disabled, timeout).await,
            ServerAction::Rm { id } => commands::servers_rm(&id).await,
        },
        Some(Commands::Connect { id }) => commands::connect(id.as_deref()).await,
        Some(Commands::Disconnect { id }) => commands::disconnect(&id).await,
        Some(Commands::Reload) => commands::reload().await,
        Some(Commands::Tools { json }) => commands::tools(json).await,
        Some(Commands::Call {
            tool,
            args,
            session,
            json,
        }) => commands::call(&tool, args.as_deref(), &session, json).await,
        Some(Commands::Health) => commands::health().await,
        Some(Commands::Watch) => commands::watch().await,
        Some(Commands::Shell) => shell::run().await,
        None => {
            // Default to the interactive shell when no command specified
            shell::run().await
        }
    }
}
