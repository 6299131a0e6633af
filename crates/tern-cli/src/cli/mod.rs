//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use tern_core::config::{Config, paths};

mod commands;

#[derive(Parser)]
#[command(name = "tern")]
#[command(version)]
#[command(about = "Agent session orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Manage conversations
    Conversations {
        #[command(subcommand)]
        command: ConversationCommands,
    },

    /// Run one turn against a conversation
    Exec {
        /// Conversation to drive
        #[arg(short, long, value_name = "ID")]
        conversation: String,

        /// The operator message
        #[arg(short, long)]
        prompt: String,

        /// Auto-deny permission requests instead of asking on stdin
        #[arg(long = "deny-tools")]
        deny_tools: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConversationCommands {
    /// Lists saved conversations
    List,
    /// Shows a conversation transcript
    Show {
        /// The ID of the conversation to show
        #[arg(value_name = "CONVERSATION_ID")]
        id: String,
    },
    /// Creates a conversation
    New {
        /// Repository the conversation works in
        #[arg(long, default_value = ".")]
        repo: String,

        /// Explicit conversation id (random if omitted)
        #[arg(long, value_name = "ID")]
        id: Option<String>,

        /// Use the web-research backend instead of the coding agent
        #[arg(long)]
        research: bool,

        /// Bind the conversation to an isolated git worktree
        #[arg(long)]
        worktree: bool,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_tracing();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

/// Logs to a daily-rotated file under the tern home; stdout stays clean
/// for command output.
fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::EnvFilter;

    let appender = tracing_appender::rolling::daily(paths::logs_dir(), "tern.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = Config::load().context("load config")?;

    match cli.command {
        Commands::Conversations { command } => match command {
            ConversationCommands::List => commands::conversations::list(),
            ConversationCommands::Show { id } => commands::conversations::show(&id),
            ConversationCommands::New {
                repo,
                id,
                research,
                worktree,
            } => commands::conversations::new(&config, &repo, id, research, worktree),
        },

        Commands::Exec {
            conversation,
            prompt,
            deny_tools,
        } => commands::exec::run(&config, &conversation, &prompt, deny_tools).await,

        Commands::Config { command } => match command {
            ConfigCommands::Path => commands::config::path(),
            ConfigCommands::Init => commands::config::init(),
        },
    }
}
