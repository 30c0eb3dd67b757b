mod cmd_config;
mod cmd_draft;
mod cmd_sessions;
mod shell;

use clap::{Parser, Subcommand};
use rowstage_store::{Config, StorePaths};
use tracing_subscriber::EnvFilter;

/// Log filter variable; defaults to `warn`.
const LOG_ENV: &str = "ROWSTAGE_LOG";

#[derive(Parser)]
#[command(
    name = "rowstage",
    version,
    about = "Stage row edits locally and commit them to a versioned database branch"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open an interactive editing session
    Shell {
        /// Resume a persisted session by id
        #[arg(long)]
        session: Option<String>,
        /// Use an in-process remote instead of the configured server
        #[arg(long)]
        offline: bool,
        /// Target id (overrides config default_target)
        #[arg(long)]
        target: Option<String>,
        /// Database name (overrides config default_database)
        #[arg(long)]
        database: Option<String>,
        /// Work branch (overrides config default_branch)
        #[arg(long)]
        branch: Option<String>,
    },
    /// Read or change configuration
    Config {
        #[command(subcommand)]
        cmd: cmd_config::ConfigCmd,
    },
    /// Inspect or discard a persisted draft without opening a shell
    Draft {
        #[command(subcommand)]
        cmd: cmd_draft::DraftCmd,
    },
    /// List persisted sessions, most recent first
    Sessions,
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let store = StorePaths::discover(rowstage_store::store_root());

    match cli.cmd {
        Command::Shell {
            session,
            offline,
            target,
            database,
            branch,
        } => {
            let config = Config::load(&store.config_json);
            shell::run(
                shell::ShellOptions {
                    session,
                    offline,
                    target,
                    database,
                    branch,
                },
                &store,
                &config,
            )
        }
        Command::Config { cmd } => cmd_config::run(cmd, &store),
        Command::Draft { cmd } => cmd_draft::run(cmd, &store),
        Command::Sessions => cmd_sessions::execute(&store),
    }
}
