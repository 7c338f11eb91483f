mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, deploy::DeployExit};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gwdeploy",
    about = "Deploy the gateway on this host: secrets, migrations, restart, health check, automatic rollback",
    version
)]
struct Cli {
    /// Deployment root holding gwdeploy.yaml (default: auto-detect upward from cwd)
    #[arg(long, global = true, env = "GWDEPLOY_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold gwdeploy.yaml, migrations/ and .gwdeploy/ (never overwrites)
    Init,

    /// Deploy a version: exit 0 success, 2 rolled back, 3 failed
    Deploy {
        /// Image tag to deploy
        #[arg(long = "version", value_name = "TAG")]
        tag: String,

        /// Do not run schema migrations
        #[arg(long)]
        skip_migrations: bool,

        /// Print the plan without touching the host
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the running version, a single health probe and the host lease
    Status,

    /// Stop the gateway services
    Stop,

    /// Tail the gateway logs
    Logs {
        /// Number of lines
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: u32,
    },

    /// Recent deployment attempts on this host
    History {
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Inspect and validate gwdeploy.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Deploy { .. } | Commands::Stop => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    // Logs go to stderr so `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Deploy {
            tag,
            skip_migrations,
            dry_run,
        } => cmd::deploy::run(&root, &tag, skip_migrations, dry_run, cli.json),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::Stop => cmd::stop::run(&root, cli.json),
        Commands::Logs { lines } => cmd::logs::run(&root, lines),
        Commands::History { limit } => cmd::history::run(&root, limit, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        let code = e
            .downcast_ref::<DeployExit>()
            .map(DeployExit::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
