use anyhow::Result;
use clap::Parser;

use credproxy::cli::{self, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref())?;

    // Initialize logging. stdout carries command output, so logs go to stderr.
    let log_level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sweep => cli::sweep::run(&config),
        Commands::Serve(args) => cli::serve::run(args, &config),
        Commands::Proxy(args) => cli::proxy::run(args, &config),
        Commands::Audit(args) => cli::audit::run(args, &config),
        Commands::Paths => cli::paths::run(&config),
        Commands::Config(args) => cli::config::run(args, &config),
    }
}
