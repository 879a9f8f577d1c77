use anyhow::Result;
use clap::Parser;
use tls_edge_proxy::cli::{execute_command, Cli};
use tracing::info;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    // Display version information
    info!("TLS Edge Proxy v{}", env!("CARGO_PKG_VERSION"));

    execute_command(&cli)
}
