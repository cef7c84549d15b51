// Ember store binary entry point: runs either the view service or a
// primary/backup server.

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ember_store::{
    start_store_server, start_view_service, ServerConfig, ViewConfig, CRITICAL_MASS, SEG_LIMIT,
};

#[derive(Parser, Debug)]
#[command(name = "ember-store")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the view service.
    View(ViewArgs),
    /// Run a primary/backup server.
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ViewArgs {
    /// Endpoint to listen on: `host:port`, or a socket path for local mode.
    #[arg(long)]
    listen: String,

    /// Live servers required before the first view is published.
    #[arg(long, env = "EMBER_CRITICAL_MASS", default_value_t = CRITICAL_MASS)]
    critical_mass: usize,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Endpoint to listen on: `host:port`, or a socket path for local mode.
    #[arg(long)]
    listen: String,

    /// View service endpoint.
    #[arg(long)]
    view_server: String,

    /// Directory flushed segments are persisted into.
    #[arg(long, env = "EMBER_SEG_PATH", default_value = "/tmp/segment")]
    seg_path: PathBuf,

    /// Segment capacity in bytes.
    #[arg(long, env = "EMBER_SEG_LIMIT", default_value_t = SEG_LIMIT)]
    seg_limit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::View(args) => {
            let mut cfg = ViewConfig::new(args.listen.clone());
            cfg.critical_mass = args.critical_mass;
            let handle = start_view_service(cfg).await?;
            tracing::info!(listen = %args.listen, "view service running");
            tokio::signal::ctrl_c().await?;
            handle.tasks.abort();
        }
        Command::Server(args) => {
            let mut cfg = ServerConfig::new(args.listen.clone(), args.view_server);
            cfg.seg_path = args.seg_path;
            cfg.seg_limit = args.seg_limit;
            let handle = start_store_server(cfg).await?;
            tracing::info!(listen = %args.listen, "store server running");
            tokio::signal::ctrl_c().await?;
            handle.tasks.abort();
        }
    }
    Ok(())
}
