// Operator tool: inspect the cluster through the view service, and issue
// ad-hoc gets/puts through a clerk.

use clap::{Parser, Subcommand};

use ember_store::clerk::{Clerk, ViewClerk};

#[derive(Parser, Debug)]
#[command(name = "emberctl")]
struct Args {
    /// View service endpoint.
    #[arg(long, env = "EMBER_VIEW_SERVER")]
    view_server: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the view service's diagnostic snapshot.
    Status,
    /// Print the current view.
    View,
    /// Fetch one key.
    Get { key: String },
    /// Store one key.
    Put { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Status => {
            let clerk = ViewClerk::new("emberctl", args.view_server.clone());
            let status = clerk.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::View => {
            let clerk = ViewClerk::new("emberctl", args.view_server.clone());
            let view = clerk.get().await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Get { key } => {
            let mut clerk = Clerk::new(args.view_server.clone());
            println!("{}", clerk.get(&key).await);
        }
        Command::Put { key, value } => {
            let mut clerk = Clerk::new(args.view_server.clone());
            clerk.put(&key, &value).await;
        }
    }
    Ok(())
}
