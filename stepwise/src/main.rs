use clap::{Parser, Subcommand};
use stepwise::commands::migrate::{self, TargetArgs};
use stepwise::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Apply ordered SQL migrations exactly once, tracked by a revision record")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply every pending migration
    Up {
        #[command(flatten)]
        target: TargetArgs,

        /// Hold the revision lock while migrating
        #[arg(long)]
        lock: bool,
    },
    /// Show how far the store is behind the migration directory
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Command::Up { target, lock } => {
            let revision = migrate::up(&target, lock).await?;
            println!("Migrated to revision {}", revision.version);
        }
        Command::Status { target } => {
            let status = migrate::status(&target).await?;
            println!("{}", migrate::describe_status(&status));
        }
    }

    Ok(())
}
