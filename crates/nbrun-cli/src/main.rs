mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::kernels::KernelsArgs;
use commands::serve::ServeArgs;

#[derive(Parser, Debug)]
#[command(
    name = "nbrun",
    version,
    about = "Queued code execution against long-lived kernels"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve(ServeArgs),

    /// List configured kernel specs
    Kernels(KernelsArgs),

    /// Run the scripted test kernel over stdin/stdout
    ScriptedKernel,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; variables already set win.
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            commands::setup_logging();
            if let Ok(path) = dotenv {
                tracing::debug!("loaded {}", path.display());
            }
            commands::serve::cmd_serve(&args).await
        }
        Command::Kernels(args) => commands::kernels::cmd_kernels(&args),
        Command::ScriptedKernel => {
            commands::setup_logging();
            commands::scripted_kernel::cmd_scripted_kernel().await
        }
    }
}
