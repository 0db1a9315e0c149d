use std::path::PathBuf;

use anyhow::Result;
use chatbotgate::{Config, Server};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chatbotgate", version, about = "Authenticating reverse proxy")]
struct Cli {
    /// Path to the YAML or JSON configuration file.
    #[clap(short, long, default_value = "chatbotgate.yml")]
    config: PathBuf,

    /// Validate the configuration (reporting every error) and exit.
    #[clap(long)]
    check: bool,

    /// [tracing_subscriber::EnvFilter]
    #[clap(short, long)]
    tracing_env_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            args.tracing_env_filter
                .unwrap_or("chatbotgate=info,tower_http=warn".to_string()),
        )
        .init();

    if args.check {
        match Config::load(&args.config) {
            Ok(_) => {
                println!("{}: configuration OK", args.config.display());
                return Ok(());
            }
            Err(error) => {
                eprintln!("{error}");
                std::process::exit(2);
            }
        }
    }

    Server::run(args.config).await
}
