use anyhow::Result;
use clap::Parser;
use quote_stream::cli::{self, Cli};
use quote_stream::{logging, service, tail};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::set_min_level(cli.log_level);
    match cli.command() {
        cli::Command::Serve(args) => service::run_with_config(args.into_config()).await,
        cli::Command::Tail(args) => tail::run(args).await,
    }
}
