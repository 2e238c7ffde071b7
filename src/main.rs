use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use tracing_subscriber::EnvFilter;

mod args;
mod auth;
mod classify;
mod config;
mod env;
mod error;
mod http;
mod jobs;
mod ledger;
mod pipeline;
#[cfg(test)]
mod testing;
mod throttle;
mod ui;
mod upload;
mod utils;

use crate::args::{BaseArgs, CLIArgs};

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("FITMIGRATE_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "fitmigrate",
    about = "Upload converted fitness activities to a rate-limited activity platform",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload every pending activity in a directory
    Upload(CLIArgs<upload::UploadArgs>),
    /// Print the authorization URL for obtaining a one-time code
    Authorize(CLIArgs<auth::AuthorizeArgs>),
    /// Show the saved access token for a pending directory
    Token(CLIArgs<auth::TokenArgs>),
    /// Delete the saved access token for a pending directory
    Logout(CLIArgs<auth::LogoutArgs>),
}

impl Commands {
    fn base(&self) -> &BaseArgs {
        match self {
            Commands::Upload(cmd) => &cmd.base,
            Commands::Authorize(cmd) => &cmd.base,
            Commands::Token(cmd) => &cmd.base,
            Commands::Logout(cmd) => &cmd.base,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "fitmigrate=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);
    init_logging(cli.command.base().verbose);

    match cli.command {
        Commands::Upload(cmd) => upload::run(cmd.base, cmd.args).await?,
        Commands::Authorize(cmd) => auth::run_authorize(cmd.base, cmd.args).await?,
        Commands::Token(cmd) => auth::run_token(cmd.base, cmd.args)?,
        Commands::Logout(cmd) => auth::run_logout(cmd.base, cmd.args)?,
    }

    Ok(())
}
