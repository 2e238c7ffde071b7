use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Log per-attempt detail to stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Path to a JSON settings file (or via FITMIGRATE_CONFIG)
    #[arg(long, env = "FITMIGRATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "FITMIGRATE_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,

    /// Override the platform API URL (or via FITMIGRATE_API_URL)
    #[arg(
        long,
        env = "FITMIGRATE_API_URL",
        hide_env_values = true,
        global = true
    )]
    pub api_url: Option<String>,

    /// Override the authorization page URL (or via FITMIGRATE_AUTHORIZE_URL)
    #[arg(
        long,
        env = "FITMIGRATE_AUTHORIZE_URL",
        hide_env_values = true,
        global = true
    )]
    pub authorize_url: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}
