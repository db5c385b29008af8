use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "dallepd-rs",
    version,
    about = "Download your generated images from the labs task history",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Options for the default `sync` command
    #[command(flatten)]
    pub sync: SyncArgs,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download every image created since the last checkpoint (default)
    Sync(SyncArgs),
    /// Show the checkpoint stored in a download directory
    Status(DirectoryArgs),
    /// Delete the checkpoint so the next sync starts from the beginning
    Reset(ResetArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Local directory for downloads (created if missing)
    #[arg(short = 'd', long)]
    pub directory: Option<String>,

    /// Session bearer token ("sess-..."), taken from a logged-in browser
    /// session. Prefer the DALLE_AUTH_TOKEN environment variable: a token
    /// passed on the command line is visible in process listings.
    #[arg(short = 't', long, env = "DALLE_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Base URL of the labs API
    #[arg(long, default_value = "https://labs.openai.com")]
    pub base_url: String,

    /// Records requested per history page
    #[arg(long, default_value_t = 8)]
    pub page_size: u32,

    /// Records (and assets per record) processed concurrently within one
    /// timestamp group
    #[arg(long, default_value_t = 1)]
    pub threads_num: u16,

    /// First retry delay for a failed image download, in seconds
    #[arg(long, default_value_t = 2)]
    pub backoff_initial_secs: u64,

    /// Give up on an image once the next retry delay would reach this many seconds
    #[arg(long, default_value_t = 30)]
    pub backoff_ceiling_secs: u64,

    /// exiftool executable used to embed prompts
    #[arg(long, default_value = "exiftool")]
    pub exiftool: String,

    /// Do not embed prompts into downloaded images
    #[arg(long)]
    pub no_caption: bool,

    /// Scan and report without downloading or moving the checkpoint
    #[arg(long)]
    pub dry_run: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Run continuously, waiting N seconds between runs
    #[arg(long)]
    pub watch_with_interval: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct DirectoryArgs {
    /// Local download directory
    #[arg(short = 'd', long)]
    pub directory: String,
}

#[derive(Args, Debug, Clone)]
pub struct ResetArgs {
    #[command(flatten)]
    pub dir: DirectoryArgs,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl Cli {
    /// The command to run; bare invocation means `sync`.
    pub fn effective_command(&self) -> Command {
        match &self.command {
            Some(command) => command.clone(),
            None => Command::Sync(self.sync.clone()),
        }
    }
}
