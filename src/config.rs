use std::path::PathBuf;

use crate::cli::SyncArgs;
use crate::retry::BackoffConfig;

/// Validated configuration for a sync run.
pub struct Config {
    pub directory: PathBuf,
    pub auth_token: String,
    pub base_url: String,
    pub exiftool: PathBuf,

    pub watch_with_interval: Option<u64>,
    pub backoff: BackoffConfig,

    pub page_size: u32,
    pub threads_num: u16,

    pub no_caption: bool,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("directory", &self.directory)
            .field("auth_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .field("threads_num", &self.threads_num)
            .field("backoff", &self.backoff)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

/// Expand ~ to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(args: SyncArgs) -> anyhow::Result<Self> {
        let directory = match args.directory.as_deref() {
            Some(d) if !d.trim().is_empty() => expand_tilde(d),
            _ => anyhow::bail!("--directory is required for downloading"),
        };

        let auth_token = match args.auth_token {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => anyhow::bail!(
                "An auth token is required. Copy the \"sess-...\" bearer token from a \
                 logged-in browser session and pass it via DALLE_AUTH_TOKEN or --auth-token"
            ),
        };

        if args.page_size == 0 {
            anyhow::bail!("--page-size must be at least 1");
        }
        if args.threads_num == 0 {
            anyhow::bail!("--threads-num must be at least 1");
        }
        if args.backoff_initial_secs == 0 {
            anyhow::bail!("--backoff-initial-secs must be at least 1");
        }
        if args.backoff_ceiling_secs < args.backoff_initial_secs {
            anyhow::bail!(
                "--backoff-ceiling-secs ({}) must not be below --backoff-initial-secs ({})",
                args.backoff_ceiling_secs,
                args.backoff_initial_secs
            );
        }

        Ok(Self {
            directory,
            auth_token,
            base_url: args.base_url,
            exiftool: expand_tilde(&args.exiftool),
            watch_with_interval: args.watch_with_interval,
            backoff: BackoffConfig::from_secs(args.backoff_initial_secs, args.backoff_ceiling_secs),
            page_size: args.page_size,
            threads_num: args.threads_num,
            no_caption: args.no_caption,
            dry_run: args.dry_run,
            no_progress_bar: args.no_progress_bar,
        })
    }
}
