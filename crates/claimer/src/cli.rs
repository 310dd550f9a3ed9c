use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::Url;

use clue_claimer_core::TaskType;

fn parse_task_type(input: &str) -> Result<TaskType, String> {
    input.parse()
}

fn parse_interval(input: &str) -> Result<Duration, String> {
    let interval = humantime::parse_duration(input.trim()).map_err(|e| e.to_string())?;
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(interval)
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "clue-claimer",
    version,
    about = "Watch the clue review queue and claim matching tasks"
)]
pub struct Cli {
    /// Queue service base URL.
    #[arg(long, env = "CLAIMER_BASE_URL", global = true)]
    pub base_url: Option<Url>,

    /// Session cookie sent with every request.
    #[arg(long, env = "CLAIMER_COOKIE", global = true, hide_env_values = true)]
    pub cookie: Option<String>,

    /// Settings file (defaults to `$XDG_CONFIG_HOME/clue-claimer/settings.json`).
    #[arg(long, env = "CLAIMER_SETTINGS", global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Poll the queue and claim matching items until the limit is reached.
    Run(RunArgs),
    /// Print the filter labels (grades, subjects, clue types) for a task type.
    Labels {
        #[arg(long, env = "CLAIMER_TASK_TYPE", value_parser = parse_task_type)]
        task_type: Option<TaskType>,
        /// Print the raw response envelope as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the account the cookie belongs to.
    Whoami {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// `audit` or `produce`.
    #[arg(long, env = "CLAIMER_TASK_TYPE", value_parser = parse_task_type)]
    pub task_type: Option<TaskType>,

    /// Grade filter, by label name or numeric id.
    #[arg(long, env = "CLAIMER_STEP")]
    pub step: Option<String>,

    /// Subject filter, by label name or numeric id.
    #[arg(long, env = "CLAIMER_SUBJECT")]
    pub subject: Option<String>,

    /// Clue type filter, by label name or numeric id.
    #[arg(long, env = "CLAIMER_CLUE_TYPE")]
    pub clue_type: Option<String>,

    /// Stop after this many successful claims.
    #[arg(
        short = 'n',
        long,
        env = "CLAIMER_LIMIT",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub limit: Option<u32>,

    /// Pause between poll cycles (e.g. `500ms`, `2s`).
    #[arg(short = 'i', long, env = "CLAIMER_INTERVAL", value_parser = parse_interval)]
    pub interval: Option<Duration>,

    /// Pages fetched per cycle; `0` pages until the queue runs dry.
    #[arg(long, env = "CLAIMER_MAX_PAGES")]
    pub max_pages: Option<u32>,

    /// Claim requests allowed in flight at once.
    #[arg(
        short = 'c',
        long,
        env = "CLAIMER_CONCURRENCY",
        value_parser = clap::value_parser!(u16).range(1..=256)
    )]
    pub concurrency: Option<u16>,

    /// Only claim items whose brief contains one of these keywords.
    #[arg(long = "include", env = "CLAIMER_INCLUDE", value_delimiter = ',')]
    pub include_keywords: Vec<String>,

    /// Never claim items whose brief contains one of these keywords.
    #[arg(long = "exclude", env = "CLAIMER_EXCLUDE", value_delimiter = ',')]
    pub exclude_keywords: Vec<String>,

    /// Earliest publish time (`2006-01-02 15:04:05`); produce tasks only.
    #[arg(long = "start", env = "CLAIMER_START_TIME")]
    pub start_time: Option<String>,

    /// Latest publish time (`2006-01-02 15:04:05`); produce tasks only.
    #[arg(long = "end", env = "CLAIMER_END_TIME")]
    pub end_time: Option<String>,

    /// Write the effective options back to the settings file before starting.
    #[arg(long, default_value_t = false)]
    pub save: bool,

    #[arg(long, env = "CLAIMER_NO_PROGRESS", default_value_t = false)]
    pub no_progress: bool,
}
