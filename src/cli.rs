use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Data directory for jobs, sources, novels and uploads (overrides config).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// YAML settings file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse an EPUB and print the chapters it yields as JSON.
    Parse(ParseArgs),
    /// Import an EPUB into a novel.
    Import(ImportArgs),
    /// Record that a chapter's audio is ready.
    AudioComplete(AudioCompleteArgs),
    /// Record that a chapter's audio could not be generated; fails the job.
    AudioFailed(AudioFailedArgs),
    /// Fail a job that has not finished yet.
    Cancel(CancelArgs),
    /// Print a job as JSON.
    Job(JobArgs),
    /// Manage web sources polled for new chapters.
    Source {
        #[command(subcommand)]
        command: SourceCommand,
    },
    /// Poll sources that are due.
    Sync(SyncArgs),
    /// Fail jobs that stopped making progress.
    Sweep,
}

#[derive(Debug, Args)]
pub struct ParseArgs {
    /// Path to the `.epub` file.
    #[arg(long)]
    pub epub: PathBuf,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Path to the `.epub` file.
    #[arg(long)]
    pub epub: PathBuf,

    #[arg(long)]
    pub novel_id: String,

    #[arg(long)]
    pub user_id: String,

    /// Publish status given to every created chapter.
    #[arg(long)]
    pub requested_status: Option<String>,
}

#[derive(Debug, Args)]
pub struct AudioCompleteArgs {
    #[arg(long)]
    pub job: String,

    #[arg(long)]
    pub chapter: String,
}

#[derive(Debug, Args)]
pub struct AudioFailedArgs {
    #[arg(long)]
    pub job: String,

    #[arg(long)]
    pub chapter: String,

    #[arg(long)]
    pub reason: String,
}

#[derive(Debug, Args)]
pub struct CancelArgs {
    #[arg(long)]
    pub job: String,

    #[arg(long, default_value = "cancelled by user")]
    pub reason: String,
}

#[derive(Debug, Args)]
pub struct JobArgs {
    #[arg(long)]
    pub job: String,
}

#[derive(Debug, Subcommand)]
pub enum SourceCommand {
    /// Register a web source to poll for new chapters.
    Add(SourceAddArgs),
    /// Print every source as JSON.
    List,
    /// Resume polling a source and clear its failure streak.
    Enable(SourceIdArgs),
    /// Stop polling a source.
    Disable(SourceIdArgs),
    /// Change how often a source is polled.
    Update(SourceUpdateArgs),
    /// Delete a source that is not syncing.
    Remove(SourceIdArgs),
}

#[derive(Debug, Args)]
pub struct SourceAddArgs {
    #[arg(long)]
    pub novel_id: String,

    #[arg(long)]
    pub user_id: String,

    /// Index page listing the chapters (must be http/https).
    #[arg(long)]
    pub url: String,

    #[arg(long, default_value = "web")]
    pub platform: String,

    /// Minutes between successful syncs (default from settings).
    #[arg(long)]
    pub interval_minutes: Option<u32>,
}

#[derive(Debug, Args)]
pub struct SourceIdArgs {
    #[arg(long)]
    pub source: String,
}

#[derive(Debug, Args)]
pub struct SourceUpdateArgs {
    #[arg(long)]
    pub source: String,

    #[arg(long)]
    pub interval_minutes: u32,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Run a single poll and wait for the started syncs instead of looping.
    #[arg(long)]
    pub once: bool,

    /// Sync one source now, due or not.
    #[arg(long, conflicts_with = "once")]
    pub source: Option<String>,

    /// First chapter number to fetch (default 1 when `--end` is given).
    #[arg(long, requires = "source")]
    pub start: Option<u32>,

    /// Last chapter number to fetch, inclusive.
    #[arg(long, requires = "source")]
    pub end: Option<u32>,

    /// Refetch every chapter the novel does not have yet.
    #[arg(long, requires = "source", conflicts_with_all = ["start", "end"])]
    pub full: bool,
}
