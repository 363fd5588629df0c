use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use novelingest::cli::{Cli, Command};
use novelingest::commands::{self, Runtime};
use novelingest::config::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    novelingest::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let runtime = || -> anyhow::Result<Runtime> {
        let mut settings = Settings::load(cli.config.as_deref()).context("load settings")?;
        if let Some(data_dir) = &cli.data_dir {
            settings.data_dir = data_dir.clone();
        }
        Runtime::from_settings(settings).context("build runtime")
    };

    match cli.command {
        Command::Parse(args) => commands::parse(args).context("parse")?,
        Command::Import(args) => commands::import(&runtime()?, args)
            .await
            .context("import")?,
        Command::AudioComplete(args) => commands::audio_complete(&runtime()?, args)
            .await
            .context("audio-complete")?,
        Command::AudioFailed(args) => commands::audio_failed(&runtime()?, args)
            .await
            .context("audio-failed")?,
        Command::Cancel(args) => commands::cancel(&runtime()?, args).await.context("cancel")?,
        Command::Job(args) => commands::job(&runtime()?, args).await.context("job")?,
        Command::Source { command } => commands::source(&runtime()?, command)
            .await
            .context("source")?,
        Command::Sync(args) => commands::sync(&runtime()?, args).await.context("sync")?,
        Command::Sweep => commands::sweep(&runtime()?).await.context("sweep")?,
    }

    Ok(())
}
