use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use pagewatch::cli::{Command, PageCommand};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    pagewatch::logging::init().context("init logging")?;

    let cli = pagewatch::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = pagewatch::config::Config::load(cli.config.as_deref()).context("load config")?;
    tracing::debug!(?config, "loaded config");

    match cli.command {
        Command::Page {
            command: PageCommand::Add(args),
        } => {
            pagewatch::pages::add(&config, args)
                .await
                .context("page add")?;
        }
        Command::Page {
            command: PageCommand::List,
        } => {
            pagewatch::pages::list(&config).await.context("page list")?;
        }
        Command::Page {
            command: PageCommand::Show(args),
        } => {
            pagewatch::pages::show(&config, args)
                .await
                .context("page show")?;
        }
        Command::Page {
            command: PageCommand::Update(args),
        } => {
            pagewatch::pages::update(&config, args)
                .await
                .context("page update")?;
        }
        Command::Page {
            command: PageCommand::Remove(args),
        } => {
            pagewatch::pages::remove(&config, args)
                .await
                .context("page remove")?;
        }
        Command::Check(args) => {
            pagewatch::watch::check(&config, args)
                .await
                .context("check")?;
        }
        Command::Changes(args) => {
            pagewatch::pages::changes(&config, args)
                .await
                .context("changes")?;
        }
        Command::Files(args) => {
            pagewatch::pages::files(&config, args)
                .await
                .context("files")?;
        }
        Command::Watch => {
            pagewatch::watch::watch(&config).await.context("watch")?;
        }
    }

    Ok(())
}
