use std::sync::Arc;

use anyhow::Context as _;

use crate::app::dispatcher::{InProcessJobDispatcher, JobDispatcher};
use crate::app::queue::InProcessQueue;
use crate::app::runner::CheckRunner;
use crate::app::scheduler::Scheduler;
use crate::cli::CheckArgs;
use crate::config::Config;
use crate::pages::{open_store, print_json_lines};
use crate::store::Store;

/// Everything needed to run checks in this process.
pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub runner: Arc<CheckRunner>,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub scheduler: Arc<Scheduler>,
}

impl Runtime {
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = open_store(config).await?;
        let runner = Arc::new(
            CheckRunner::from_config(config, Arc::clone(&store)).context("build check runner")?,
        );
        let dispatcher: Arc<dyn JobDispatcher> = Arc::new(InProcessJobDispatcher::new(
            InProcessQueue::new(config.max_concurrent_checks),
            Arc::clone(&runner),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            config.tick_interval(),
        ));
        Ok(Self {
            store,
            runner,
            dispatcher,
            scheduler,
        })
    }
}

pub async fn check(config: &Config, args: CheckArgs) -> anyhow::Result<()> {
    let runtime = Runtime::from_config(config).await?;
    let outcome = runtime
        .runner
        .check_page(args.id)
        .await
        .with_context(|| format!("check page {}", args.id))?;
    print_json_lines([&outcome])
}

pub async fn watch(config: &Config) -> anyhow::Result<()> {
    let runtime = Runtime::from_config(config).await?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        download_dir = %config.download_dir().display(),
        "watching pages"
    );
    runtime.scheduler.run(shutdown_signal()).await;
    Ok(())
}

pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
