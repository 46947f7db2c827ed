use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use crate::cli::{HistoryArgs, PageAddArgs, PageIdArgs, PageUpdateArgs};
use crate::config::Config;
use crate::model::{NewPage, PageUpdate};
use crate::store::{JsonStore, Store, StoreError};

pub async fn open_store(config: &Config) -> anyhow::Result<Arc<JsonStore>> {
    let path = JsonStore::default_path(&config.data_dir);
    let store = JsonStore::open(&path)
        .await
        .with_context(|| format!("open store: {}", path.display()))?;
    Ok(Arc::new(store))
}

pub async fn add(config: &Config, args: PageAddArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let page = store
        .create_page(NewPage {
            name: args.name,
            url: args.url,
            css_selector: args.selector,
            frequency: args.frequency,
            is_active: !args.inactive,
        })
        .await
        .context("create page")?;
    tracing::info!(page_id = page.id, url = %page.url, "page registered");
    print_json_lines([&page])
}

pub async fn list(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let pages = store.list_pages().await.context("list pages")?;
    print_json_lines(&pages)
}

pub async fn show(config: &Config, args: PageIdArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let page = store
        .get_page(args.id)
        .await
        .context("load page")?
        .ok_or(StoreError::PageNotFound(args.id))?;
    print_json_lines([&page])
}

pub async fn update(config: &Config, args: PageUpdateArgs) -> anyhow::Result<()> {
    let css_selector = if args.clear_selector {
        Some(None)
    } else {
        args.selector.map(Some)
    };
    let update = PageUpdate {
        name: args.name,
        url: args.url,
        css_selector,
        frequency: args.frequency,
        is_active: args.active,
    };

    let store = open_store(config).await?;
    let page = store
        .update_page(args.id, update)
        .await
        .context("update page")?;
    print_json_lines([&page])
}

pub async fn remove(config: &Config, args: PageIdArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let page = store.delete_page(args.id).await.context("delete page")?;
    tracing::info!(page_id = page.id, url = %page.url, "page removed with its changes and files");
    Ok(())
}

pub async fn changes(config: &Config, args: HistoryArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let changes = store
        .list_changes(args.page_id)
        .await
        .context("list changes")?;
    print_json_lines(&changes)
}

pub async fn files(config: &Config, args: HistoryArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let files = store.list_files(args.page_id).await.context("list files")?;
    print_json_lines(&files)
}

pub fn print_json_lines<T: Serialize>(items: impl IntoIterator<Item = T>) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for item in items {
        serde_json::to_writer(&mut out, &item).context("write json")?;
        out.write_all(b"\n").context("write newline")?;
    }
    out.flush().context("flush stdout")?;
    Ok(())
}
