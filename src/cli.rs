use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::model::Frequency;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// YAML config file (PAGEWATCH_* environment variables override it).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage monitored pages.
    Page {
        #[command(subcommand)]
        command: PageCommand,
    },
    /// Check one page now and print the outcome.
    Check(CheckArgs),
    /// Print the recorded changes of a page.
    Changes(HistoryArgs),
    /// Print the downloaded files of a page.
    Files(HistoryArgs),
    /// Run the scheduler until interrupted.
    Watch,
}

#[derive(Debug, Subcommand)]
pub enum PageCommand {
    Add(PageAddArgs),
    List,
    Show(PageIdArgs),
    Update(PageUpdateArgs),
    Remove(PageIdArgs),
}

#[derive(Debug, Args)]
pub struct PageAddArgs {
    /// Page URL (must be http/https).
    #[arg(long)]
    pub url: String,

    /// Human readable name (also names the download directory).
    #[arg(long)]
    pub name: Option<String>,

    /// CSS selector restricting which part of the page is compared.
    #[arg(long)]
    pub selector: Option<String>,

    /// 5_minutes, 15_minutes, 30_minutes, hourly, daily or weekly.
    #[arg(long, default_value = "hourly")]
    pub frequency: Frequency,

    /// Register the page without scheduling it.
    #[arg(long)]
    pub inactive: bool,
}

#[derive(Debug, Args)]
pub struct PageIdArgs {
    #[arg(long)]
    pub id: u64,
}

#[derive(Debug, Args)]
pub struct PageUpdateArgs {
    #[arg(long)]
    pub id: u64,

    #[arg(long)]
    pub url: Option<String>,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long, conflicts_with = "clear_selector")]
    pub selector: Option<String>,

    /// Compare the whole page again.
    #[arg(long)]
    pub clear_selector: bool,

    #[arg(long)]
    pub frequency: Option<Frequency>,

    /// true or false.
    #[arg(long)]
    pub active: Option<bool>,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Page id.
    #[arg(long)]
    pub id: u64,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    pub page_id: u64,
}
