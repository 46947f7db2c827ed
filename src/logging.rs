use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset. The HTML parser logs every
/// tree-builder step at debug level.
pub const DEFAULT_FILTER: &str = "info,html5ever=warn,selectors=warn";

/// Installs the stderr subscriber for both binaries.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
