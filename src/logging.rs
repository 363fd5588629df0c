use anyhow::Context as _;

/// Used when `RUST_LOG` is unset; keeps HTTP and HTML parser internals quiet.
pub const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn,html5ever=warn,selectors=warn";

pub fn init() -> anyhow::Result<()> {
    init_with_default(DEFAULT_FILTER)
}

pub fn init_with_default(default_filter: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))
        .with_context(|| format!("build log filter from {default_filter:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
