//! Process lifecycle: logging bootstrap.

/// Initialize logging with tracing_subscriber. The default level comes
/// from `CWSF_LOG_LEVEL`; `--verbose` and `--quiet` override it. The
/// tracing-log bridge routes the `log` macros used across the crate.
pub fn init_logging(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug".to_string()
    } else if quiet {
        "error".to_string()
    } else {
        std::env::var("CWSF_LOG_LEVEL")
            .unwrap_or_else(|_| "info".to_string())
            .to_lowercase()
    };

    let filter = tracing_subscriber::EnvFilter::try_new(format!(
        "{default_level},sqlx=warn,hyper=warn,reqwest=warn"
    ))
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .with_ansi(true)
        .try_init();
}
