use tracing_subscriber::EnvFilter;

#[derive(clap::Args, Debug, Clone, Default)]
#[group()]
pub struct LoggingArgs {
    /// Enable debug mode.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

impl LoggingArgs {
    pub fn init(&self) {
        init_logging(self.json_logs, self.debug);
    }
}

/// Default filter directive; `RUST_LOG` takes precedence when set.
fn default_directive(debug_mode: bool) -> &'static str {
    if debug_mode {
        "fdroid_swh=debug,info"
    } else {
        "info"
    }
}

pub fn init_logging(json_logs: bool, debug_mode: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_mode)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = if json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
