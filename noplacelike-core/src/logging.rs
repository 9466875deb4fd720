use tracing_subscriber::EnvFilter;

/// Initialise the global `tracing` subscriber with a standard `fmt` layer.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies to the
/// `noplacelike` crates and `info` to everything else. Safe to call once,
/// at the very start of `main`, before any tracing macro.
pub fn init_tracing(level: &str) {
    let fallback = format!("info,noplacelike={level},tower_http=debug");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| fallback.parse().expect("static filter directive"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
