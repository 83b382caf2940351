pub mod config;
pub mod db;
pub mod drivers;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod slots;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter. `format` is "json" for
/// one JSON object per line, anything else gives human-readable text.
pub fn init_tracing(filter: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let installed = if format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("tracing already initialized: {}", e);
    }
}
