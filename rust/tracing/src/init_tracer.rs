use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt;
use tracing_subscriber::Registry;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtelFilterLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for OtelFilterLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtelFilterLevel::Trace => f.write_str("trace"),
            OtelFilterLevel::Debug => f.write_str("debug"),
            OtelFilterLevel::Info => f.write_str("info"),
            OtelFilterLevel::Warn => f.write_str("warn"),
            OtelFilterLevel::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtelFilter {
    pub crate_name: String,
    pub filter_level: OtelFilterLevel,
}

pub fn init_global_filter_layer(
    custom_filters: &[OtelFilter],
) -> Box<dyn Layer<Registry> + Send + Sync> {
    // Crate names use underscores since that is how they appear as targets.
    let default_crate_names = ["vecindex", "vecindex_distance", "vecindex_tracing"];

    let global_filter = format!(
        "error,{default_filters},{additional_custom_filters}",
        default_filters = default_crate_names
            .iter()
            .map(|s| format!("{s}=info"))
            .collect::<Vec<_>>()
            .join(","),
        additional_custom_filters = custom_filters
            .iter()
            .map(|custom_filter| {
                format!(
                    "{}={}",
                    custom_filter.crate_name, custom_filter.filter_level
                )
            })
            .collect::<Vec<String>>()
            .join(","),
    );

    EnvFilter::new(std::env::var("RUST_LOG").unwrap_or(global_filter)).boxed()
}

pub fn init_stdout_layer() -> Box<dyn Layer<Registry> + Send + Sync> {
    fmt::layer().pretty().with_target(false).boxed()
}

pub fn init_tracing(layers: Vec<Box<dyn Layer<Registry> + Send + Sync>>) {
    let layers = layers
        .into_iter()
        .reduce(|a, b| Box::new(a.and_then(b)))
        .expect("Should be able to create tracing layers");
    let subscriber = tracing_subscriber::registry().with(layers);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Should be able to set global tracing subscriber");
    tracing::info!("Global tracing subscriber set");
}

pub fn init_panic_tracing_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();

        let payload = if let Some(s) = payload.downcast_ref::<&str>() {
            Some(&**s)
        } else {
            payload.downcast_ref::<String>().map(|s| s.as_str())
        };

        tracing::error!(
            panic.payload = payload,
            panic.location = panic_info.location().map(|l| l.to_string()),
            "A panic occurred"
        );

        prev_hook(panic_info);
    }));
}

/// Installs the stdout subscriber used by embedders that do not bring their
/// own tracing setup.
pub fn init_stdout_tracing(custom_filters: &[OtelFilter]) {
    let layers = vec![
        // The global filter applies to all subsequent layers
        init_global_filter_layer(custom_filters),
        init_stdout_layer(),
    ];
    init_tracing(layers);
    init_panic_tracing_hook();
}

/// Best-effort subscriber for tests. Safe to call from every test since a
/// second installation is silently ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
