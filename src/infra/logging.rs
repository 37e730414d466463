use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "warn";

/// `SIDECAR_LOG` wins over `RUST_LOG`.
pub fn log_filter_directive() -> Option<String> {
    ["SIDECAR_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

/// The terminal belongs to the UI, so logs go to `<config_dir>/sidecar.log` when a filter is set
/// and nowhere otherwise.
pub fn init_logging(config_dir: &Path) {
    let Some(directive) = log_filter_directive() else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(DEFAULT_LOG_FILTER))
            .with_writer(io::sink)
            .try_init();
        return;
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let file = fs::create_dir_all(config_dir).and_then(|()| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(config_dir.join("sidecar.log"))
    });
    match file {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(_) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::sink)
                .try_init();
        }
    }
}
