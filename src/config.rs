use std::path::PathBuf;

pub const ENV_LOG: &str = "CAMPUSD_LOG";
pub const ENV_LOG_FORMAT: &str = "CAMPUSD_LOG_FORMAT";
pub const ENV_WORKSPACE: &str = "CAMPUSD_WORKSPACE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub log_format: LogFormat,
    pub workspace: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_filter = lookup(ENV_LOG)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "info".to_string());
        let log_format = match lookup(ENV_LOG_FORMAT)
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let workspace = lookup(ENV_WORKSPACE)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        Self {
            log_filter,
            log_format,
            workspace,
        }
    }
}

/// Logs go to stderr; stdout carries the IPC responses.
pub fn init_logging(cfg: &DaemonConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&cfg.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    let res = match cfg.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if let Err(e) = res {
        eprintln!("campusd: logging already initialised: {e}");
    }
}
