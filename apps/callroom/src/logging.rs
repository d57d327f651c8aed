use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if INIT.get().is_some() {
        return Ok(());
    }
    inner_init(config)?;
    INIT.set(()).ok();
    Ok(())
}

fn inner_init(config: &LogConfig) -> Result<(), InitError> {
    let filter = match std::env::var("CALLROOM_LOG_FILTER") {
        Ok(custom) => custom,
        Err(_) => default_filter_for(config.level.to_filter(), allow_dependency_traces()),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn allow_dependency_traces() -> bool {
    std::env::var("CALLROOM_TRACE_DEPS")
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
}

// The WebRTC stack logs every packet at trace.
const TRACE_DEP_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "interceptor",
    "rtp",
    "rtcp",
    "stun",
    "turn",
];

fn default_filter_for(level: LevelFilter, dependency_traces: bool) -> String {
    let ours = ["callroom", "media_session", "signaling_store"];
    let mut filter = match level {
        LevelFilter::TRACE | LevelFilter::DEBUG => {
            let level = if level == LevelFilter::TRACE { "trace" } else { "debug" };
            let mut base = String::from("info");
            for target in ours {
                base.push_str(&format!(",{target}={level}"));
            }
            base
        }
        LevelFilter::INFO => "info".to_owned(),
        LevelFilter::WARN => "warn".to_owned(),
        LevelFilter::ERROR => "error".to_owned(),
        LevelFilter::OFF => "off".to_owned(),
    };
    if level >= LevelFilter::INFO && !dependency_traces {
        for target in TRACE_DEP_TARGETS {
            filter.push_str(&format!(",{target}=warn"));
        }
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_raises_only_our_targets() {
        let filter = default_filter_for(LevelFilter::DEBUG, false);
        assert!(filter.starts_with("info,"));
        assert!(filter.contains("media_session=debug"));
        assert!(filter.contains("webrtc_ice=warn"));
    }

    #[test]
    fn dependency_traces_can_be_allowed() {
        let filter = default_filter_for(LevelFilter::TRACE, true);
        assert!(filter.contains("signaling_store=trace"));
        assert!(!filter.contains("webrtc=warn"));
    }

    #[test]
    fn quiet_levels_stay_quiet() {
        assert_eq!(default_filter_for(LevelFilter::WARN, false), "warn");
        assert_eq!(default_filter_for(LevelFilter::ERROR, true), "error");
    }
}
