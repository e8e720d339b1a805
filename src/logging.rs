use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::env_bool;

const LOG_FILE_PREFIX: &str = "lms-backend.log";

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLogSettings {
    pub dir: PathBuf,
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl LogRotation {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Self::Hourly,
            "never" => Self::Never,
            _ => Self::Daily,
        }
    }

    fn as_rotation(self) -> Rotation {
        match self {
            Self::Hourly => Rotation::HOURLY,
            Self::Daily => Rotation::DAILY,
            Self::Never => Rotation::NEVER,
        }
    }
}

impl FileLogSettings {
    /// `None` unless `ENABLE_FILE_LOGS` is truthy.
    pub fn from_env() -> Option<Self> {
        if !env_bool("ENABLE_FILE_LOGS").unwrap_or(false) {
            return None;
        }

        let dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
        let rotation = std::env::var("LOG_ROTATION")
            .map(|value| LogRotation::parse(&value))
            .unwrap_or(LogRotation::Daily);

        Some(Self {
            dir: PathBuf::from(dir),
            rotation,
        })
    }
}

pub fn init_tracing(log_level: &str) -> Option<FileLogGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(true);

    if let Some(settings) = FileLogSettings::from_env() {
        match std::fs::create_dir_all(&settings.dir) {
            Ok(()) => {
                let file_appender = RollingFileAppender::new(
                    settings.rotation.as_rotation(),
                    &settings.dir,
                    LOG_FILE_PREFIX,
                );
                let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
                let file_layer = fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(true);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(stdout_layer)
                    .with(file_layer)
                    .init();

                return Some(FileLogGuard { _guard: guard });
            }
            Err(err) => {
                eprintln!(
                    "failed to create log directory {}: {err}",
                    settings.dir.display()
                );
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();

    None
}
