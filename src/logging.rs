use crate::config::{LogConfig, LogFormat, LogOutput, LogRotation};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid file settings for log output")]
    InvalidFileSettings,
    #[error("failed to open log file: {0}")]
    Appender(String),
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level. The returned guard must be held for the process
/// lifetime when logging to a file.
pub fn init(cfg: &LogConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},relaygate={}", cfg.level, cfg.level)));

    match cfg.output {
        LogOutput::Stdout => {
            install(filter, cfg.format, std::io::stdout)?;
            Ok(None)
        }
        LogOutput::File => {
            let path = cfg
                .file_path
                .as_ref()
                .ok_or(LoggingError::InvalidFileSettings)?;
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let prefix = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or(LoggingError::InvalidFileSettings)?;
            let appender = RollingFileAppender::builder()
                .rotation(rotation(cfg.rotation))
                .filename_prefix(prefix)
                .max_log_files(cfg.max_files)
                .build(directory)
                .map_err(|err| LoggingError::Appender(err.to_string()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            install(filter, cfg.format, writer)?;
            Ok(Some(guard))
        }
    }
}

fn install<W>(filter: EnvFilter, format: LogFormat, writer: W) -> Result<(), LoggingError>
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    result.map_err(|err| LoggingError::Install(err.to_string()))
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

/// The machine's hostname as reported by the OS, for the startup record.
pub fn host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "could not read hostname");
            "unknown".to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_name_comes_from_the_os() {
        let name = host_name();
        assert!(!name.is_empty());
        assert_eq!(name, hostname::get().unwrap().to_string_lossy());
    }
}
