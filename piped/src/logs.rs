//! Logging configuration

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::errors::PipedError;

/// Log level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_filter_string(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

impl serde::Serialize for LogLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_filter_string())
    }
}

impl<'de> serde::Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level
    pub log_level: LogLevel,

    /// Write logs to stdout
    pub stdout: bool,

    /// Directory for rolling log files, disabled when `None`
    pub log_dir: Option<PathBuf>,

    /// Enable JSON format
    pub json_format: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            stdout: true,
            log_dir: None,
            json_format: false,
        }
    }
}

const LOG_FILE_PREFIX: &str = "piped.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging.
///
/// The returned guard must be held for as long as the file writer should keep flushing.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>, PipedError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.to_filter_string()));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if options.stdout {
        if options.json_format {
            layers.push(fmt::layer().json().boxed());
        } else {
            layers.push(fmt::layer().boxed());
        }
    }

    if let Some(dir) = &options.log_dir {
        let (layer, file_guard) = file_layer(dir, options.json_format);
        layers.push(layer);
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| PipedError::Config(e.to_string()))?;

    Ok(guard)
}

/// Daily rolled `piped.log.YYYY-MM-DD` files under `dir`, written off the calling thread
fn file_layer(dir: &Path, json_format: bool) -> (BoxedLayer, WorkerGuard) {
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer().with_writer(writer).with_ansi(false);
    if json_format {
        (layer.json().boxed(), guard)
    } else {
        (layer.boxed(), guard)
    }
}

/// Sink for user-facing log lines of a deployment stage or a one-off job
pub trait StageLogWriter: Send + Sync {
    fn info(&self, message: &str);

    fn success(&self, message: &str);

    fn error(&self, message: &str);
}

/// Writes stage-style log lines to the process log only
#[derive(Debug, Clone, Default)]
pub struct TracingLogWriter {
    scope: String,
}

impl TracingLogWriter {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }
}

impl StageLogWriter for TracingLogWriter {
    fn info(&self, message: &str) {
        tracing::info!(scope = %self.scope, "{}", message);
    }

    fn success(&self, message: &str) {
        tracing::info!(scope = %self.scope, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(scope = %self.scope, "{}", message);
    }
}

/// Run `cmd` to completion, writing every stdout/stderr line to `lw` as it
/// arrives. Returns the exit status and the captured stdout followed by stderr.
///
/// The child is killed when the returned future is dropped.
pub async fn stream_command(
    cmd: &mut tokio::process::Command,
    lw: &dyn StageLogWriter,
) -> Result<(std::process::ExitStatus, String), PipedError> {
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

    async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, lw: &dyn StageLogWriter) -> String {
        let mut captured = String::new();
        let Some(reader) = reader else {
            return captured;
        };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            lw.info(&line);
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let (stdout, stderr) = tokio::join!(pump(child.stdout.take(), lw), pump(child.stderr.take(), lw));
    let status = child.wait().await?;
    Ok((status, stdout + &stderr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_level_serde() {
        let level: LogLevel = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(level, LogLevel::Error);
        assert_eq!(serde_json::to_string(&LogLevel::Trace).unwrap(), "\"trace\"");
    }

    fn written_logs(dir: &Path) -> String {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(LOG_FILE_PREFIX))
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect()
    }

    #[test]
    fn test_file_layer_writes_into_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (layer, guard) = file_layer(dir.path(), false);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(attempt = 3, "Planned deployment dep-1");
        });
        // Dropping the guard flushes the background writer
        drop(guard);

        let logs = written_logs(dir.path());
        assert!(logs.contains("Planned deployment dep-1"), "{}", logs);
        assert!(logs.contains("attempt=3"), "{}", logs);
        assert!(!logs.contains('\u{1b}'));
    }

    #[test]
    fn test_file_layer_json() {
        let dir = tempfile::tempdir().unwrap();
        let (layer, guard) = file_layer(dir.path(), true);
        tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
            tracing::warn!("Unable to reach the control plane");
        });
        drop(guard);

        let logs = written_logs(dir.path());
        let line: serde_json::Value = serde_json::from_str(logs.lines().next().unwrap()).unwrap();
        assert_eq!(line["level"], "WARN");
        assert_eq!(line["fields"]["message"], "Unable to reach the control plane");
    }
}
