//! Process-wide logging bootstrap.
//!
//! # Responsibility
//! - Start the rolling file logger once per process.
//! - Capture panics as sanitized, length-capped log events.
//!
//! # Invariants
//! - Re-initializing with the same level and directory is a no-op.
//! - Re-initializing with a different level or directory is rejected.
//! - Initialization never panics.
//! - Log lines carry metadata only (sizes, counts, hash prefixes), never
//!   ingested content.

use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::{error, info};
use once_cell::sync::OnceCell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "atomgrid";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;
const MAX_PANIC_PAYLOAD_CHARS: usize = 160;

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();
static PANIC_HOOK_INSTALLED: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(value: &str) -> Result<Self, LoggingError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(LoggingError::UnsupportedLevel(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// `debug` in debug builds, `info` in release builds.
pub fn default_log_level() -> LogLevel {
    if cfg!(debug_assertions) {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

#[derive(Debug)]
pub enum LoggingError {
    UnsupportedLevel(String),
    /// Directory is empty or relative.
    InvalidDirectory(String),
    CreateDirectory { path: PathBuf, source: std::io::Error },
    Backend(String),
    /// Logging is already running with another level or directory.
    Conflict { active: String, requested: String },
}

impl Display for LoggingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedLevel(level) => write!(
                f,
                "unsupported log level `{level}`; expected trace|debug|info|warn|error"
            ),
            Self::InvalidDirectory(reason) => write!(f, "invalid log directory: {reason}"),
            Self::CreateDirectory { path, source } => {
                write!(f, "failed to create log directory `{}`: {source}", path.display())
            }
            Self::Backend(reason) => write!(f, "failed to start logger: {reason}"),
            Self::Conflict { active, requested } => write!(
                f,
                "logging already initialized with {active}; refusing to switch to {requested}"
            ),
        }
    }
}

impl Error for LoggingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CreateDirectory { source, .. } => Some(source),
            _ => None,
        }
    }
}

struct LoggingState {
    level: LogLevel,
    log_dir: PathBuf,
    _logger: LoggerHandle,
}

impl LoggingState {
    fn check_matches(&self, level: LogLevel, log_dir: &Path) -> Result<(), LoggingError> {
        if self.log_dir != log_dir {
            return Err(LoggingError::Conflict {
                active: format!("directory `{}`", self.log_dir.display()),
                requested: format!("`{}`", log_dir.display()),
            });
        }
        if self.level != level {
            return Err(LoggingError::Conflict {
                active: format!("level `{}`", self.level.as_str()),
                requested: format!("`{}`", level.as_str()),
            });
        }
        Ok(())
    }
}

/// Starts rolling file logging (`atomgrid.log`, 10 MiB per file, 5 kept).
///
/// # Errors
/// - `UnsupportedLevel` / `InvalidDirectory` for bad arguments.
/// - `Conflict` when already running with other settings.
/// - `CreateDirectory` / `Backend` when the backend cannot start.
pub fn init_logging(level: &str, log_dir: impl AsRef<Path>) -> Result<(), LoggingError> {
    let level = LogLevel::parse(level)?;
    let log_dir = normalize_log_dir(log_dir.as_ref())?;

    if let Some(state) = LOGGING_STATE.get() {
        return state.check_matches(level, &log_dir);
    }

    let state = LOGGING_STATE.get_or_try_init(|| start_backend(level, &log_dir))?;
    state.check_matches(level, &log_dir)
}

fn start_backend(level: LogLevel, log_dir: &Path) -> Result<LoggingState, LoggingError> {
    std::fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateDirectory {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let logger = Logger::try_with_str(level.as_str())
        .map_err(|err| LoggingError::Backend(err.to_string()))?
        .log_to_file(
            FileSpec::default()
                .directory(log_dir)
                .basename(LOG_FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(MAX_LOG_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(|err| LoggingError::Backend(err.to_string()))?;

    install_panic_hook_once();

    info!(
        "event=app_start module=core status=ok platform={} build_mode={} version={}",
        std::env::consts::OS,
        if cfg!(debug_assertions) { "debug" } else { "release" },
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "event=core_init module=logging status=ok level={} log_dir={}",
        level.as_str(),
        log_dir.display()
    );

    Ok(LoggingState {
        level,
        log_dir: log_dir.to_path_buf(),
        _logger: logger,
    })
}

/// Active `(level, directory)`, or `None` before initialization.
pub fn logging_status() -> Option<(LogLevel, PathBuf)> {
    LOGGING_STATE
        .get()
        .map(|state| (state.level, state.log_dir.clone()))
}

fn normalize_log_dir(log_dir: &Path) -> Result<PathBuf, LoggingError> {
    let raw = log_dir.to_string_lossy();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LoggingError::InvalidDirectory("path is empty".to_string()));
    }
    let path = Path::new(trimmed);
    if !path.is_absolute() {
        return Err(LoggingError::InvalidDirectory(format!(
            "`{trimmed}` is not absolute"
        )));
    }
    Ok(path.to_path_buf())
}

fn install_panic_hook_once() {
    if PANIC_HOOK_INSTALLED.set(()).is_err() {
        return;
    }

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = if let Some(message) = panic_info.payload().downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = panic_info.payload().downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        error!(
            "event=panic_captured module=core status=error location={location} payload={}",
            sanitize_message(&payload, MAX_PANIC_PAYLOAD_CHARS)
        );
        previous_hook(panic_info);
    }));
}

/// Flattens newlines and caps the message at `max_chars` characters.
fn sanitize_message(value: &str, max_chars: usize) -> String {
    let flattened = value.replace(['\n', '\r'], " ");
    let mut capped: String = flattened.chars().take(max_chars).collect();
    if flattened.chars().count() > max_chars {
        capped.push_str("...");
    }
    capped
}

#[cfg(test)]
mod tests {
    use super::{init_logging, logging_status, sanitize_message, LogLevel, LoggingError};

    #[test]
    fn level_parsing_accepts_aliases_and_rejects_unknown() {
        assert_eq!(LogLevel::parse(" WARNING ").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::parse("info").unwrap().as_str(), "info");
        assert!(matches!(
            LogLevel::parse("verbose"),
            Err(LoggingError::UnsupportedLevel(_))
        ));
    }

    #[test]
    fn relative_directories_are_rejected() {
        let err = init_logging("info", "logs/dev").unwrap_err();
        assert!(matches!(err, LoggingError::InvalidDirectory(_)));
    }

    #[test]
    fn sanitize_flattens_and_caps() {
        let sanitized = sanitize_message("line1\nline2\rline3", 8);
        assert!(!sanitized.contains('\n'));
        assert!(!sanitized.contains('\r'));
        assert!(sanitized.ends_with("..."));
    }

    #[test]
    fn init_is_idempotent_and_rejects_conflicts() {
        let dir = tempfile::Builder::new()
            .prefix("atomgrid-logging-")
            .tempdir()
            .unwrap();
        let other = tempfile::Builder::new()
            .prefix("atomgrid-logging-other-")
            .tempdir()
            .unwrap();

        init_logging("info", dir.path()).unwrap();
        init_logging("info", dir.path()).unwrap();
        assert!(matches!(
            init_logging("debug", dir.path()),
            Err(LoggingError::Conflict { .. })
        ));
        assert!(matches!(
            init_logging("info", other.path()),
            Err(LoggingError::Conflict { .. })
        ));

        let (level, active_dir) = logging_status().unwrap();
        assert_eq!(level, LogLevel::Info);
        assert_eq!(active_dir, dir.path());
    }
}
