//! Relay for kernel server output
//!
//! The kernel server writes records as `field|LEVEL|message`. Recognized
//! records are re-emitted under the `backend` tracing target at the mapped
//! level. Anything else (tracebacks, banners) is forwarded as a warning.

use tracing::{debug, error, info, warn};

/// Tracing target used for all kernel server output
pub const BACKEND_TARGET: &str = "backend";

/// Severity vocabulary of the kernel server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl BackendLevel {
    fn parse(level: &str) -> Option<Self> {
        match level {
            "DEBUG" => Some(BackendLevel::Debug),
            "INFO" => Some(BackendLevel::Info),
            "WARNING" => Some(BackendLevel::Warning),
            "ERROR" => Some(BackendLevel::Error),
            "CRITICAL" => Some(BackendLevel::Critical),
            _ => None,
        }
    }

    /// Level the record is emitted at
    pub fn tracing_level(&self) -> tracing::Level {
        match self {
            BackendLevel::Debug => tracing::Level::DEBUG,
            BackendLevel::Info => tracing::Level::INFO,
            BackendLevel::Warning => tracing::Level::WARN,
            BackendLevel::Error | BackendLevel::Critical => tracing::Level::ERROR,
        }
    }
}

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One parsed line of kernel server output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord<'a> {
    /// A `field|LEVEL|message` record
    Structured {
        field: &'a str,
        level: BackendLevel,
        message: &'a str,
    },
    /// Anything that does not follow the record format
    FreeForm(&'a str),
}

impl<'a> LogRecord<'a> {
    pub fn parse(line: &'a str) -> Self {
        let mut parts = line.splitn(3, '|');
        if let (Some(field), Some(level), Some(message)) = (parts.next(), parts.next(), parts.next()) {
            if let Some(level) = BackendLevel::parse(level.trim()) {
                return LogRecord::Structured {
                    field: field.trim(),
                    level,
                    message: message.trim(),
                };
            }
        }
        LogRecord::FreeForm(line)
    }

    /// Level the record is emitted at
    pub fn level(&self) -> tracing::Level {
        match self {
            LogRecord::Structured { level, .. } => level.tracing_level(),
            LogRecord::FreeForm(_) => tracing::Level::WARN,
        }
    }
}

/// Forward one output line of the kernel server to the log
pub fn relay_line(stream: OutputStream, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }

    let stream = stream.as_str();
    match LogRecord::parse(line) {
        LogRecord::Structured { field, level, message } => match level {
            BackendLevel::Debug => debug!(target: BACKEND_TARGET, stream, field, "{}", message),
            BackendLevel::Info => info!(target: BACKEND_TARGET, stream, field, "{}", message),
            BackendLevel::Warning => warn!(target: BACKEND_TARGET, stream, field, "{}", message),
            BackendLevel::Error | BackendLevel::Critical => {
                error!(target: BACKEND_TARGET, stream, field, "{}", message)
            }
        },
        LogRecord::FreeForm(text) => warn!(target: BACKEND_TARGET, stream, "{}", text),
    }
}
