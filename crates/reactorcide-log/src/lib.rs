//! Structured logger (C13).
//!
//! Every other component logs through a [`Logger`] rather than `eprintln!`
//! directly, so the text-vs-JSON and level-filtering decisions live in one
//! place. `LOG_FORMAT` (`text` default, or `json`) and `LOG_LEVEL` (`debug`,
//! `info`, `warning`, `error`, `fatal`; default `info`) select behavior at
//! construction time from the process environment.

use std::io::Write;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

/// Output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Severity, ordered low to high for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Level {
    fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("debug") => Level::Debug,
            Ok("warning") | Ok("warn") => Level::Warning,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

/// A structured error attached to a log line: `error.{type,message}` in JSON
/// mode, `error=Type: msg` in text mode.
#[derive(Debug, Clone)]
pub struct LogError {
    pub error_type: String,
    pub message: String,
}

impl LogError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    timestamp: String,
    level: Level,
    component: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<std::collections::BTreeMap<&'a str, &'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonError<'a>>,
}

#[derive(Serialize)]
struct JsonError<'a> {
    #[serde(rename = "type")]
    error_type: &'a str,
    message: &'a str,
}

/// The logger itself. Holds the resolved format/level and an output sink
/// (defaulting to stderr; injectable for tests). All informational output
/// goes to stderr — the child process's own stdout/stderr streams are never
/// routed through here, only through the masker in `reactorcide-exec`.
pub struct Logger {
    format: LogFormat,
    level: Level,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Logger {
    /// Build a logger from `LOG_FORMAT`/`LOG_LEVEL`, writing to stderr.
    pub fn from_env() -> Self {
        Self {
            format: LogFormat::from_env(),
            level: Level::from_env(),
            sink: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    /// Build a logger with an explicit format/level/sink, for tests.
    pub fn new(format: LogFormat, level: Level, sink: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            level,
            sink: Mutex::new(sink),
        }
    }

    pub fn debug(&self, component: &str, message: &str, fields: &[(&str, &str)]) {
        self.emit(Level::Debug, component, message, fields, None);
    }

    pub fn info(&self, component: &str, message: &str, fields: &[(&str, &str)]) {
        self.emit(Level::Info, component, message, fields, None);
    }

    pub fn warn(&self, component: &str, message: &str, fields: &[(&str, &str)]) {
        self.emit(Level::Warning, component, message, fields, None);
    }

    pub fn error(&self, component: &str, message: &str, fields: &[(&str, &str)], err: Option<LogError>) {
        self.emit(Level::Error, component, message, fields, err);
    }

    pub fn fatal(&self, component: &str, message: &str, fields: &[(&str, &str)], err: Option<LogError>) {
        self.emit(Level::Fatal, component, message, fields, err);
    }

    fn emit(
        &self,
        level: Level,
        component: &str,
        message: &str,
        fields: &[(&str, &str)],
        err: Option<LogError>,
    ) {
        if level < self.level {
            return;
        }

        let line = match self.format {
            LogFormat::Text => render_text(level, component, message, fields, err.as_ref()),
            LogFormat::Json => render_json(level, component, message, fields, err.as_ref()),
        };

        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{line}");
        }
    }
}

fn render_text(
    level: Level,
    component: &str,
    message: &str,
    fields: &[(&str, &str)],
    err: Option<&LogError>,
) -> String {
    let mut line = format!(
        "{} [{}] [{}] {}",
        Utc::now().to_rfc3339(),
        level.as_str().to_uppercase(),
        component,
        message
    );
    for (k, v) in fields {
        line.push_str(&format!(" {k}={v}"));
    }
    if let Some(e) = err {
        line.push_str(&format!(" error={}: {}", e.error_type, e.message));
    }
    line
}

fn render_json(
    level: Level,
    component: &str,
    message: &str,
    fields: &[(&str, &str)],
    err: Option<&LogError>,
) -> String {
    let fields_map = if fields.is_empty() {
        None
    } else {
        Some(fields.iter().copied().collect())
    };

    let line = JsonLine {
        timestamp: Utc::now().to_rfc3339(),
        level,
        component,
        message,
        fields: fields_map,
        error: err.map(|e| JsonError {
            error_type: &e.error_type,
            message: &e.message,
        }),
    };

    serde_json::to_string(&line).unwrap_or_else(|_| message.to_string())
}
