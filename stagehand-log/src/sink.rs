//! Log sinks.

use crate::{Format, Level, LogConfig};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

/// A single log event handed to a sink.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub level: Level,
    pub target: &'a str,
    pub message: &'a str,
}

/// Destination for log output.
///
/// Install one with [`crate::set_sink`] to forward Stagehand logs into the
/// host application's logger.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &Record<'_>);
}

/// Default sink writing formatted lines to stderr.
#[derive(Debug, Clone)]
pub struct StderrSink {
    format: Format,
    #[cfg_attr(not(feature = "color"), allow(dead_code))]
    color: bool,
    timestamps: bool,
    module_path: bool,
}

impl StderrSink {
    pub fn from_config(config: &LogConfig) -> Self {
        Self {
            format: config.format,
            color: config.color,
            timestamps: config.timestamps,
            module_path: config.module_path,
        }
    }

    fn write_pretty(&self, record: &Record<'_>) {
        let mut stderr = std::io::stderr().lock();

        if self.timestamps {
            let now = chrono::Local::now();
            let _ = write!(stderr, "{} ", now.format("%Y-%m-%d %H:%M:%S%.3f"));
        }

        #[cfg(feature = "color")]
        if self.color {
            let _ = write!(stderr, "{:5} ", record.level.colored());
        } else {
            let _ = write!(stderr, "{:5} ", record.level.as_str());
        }

        #[cfg(not(feature = "color"))]
        let _ = write!(stderr, "{:5} ", record.level.as_str());

        if self.module_path && !record.target.is_empty() {
            let _ = write!(stderr, "[{}] ", record.target);
        }

        let _ = writeln!(stderr, "{}", record.message);
    }

    fn write_compact(&self, record: &Record<'_>) {
        let mut stderr = std::io::stderr().lock();

        if self.timestamps {
            let now = chrono::Local::now();
            let _ = write!(stderr, "{} ", now.format("%H:%M:%S"));
        }

        let initial = record.level.as_str().chars().next().unwrap_or('?');
        let _ = write!(stderr, "{} ", initial);

        if self.module_path && !record.target.is_empty() {
            let _ = write!(stderr, "{}: ", record.target);
        }

        let _ = writeln!(stderr, "{}", record.message);
    }
}

impl LogSink for StderrSink {
    fn write(&self, record: &Record<'_>) {
        match self.format {
            Format::Pretty => self.write_pretty(record),
            Format::Compact => self.write_compact(record),
            Format::Json => eprintln!("{}", json_line(record)),
        }
    }
}

#[cfg(feature = "json")]
fn json_line(record: &Record<'_>) -> String {
    use serde::Serialize;

    #[derive(Serialize)]
    struct Entry<'a> {
        timestamp: String,
        level: &'a str,
        target: &'a str,
        message: &'a str,
    }

    let entry = Entry {
        timestamp: chrono::Utc::now().to_rfc3339(),
        level: record.level.as_str(),
        target: record.target,
        message: record.message,
    };

    serde_json::to_string(&entry).unwrap_or_default()
}

#[cfg(not(feature = "json"))]
fn json_line(record: &Record<'_>) -> String {
    format!(
        r#"{{"timestamp":"{}","level":"{}","target":"{}","message":"{}"}}"#,
        chrono::Utc::now().to_rfc3339(),
        record.level.as_str(),
        escape_json(record.target),
        escape_json(record.message)
    )
}

#[cfg(not(feature = "json"))]
fn escape_json(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            c if c.is_control() => result.push_str(&format!("\\u{:04x}", c as u32)),
            c => result.push(c),
        }
    }
    result
}

/// Sink forwarding `(level, message)` to a closure.
///
/// Matches the shape of a host framework's `log(level, message)` function.
/// The target is prefixed to the message in brackets.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(Level, &str) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> LogSink for FnSink<F>
where
    F: Fn(Level, &str) + Send + Sync,
{
    fn write(&self, record: &Record<'_>) {
        if record.target.is_empty() {
            (self.f)(record.level, record.message);
        } else {
            (self.f)(
                record.level,
                &format!("[{}] {}", record.target, record.message),
            );
        }
    }
}

/// An owned copy of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// Sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    records: Arc<Mutex<Vec<CapturedRecord>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CapturedRecord> {
        self.records.lock().clone()
    }

    /// Whether any record at `level` contains `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for CaptureSink {
    fn write(&self, record: &Record<'_>) {
        self.records.lock().push(CapturedRecord {
            level: record.level,
            target: record.target.to_string(),
            message: record.message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reset_sink, set_sink};

    #[test]
    fn test_capture_sink_receives_macro_output() {
        let capture = CaptureSink::new();
        set_sink(Arc::new(capture.clone()));

        crate::warn!("queue {} has no workers", "Reports");
        crate::error!(target: "stagehand::test", "close failed");

        reset_sink();

        assert!(capture.contains(Level::Warn, "queue Reports has no workers"));
        assert!(
            capture
                .records()
                .iter()
                .any(|r| r.target == "stagehand::test" && r.level == Level::Error)
        );
    }

    #[test]
    fn test_fn_sink_prefixes_target() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_sink = seen.clone();
        let sink = FnSink::new(move |level: Level, message: &str| {
            seen_in_sink.lock().push((level, message.to_string()));
        });

        sink.write(&Record {
            level: Level::Info,
            target: "stagehand::worker",
            message: "started",
        });
        sink.write(&Record {
            level: Level::Warn,
            target: "",
            message: "bare",
        });

        let seen = seen.lock();
        assert_eq!(seen[0], (Level::Info, "[stagehand::worker] started".to_string()));
        assert_eq!(seen[1], (Level::Warn, "bare".to_string()));
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_line_is_valid_json() {
        let line = json_line(&Record {
            level: Level::Error,
            target: "t",
            message: "quote \" inside",
        });
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "ERROR");
        assert_eq!(value["message"], "quote \" inside");
    }
}
