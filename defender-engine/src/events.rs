//! Audit log: one record per blocked or logged request.
//!
//! The native line layout is a stable contract with downstream parsers;
//! change it and their field offsets break. The JSON form mirrors the
//! same data for consumers that prefer structure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use tracing::info;

use crate::config::{LogFormat, MatchLogConfig};
use crate::error::{DefenderError, Result};

/// One matched-rule fragment within a request
#[derive(Debug, Clone, Serialize)]
pub struct MatchedRule {
    pub zone: String,
    pub rule_id: u32,
    pub var_name: String,
    pub content: String,
}

/// Audit record for a scanned request that matched at least one rule
#[derive(Debug, Clone, Serialize)]
pub struct MatchEvent {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub uri: String,
    pub learning: bool,
    pub blocked: bool,
    pub dropped: bool,
    /// Final per-tag totals, sorted by tag for stable output
    pub scores: Vec<(String, i32)>,
    pub matched: Vec<MatchedRule>,
}

impl MatchEvent {
    /// Stable Naxsi-style line: `zone|id|var_name=…|content=…` fragments
    /// joined by `&`, then the request metadata.
    pub fn format_native(&self) -> String {
        let mut line = String::new();

        for (i, m) in self.matched.iter().enumerate() {
            if i > 0 {
                line.push('&');
            }
            line.push_str(&format!(
                "{}|{}|var_name={}|content={}",
                m.zone, m.rule_id, m.var_name, m.content
            ));
        }

        let scores = self
            .scores
            .iter()
            .map(|(tag, total)| format!("{tag}:{total}"))
            .collect::<Vec<_>>()
            .join(",");

        line.push_str(&format!(
            "&ip={}&uri={}&learning={}&block={}&drop={}&scores={}",
            self.client_ip,
            self.uri,
            self.learning as u8,
            self.blocked as u8,
            self.dropped as u8,
            scores
        ));

        line
    }
}

enum LogSink {
    File(std::fs::File),
    Pipe {
        stdin: std::process::ChildStdin,
        // keeps the piped process alive for the log's lifetime
        _child: Child,
    },
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            LogSink::File(f) => f.write(buf),
            LogSink::Pipe { stdin, .. } => stdin.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            LogSink::File(f) => f.flush(),
            LogSink::Pipe { stdin, .. } => stdin.flush(),
        }
    }
}

/// Append-only match log; a leading `|` in the path spawns a pipe target
pub struct MatchLog {
    sink: Mutex<LogSink>,
    format: LogFormat,
}

impl MatchLog {
    /// Open the configured destination. Failure here is a fatal
    /// configuration error, not something to limp past.
    pub fn open(config: &MatchLogConfig) -> Result<Option<Self>> {
        let path = match &config.path {
            Some(path) => path,
            None => return Ok(None),
        };

        let sink = if let Some(command) = path.strip_prefix('|') {
            let mut child = Command::new("/bin/sh")
                .arg("-c")
                .arg(command)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|e| {
                    DefenderError::Config(format!("Failed to open match log pipe {command}: {e}"))
                })?;
            let stdin = child.stdin.take().ok_or_else(|| {
                DefenderError::Config(format!("Match log pipe {command} has no stdin"))
            })?;
            LogSink::Pipe {
                stdin,
                _child: child,
            }
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    DefenderError::Config(format!("Failed to open match log file {path}: {e}"))
                })?;
            LogSink::File(file)
        };

        info!(path = %path, "Match log opened");

        Ok(Some(Self {
            sink: Mutex::new(sink),
            format: config.format,
        }))
    }

    /// Write one record with a single write call so concurrent workers
    /// never interleave partial records.
    pub fn write(&self, event: &MatchEvent) -> Result<()> {
        let mut record = match self.format {
            LogFormat::Native => event.format_native(),
            LogFormat::Json => serde_json::to_string(event)?,
        };
        record.push('\n');

        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sink.write_all(record.as_bytes())
            .and_then(|_| sink.flush())
            .map_err(|e| DefenderError::MatchLog(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> MatchEvent {
        MatchEvent {
            timestamp: Utc::now(),
            client_ip: "192.0.2.7".to_string(),
            uri: "/a".to_string(),
            learning: false,
            blocked: true,
            dropped: false,
            scores: vec![("$SQL".to_string(), 8)],
            matched: vec![MatchedRule {
                zone: "ARGS".to_string(),
                rule_id: 1000,
                var_name: "x".to_string(),
                content: "union".to_string(),
            }],
        }
    }

    #[test]
    fn test_native_line_layout_is_stable() {
        let line = sample_event().format_native();
        assert_eq!(
            line,
            "ARGS|1000|var_name=x|content=union\
             &ip=192.0.2.7&uri=/a&learning=0&block=1&drop=0&scores=$SQL:8"
        );
    }

    #[test]
    fn test_json_event_shape() {
        let event = sample_event();
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["blocked"], true);
        assert_eq!(json["matched"][0]["rule_id"], 1000);
        assert_eq!(json["scores"][0][0], "$SQL");
    }
}
