//! Crawl log analysis.
//!
//! A log is a sequence of entries of the form
//! `YYYY-MM-DD HH:MM:SS [logger] LEVEL: message`. Lines that don't start a
//! new entry (tracebacks, the stats dump) belong to the previous one.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde_json::{json, Value};

use crate::job::TaskNote;

static ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) \[([^\]]+)\] (DEBUG|INFO|WARNING|ERROR|CRITICAL): (.*)$",
    )
    .unwrap()
});

static STAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^'([^']+)':\s*(.+?)$").unwrap());

static PROCESS_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Created collection (.+) in Kingfisher Process \(([^\)]+)\)").unwrap()
});

static HTTP_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"status=(\d{3})\b").unwrap());

const STATS_MARKER: &str = "Dumping Scrapy stats:";

/// Warnings emitted by every crawl that say nothing about the data.
const IGNORE_WARNINGS: [&str; 2] = [
    "[scrapy.middleware] WARNING: Disabled kingfisher_scrapy.extensions.DatabaseStore: DATABASE_URL is not set.",
    "[yapw.clients] WARNING: Channel 1 was closed: ChannelClosedByClient: (200) 'Normal shutdown'",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn parse(s: &str) -> Self {
        match s {
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "WARNING" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Critical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub logger: String,
    pub message: String,
    /// The first line, verbatim.
    pub line: String,
    pub continuation: Vec<String>,
}

impl LogEntry {
    /// The entry with its continuation lines.
    pub fn text(&self) -> String {
        if self.continuation.is_empty() {
            self.line.clone()
        } else {
            format!("{}\n{}", self.line, self.continuation.join("\n"))
        }
    }

    fn is_error(&self) -> bool {
        matches!(self.level, LogLevel::Error | LogLevel::Critical)
    }
}

/// A parsed crawl log.
#[derive(Debug, Clone, Default)]
pub struct ScrapyLog {
    entries: Vec<LogEntry>,
    stats: HashMap<String, Value>,
    collection: Option<(String, String)>,
}

impl ScrapyLog {
    pub fn parse(text: &str) -> Self {
        let mut entries: Vec<LogEntry> = Vec::new();
        let mut collection = None;

        for line in text.lines() {
            if collection.is_none() {
                if let Some(caps) = PROCESS_ID.captures(line) {
                    collection = Some((caps[1].to_string(), caps[2].to_string()));
                }
            }

            if let Some(caps) = ENTRY.captures(line) {
                entries.push(LogEntry {
                    level: LogLevel::parse(&caps[3]),
                    logger: caps[2].to_string(),
                    message: caps[4].to_string(),
                    line: line.to_string(),
                    continuation: Vec::new(),
                });
            } else if let Some(last) = entries.last_mut() {
                last.continuation.push(line.to_string());
            }
        }

        let stats = entries
            .iter()
            .rev()
            .find(|entry| entry.message.trim_end().ends_with(STATS_MARKER))
            .map(|entry| parse_stats(&entry.continuation))
            .unwrap_or_default();

        Self {
            entries,
            stats,
            collection,
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Collection ID and data version announced by the processing extension.
    pub fn collection(&self) -> Option<(&str, &str)> {
        self.collection
            .as_ref()
            .map(|(id, version)| (id.as_str(), version.as_str()))
    }

    pub fn stat(&self, key: &str) -> Option<&Value> {
        self.stats.get(key)
    }

    pub fn stat_count(&self, key: &str) -> u64 {
        self.stat(key).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.stat("finish_reason").and_then(|v| v.as_str())
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason() == Some("finished")
    }

    /// Whether a spider stopped early because a "next" link was missing.
    pub fn missing_next_link(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.is_error() && entry.text().contains("MissingNextLinkError"))
    }

    /// File errors per scraped item.
    pub fn error_rate(&self) -> f64 {
        let items = self.stat_count("item_scraped_count");
        if items == 0 {
            return 0.0;
        }
        self.stat_count("file_error_count") as f64 / items as f64
    }

    /// Notes describing the crawl's problems: dropped items and invalid JSON
    /// first, then error entries, then warning entries.
    pub fn notes(&self) -> Vec<TaskNote> {
        let mut notes = Vec::new();

        let dropped = self.stat_count("item_dropped_count");
        if dropped > 0 {
            notes.push(TaskNote::warning(
                format!("item_dropped_count: {}", dropped),
                json!({}),
            ));
        }
        let invalid = self.stat_count("invalid_json_count");
        if invalid > 0 {
            notes.push(TaskNote::error(
                format!("invalid_json_count: {}", invalid),
                json!({}),
            ));
        }

        for entry in self.entries.iter().filter(|e| e.is_error()) {
            let text = entry.text();
            notes.push(TaskNote::error(text.clone(), error_type(&text)));
        }

        for entry in self
            .entries
            .iter()
            .filter(|e| e.level == LogLevel::Warning)
        {
            let text = entry.text();
            if IGNORE_WARNINGS.iter().any(|ignore| text.contains(ignore)) {
                continue;
            }
            let data = if text.contains("Got data loss") {
                json!({"type": "Data loss"})
            } else {
                json!({})
            };
            notes.push(TaskNote::warning(text, data));
        }

        notes
    }
}

fn error_type(text: &str) -> Value {
    if let Some(caps) = HTTP_STATUS.captures(text) {
        json!({"type": format!("HTTP {}", &caps[1])})
    } else if text.contains("Error downloading") {
        json!({"type": "Download errors"})
    } else if text.contains("Gave up retrying") {
        json!({"type": "Retry failures"})
    } else {
        json!({})
    }
}

/// Parse the dict literal dumped by the stats collector, one key per line.
fn parse_stats(lines: &[String]) -> HashMap<String, Value> {
    let mut stats = HashMap::new();

    for line in lines {
        let line = line
            .trim()
            .trim_start_matches('{')
            .trim_end_matches('}')
            .trim_end_matches(',')
            .trim();
        let Some(caps) = STAT.captures(line) else {
            continue;
        };
        stats.insert(caps[1].to_string(), parse_value(&caps[2]));
    }

    stats
}

fn parse_value(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<u64>() {
        return Value::from(n);
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Value::from(n);
    }
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw);
    Value::String(unquoted.to_string())
}
