//! Streaming line protocol of the agent CLI
//!
//! The agent writes one JSON object per line (`--output-format stream-json`).
//! Lines that are not JSON are passed through untouched.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

/// What a single output line carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// Text blocks of an `assistant` message
    AssistantText(String),
    /// Payload of the closing `result` message
    FinalResult(String),
    /// Not JSON; surfaced as-is
    Raw(String),
    /// Blank line, or JSON without user-facing text
    None,
}

impl ParsedLine {
    /// Text to surface, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::AssistantText(t) | Self::FinalResult(t) | Self::Raw(t) => Some(t),
            Self::None => None,
        }
    }
}

/// Parse one line of agent output
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::None;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return ParsedLine::Raw(trimmed.to_string()),
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let text = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            if text.trim().is_empty() {
                ParsedLine::None
            } else {
                ParsedLine::AssistantText(text)
            }
        }
        Some("result") => match value.get("result").and_then(Value::as_str) {
            Some(result) if !result.trim().is_empty() => ParsedLine::FinalResult(result.to_string()),
            _ => ParsedLine::None,
        },
        Some(other) => {
            debug!(kind = other, "parse_line: ignoring event");
            ParsedLine::None
        }
        // A JSON string or number on its own line is passed through
        None => match value {
            Value::String(s) if !s.trim().is_empty() => ParsedLine::Raw(s),
            Value::Object(_) | Value::String(_) => ParsedLine::None,
            other => ParsedLine::Raw(other.to_string()),
        },
    }
}

/// De-duplicates and rate-limits text surfaced to listeners
#[derive(Debug)]
pub struct OutputThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_text: Option<String>,
    pending: Vec<String>,
}

impl OutputThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_text: None,
            pending: Vec::new(),
        }
    }

    /// Offer a piece of text; returns what should be emitted now
    pub fn push(&mut self, text: &str, now: Instant) -> Option<String> {
        let text = text.trim();
        if text.is_empty() || self.last_text.as_deref() == Some(text) {
            return None;
        }
        self.last_text = Some(text.to_string());
        self.pending.push(text.to_string());

        let due = self
            .last_emit
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last_emit = Some(now);
            return self.take();
        }
        None
    }

    /// Whatever is still held back
    pub fn flush(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending).join("\n"))
    }
}
