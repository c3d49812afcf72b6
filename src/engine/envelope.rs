//! Envelope parsing.
//!
//! The backend is asked to wrap its answer in a JSON object (non-streaming)
//! or a code block (streaming), with a start marker in front of the real
//! content. Everything here is tolerant of truncated input and never fails:
//! callers fall back to the raw text.

use crate::config::EnvelopeConfig;
use serde_json::Value;
use tracing::{debug, warn};

/// Result of looking for an envelope in a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Parsed, and the answer field holds a string.
    Answer(String),
    /// Parsed, but without a string answer field.
    Unrecognized(Value),
    NotParseable,
}

/// Find and parse the outermost `{...}` or `[...]` region, whichever opens
/// first. First-open/last-close scan, not a real parser.
pub fn try_parse_json(text: &str) -> Option<Value> {
    let text = text.trim();
    let first_brace = text.find('{');
    let first_bracket = text.find('[');

    let (start, close) = match (first_brace, first_bracket) {
        (Some(brace), Some(bracket)) if bracket < brace => (bracket, ']'),
        (Some(brace), _) => (brace, '}'),
        (None, Some(bracket)) => (bracket, ']'),
        (None, None) => return None,
    };
    let end = text.rfind(close)?;
    if end < start {
        return None;
    }

    serde_json::from_str(&text[start..=end]).ok()
}

#[derive(Debug, Clone)]
pub struct EnvelopeParser {
    answer_field: String,
    start_marker: String,
    unwrap_nested: bool,
}

impl EnvelopeParser {
    pub fn new(config: &EnvelopeConfig) -> Self {
        Self {
            answer_field: config.answer_field.clone(),
            start_marker: config.start_marker.clone(),
            unwrap_nested: config.unwrap_nested,
        }
    }

    pub fn start_marker(&self) -> &str {
        &self.start_marker
    }

    pub fn parse(&self, text: &str) -> Envelope {
        match try_parse_json(text) {
            Some(value) => match value.get(&self.answer_field).and_then(Value::as_str) {
                Some(answer) => Envelope::Answer(answer.to_string()),
                None => Envelope::Unrecognized(value),
            },
            None => Envelope::NotParseable,
        }
    }

    /// Turn a complete raw snapshot into the final answer: outer envelope,
    /// nested envelope, then marker, then trim.
    pub fn final_answer(&self, raw: &str) -> String {
        let outer = match self.parse(raw) {
            Envelope::Answer(answer) => answer,
            Envelope::Unrecognized(value) => {
                debug!("Envelope lacks '{}' field, using serialized value", self.answer_field);
                value.to_string()
            }
            Envelope::NotParseable => {
                debug!("No parseable envelope, using raw text");
                raw.to_string()
            }
        };

        let inner = if self.unwrap_nested {
            self.unwrap_nested_envelope(outer)
        } else {
            outer
        };

        match self.after_marker(&inner) {
            Some(content) => content.trim().to_string(),
            None => {
                warn!("Start marker not found in final answer");
                inner.trim().to_string()
            }
        }
    }

    /// Answer text carrying a second envelope of the same shape.
    fn unwrap_nested_envelope(&self, text: String) -> String {
        match self.parse(&text) {
            Envelope::Answer(inner) => {
                debug!("Unwrapped nested envelope");
                inner
            }
            _ => text,
        }
    }

    fn after_marker<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.find(&self.start_marker)
            .map(|index| &text[index + self.start_marker.len()..])
    }

    /// Extracted content of an in-progress streaming snapshot: the text after
    /// the start marker, minus a closing code fence. `None` until the marker
    /// has appeared.
    pub fn stream_content(&self, raw: &str) -> Option<String> {
        let content = self.after_marker(raw)?.trim_end();
        let content = content.strip_suffix("```").unwrap_or(content);
        Some(content.trim_end().to_string())
    }
}
