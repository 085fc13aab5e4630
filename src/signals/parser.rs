//! Signal parsing from agent output.
//!
//! A signal line is `KEY: value` at the start of a line (leading whitespace
//! allowed). Keys outside the recognized vocabulary are skipped.

use super::types::{SignalKey, Signals};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static SIGNAL_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Z][A-Z0-9_]*):(.*)$").unwrap());

/// Parser for extracting signals from agent output.
pub struct SignalParser {
    /// Whether to log each decoded signal
    verbose: bool,
}

impl SignalParser {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Extract the last occurrence of every recognized key.
    pub fn parse(&self, text: &str) -> Signals {
        let mut signals = Signals::new();

        for (line_no, line) in text.lines().enumerate() {
            let Some(cap) = SIGNAL_LINE_REGEX.captures(line) else {
                continue;
            };
            let Some(key) = SignalKey::from_key(&cap[1]) else {
                continue;
            };
            let value = cap[2].trim();

            if self.verbose {
                debug!(signal = %key, value, line = line_no, "decoded signal");
            }
            signals.record(key, value, line_no);
        }

        signals
    }
}

/// Convenience function to extract signals without creating a parser.
pub fn extract_signals(text: &str) -> Signals {
    SignalParser::new(false).parse(text)
}
