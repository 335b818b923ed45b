//! Log sanitization for patient identifiers and credentials.
//!
//! Every formatted log line passes through [`SanitizingMakeWriter`], which
//! redacts:
//! - UUIDs (profile, patient and link ids)
//! - Email addresses and Australian phone numbers
//! - Medicare card numbers
//! - Dates of birth and share-link tokens written as `key=value`
//! - JWTs, bearer tokens and API keys
//!
//! This is a fallback. Callsites should still avoid logging record contents,
//! and types carrying tokens redact themselves in `Debug`.
//!
//! Input is capped at `MEDPROFILE_SANITIZE_MAX_BYTES` (16 KiB by default)
//! so an oversized line cannot stall the logging thread.

use std::sync::OnceLock;

use regex::{Regex, RegexSet};
use tracing_subscriber::fmt::MakeWriter;

const DEFAULT_SANITIZE_MAX_BYTES: usize = 16 * 1024;
const MAX_BYTES_ENV: &str = "MEDPROFILE_SANITIZE_MAX_BYTES";

struct Rule {
    regex: Regex,
    replacement: &'static str,
}

struct Rules {
    set: RegexSet,
    rules: Vec<Rule>,
}

static RULES: OnceLock<Rules> = OnceLock::new();

fn rules() -> &'static Rules {
    RULES.get_or_init(|| {
        // Applied in this order. Medicare runs before phone so a ten-digit
        // card number is not half-eaten by the phone rule.
        let table: [(&str, &str); 9] = [
            (
                r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
                "[REDACTED-UUID]",
            ),
            (
                r"(?i)\b[a-z0-9](?:[a-z0-9._%+-]{0,62}[a-z0-9])?@(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,}\b",
                "[REDACTED-EMAIL]",
            ),
            (
                r"\beyJ[a-zA-Z0-9_-]{10,}\.[a-zA-Z0-9_-]{10,}\.[a-zA-Z0-9_-]{10,}\b",
                "[REDACTED-JWT]",
            ),
            (
                r"(?i)\b(apikey|api[_-]?key|bearer)\b(\s*[:=]?\s*)[\w.~+/-]{20,}=*",
                "${1}${2}[REDACTED-SECRET]",
            ),
            (
                r#"(?i)\b(unique_hash|share_token|token)\b("?\s*[:=]\s*"?)[0-9a-z]{8,}"#,
                "${1}${2}[REDACTED-TOKEN]",
            ),
            (
                r#"(?i)\b(date_of_birth|dob)\b("?\s*[:=]\s*"?)\d{4}-\d{2}-\d{2}"#,
                "${1}${2}[REDACTED-DOB]",
            ),
            (
                r"\b[2-6]\d{3}[ -]?\d{5}[ -]?\d(?:[ -]?\d)?\b",
                "[REDACTED-MEDICARE]",
            ),
            (
                r"(?:\+61\s?|\b0)[2-478](?:[ -]?\d){8}\b",
                "[REDACTED-PHONE]",
            ),
            (
                r#"(?i)\b(medicare_number)\b("?\s*[:=]\s*"?)[0-9 -]{4,}"#,
                "${1}${2}[REDACTED-MEDICARE]",
            ),
        ];

        let set =
            RegexSet::new(table.iter().map(|(pattern, _)| *pattern)).expect("Valid regex set");
        let rules = table
            .into_iter()
            .map(|(pattern, replacement)| Rule {
                regex: Regex::new(pattern).expect("Valid regex"),
                replacement,
            })
            .collect();

        Rules { set, rules }
    })
}

fn max_sanitize_bytes() -> usize {
    std::env::var(MAX_BYTES_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_SANITIZE_MAX_BYTES)
}

fn truncate_to_char_boundary(input: &str, max_bytes: usize) -> (&str, bool) {
    if input.len() <= max_bytes {
        return (input, false);
    }

    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    (&input[..end], true)
}

/// Redact identifiers and credentials from `input`.
#[must_use]
pub fn sanitize(input: &str) -> String {
    sanitize_with_limit(input, max_sanitize_bytes())
}

fn sanitize_with_limit(input: &str, max_bytes: usize) -> String {
    let rules = rules();
    let (prefix, truncated) = truncate_to_char_boundary(input, max_bytes);

    let mut result = prefix.to_string();
    for idx in rules.set.matches(prefix).into_iter() {
        let rule = &rules.rules[idx];
        result = rule.regex.replace_all(&result, rule.replacement).into_owned();
    }

    if truncated {
        result.push_str(" [TRUNCATED]");
    }
    result
}

/// Whether `input` contains anything [`sanitize`] would redact.
#[must_use]
pub fn contains_pii(input: &str) -> bool {
    let (prefix, _) = truncate_to_char_boundary(input, max_sanitize_bytes());
    rules().set.is_match(prefix)
}

/// `MakeWriter` wrapper that sanitizes each formatted line before it reaches
/// the inner sink.
#[derive(Debug, Clone)]
pub struct SanitizingMakeWriter<M> {
    inner: M,
}

impl<M> SanitizingMakeWriter<M> {
    #[must_use]
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

/// Line-buffering writer produced by [`SanitizingMakeWriter`].
pub struct SanitizingWriter<W: std::io::Write> {
    inner: W,
    buffer: Vec<u8>,
}

impl<W: std::io::Write> SanitizingWriter<W> {
    fn write_sanitized(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        self.inner.write_all(sanitize(&text).as_bytes())
    }

    fn flush_lines(&mut self) -> std::io::Result<()> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.write_sanitized(&line)?;
        }
        Ok(())
    }
}

impl<W: std::io::Write> std::io::Write for SanitizingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);

        // A line with no newline in sight is flushed early rather than buffered forever.
        if self.buffer.len() > max_sanitize_bytes().saturating_mul(2) {
            let pending = std::mem::take(&mut self.buffer);
            self.write_sanitized(&pending)?;
            self.inner.write_all(b"\n")?;
            return Ok(buf.len());
        }

        self.flush_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_lines()?;
        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            self.write_sanitized(&pending)?;
        }
        self.inner.flush()
    }
}

impl<W: std::io::Write> Drop for SanitizingWriter<W> {
    fn drop(&mut self) {
        // The fmt layer makes one writer per event; make sure a final
        // unterminated fragment is not lost.
        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            let _ = self.write_sanitized(&pending);
        }
    }
}

impl<'a, M> MakeWriter<'a> for SanitizingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = SanitizingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        SanitizingWriter {
            inner: self.inner.make_writer(),
            buffer: Vec::new(),
        }
    }
}
