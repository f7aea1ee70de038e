//! Token usage extraction from agent stdout/stderr.

use serde::Deserialize;

/// JSON-mode usage block, as emitted by Claude-style agent CLIs.
#[derive(Debug, Deserialize)]
struct JsonUsage {
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
}

const PATTERN_PREFIXES: &[&str] = &[
    "total_tokens:",
    "Total tokens:",
    "tokens used:",
];

/// Parse token usage from a completed agent invocation's stdout/stderr.
///
/// Tries JSON mode first (an `{"usage": {...}}` object anywhere parseable as
/// the whole payload), then falls back to hand-scanning four literal label
/// patterns across stdout then stderr. Defaults to 0.
pub fn parse_token_usage(stdout: &str, stderr: &str) -> i64 {
    if let Ok(parsed) = serde_json::from_str::<JsonUsage>(stdout) {
        return parsed.usage.input_tokens
            + parsed.usage.output_tokens
            + parsed.usage.cache_read_input_tokens
            + parsed.usage.cache_creation_input_tokens;
    }

    scan_for_token_count(stdout)
        .or_else(|| scan_for_token_count(stderr))
        .unwrap_or(0)
}

fn scan_for_token_count(text: &str) -> Option<i64> {
    for prefix in PATTERN_PREFIXES {
        if let Some(n) = scan_labeled_number(text, prefix) {
            return Some(n);
        }
    }
    scan_usage_tokens_pattern(text)
}

/// Scans for `<prefix>\s*([\d,]+)`, case-sensitive, first match wins.
fn scan_labeled_number(text: &str, prefix: &str) -> Option<i64> {
    let idx = text.find(prefix)?;
    let rest = &text[idx + prefix.len()..];
    let rest = rest.trim_start();
    take_digit_run(rest)
}

/// Scans for `usage:\s*([\d,]+)\s*tokens`.
fn scan_usage_tokens_pattern(text: &str) -> Option<i64> {
    let mut search_from = 0usize;
    while let Some(rel_idx) = text[search_from..].find("usage:") {
        let idx = search_from + rel_idx;
        let rest = text[idx + "usage:".len()..].trim_start();
        let digits_end = rest
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_digit() || *c == ',')
            .last()
            .map(|(i, c)| i + c.len_utf8());

        if let Some(end) = digits_end {
            let after = rest[end..].trim_start();
            if after.starts_with("tokens") {
                if let Some(n) = parse_digit_run(&rest[..end]) {
                    return Some(n);
                }
            }
        }

        search_from = idx + "usage:".len();
    }
    None
}

fn take_digit_run(s: &str) -> Option<i64> {
    let end = s
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == ',')
        .last()
        .map(|(i, c)| i + c.len_utf8())?;
    parse_digit_run(&s[..end])
}

fn parse_digit_run(s: &str) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    s.replace(',', "").parse::<i64>().ok()
}
