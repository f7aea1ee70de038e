//! Extraction of `cadre-json` fenced code blocks from agent-authored markdown.
//!
//! Agents embed structured output in their markdown deliverables using a
//! fenced block whose info string is exactly `cadre-json`:
//!
//! ```text
//! ```cadre-json
//! {"ambiguities": ["..."]}
//! ```
//! ```
//!
//! Only the first such block in a document is meaningful; any other JSON
//! present in the file (examples, quoted snippets) is ignored.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadreJsonError {
    #[error("no cadre-json block found in document")]
    BlockNotFound,

    #[error("cadre-json block is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Extract the raw contents of the first `cadre-json` fenced block, if any.
pub fn extract_block(markdown: &str) -> Option<&str> {
    let mut lines = markdown.lines();
    let mut search_start = 0usize;
    let mut offset = 0usize;

    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let is_open = trimmed.starts_with("```") && trimmed.trim_start_matches('`').trim() == "cadre-json";

        if is_open {
            let body_start = offset + line.len() + 1;
            let mut body_end = body_start;
            let mut found_close = false;

            for rest_line in markdown[body_start..].lines() {
                let rest_trimmed = rest_line.trim_start();
                if rest_trimmed.starts_with("```") {
                    found_close = true;
                    break;
                }
                body_end += rest_line.len() + 1;
            }

            if found_close {
                let end = body_end.min(markdown.len());
                return Some(markdown[body_start..end].trim_end_matches('\n'));
            }
            // Unterminated block; nothing further to find.
            return None;
        }

        offset += line.len() + 1;
        search_start = offset;
    }

    let _ = search_start;
    None
}

/// Extract and parse the first `cadre-json` block into `T`.
pub fn extract<T: DeserializeOwned>(markdown: &str) -> Result<T, CadreJsonError> {
    let raw = extract_block(markdown).ok_or(CadreJsonError::BlockNotFound)?;
    let value = serde_json::from_str(raw)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ambiguities {
        ambiguities: Vec<String>,
    }

    #[test]
    fn extracts_single_block() {
        let doc = "# Analysis\n\nSome prose.\n\n```cadre-json\n{\"ambiguities\": [\"what auth scheme?\"]}\n```\n\nMore prose.\n";
        let parsed: Ambiguities = extract(doc).unwrap();
        assert_eq!(parsed.ambiguities, vec!["what auth scheme?".to_string()]);
    }

    #[test]
    fn ignores_other_fenced_blocks() {
        let doc = "```json\n{\"ambiguities\": [\"wrong block\"]}\n```\n\n```cadre-json\n{\"ambiguities\": []}\n```\n";
        let parsed: Ambiguities = extract(doc).unwrap();
        assert_eq!(parsed.ambiguities, Vec::<String>::new());
    }

    #[test]
    fn only_first_block_is_used() {
        let doc = "```cadre-json\n{\"ambiguities\": [\"first\"]}\n```\n\n```cadre-json\n{\"ambiguities\": [\"second\"]}\n```\n";
        let parsed: Ambiguities = extract(doc).unwrap();
        assert_eq!(parsed.ambiguities, vec!["first".to_string()]);
    }

    #[test]
    fn missing_block_is_error() {
        let doc = "# No structured output here.\n";
        let result: Result<Ambiguities, _> = extract(doc);
        assert!(matches!(result, Err(CadreJsonError::BlockNotFound)));
    }

    #[test]
    fn unterminated_block_is_not_found() {
        let doc = "```cadre-json\n{\"ambiguities\": []}\n";
        assert!(extract_block(doc).is_none());
    }

    #[test]
    fn invalid_json_in_block_is_error() {
        let doc = "```cadre-json\nnot json\n```\n";
        let result: Result<Ambiguities, _> = extract(doc);
        assert!(matches!(result, Err(CadreJsonError::InvalidJson(_))));
    }
}
