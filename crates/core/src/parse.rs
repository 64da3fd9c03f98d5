//! Tolerant decoding of model replies.
//!
//! Models are asked for strict JSON but regularly wrap it in prose or
//! markdown fences. Decoding tries the raw text first, then the first
//! balanced `{...}` object found in it.

use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum ReplyParseError {
    #[error("reply was empty")]
    Empty,
    #[error("reply contained no JSON object: {0:?}")]
    NoObject(String),
    #[error("reply object did not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Returns the first balanced, object-shaped substring of `text`.
///
/// Braces inside string literals are ignored, so `{"a": "}"}` is found whole.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=i];
                        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                            return Some(candidate);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

/// Decodes `raw` into `T`, falling back to the first embedded JSON object.
pub fn parse_reply<T: DeserializeOwned>(raw: &str) -> Result<T, ReplyParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ReplyParseError::Empty);
    }
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }
    let object = extract_json_object(trimmed)
        .ok_or_else(|| ReplyParseError::NoObject(truncate(trimmed, 80)))?;
    Ok(serde_json::from_str::<T>(object)?)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Question {
        question: String,
    }

    #[test]
    fn strict_json_parses_directly() {
        let q: Question = parse_reply(r#"{"question": "Where do you live?"}"#).unwrap();
        assert_eq!(q.question, "Where do you live?");
    }

    #[test]
    fn fenced_json_is_extracted() {
        let raw = "Sure! Here you go:\n```json\n{\"question\": \"What do you do?\"}\n```\n";
        let q: Question = parse_reply(raw).unwrap();
        assert_eq!(q.question, "What do you do?");
    }

    #[test]
    fn braces_inside_strings_do_not_end_the_object() {
        let raw = r#"noise {"question": "Is } a brace?"} trailing }"#;
        assert_eq!(
            extract_json_object(raw),
            Some(r#"{"question": "Is } a brace?"}"#)
        );
    }

    #[test]
    fn skips_unbalanced_prefix_objects() {
        let raw = r#"{not json {"question": "ok"}"#;
        let q: Question = parse_reply(raw).unwrap();
        assert_eq!(q.question, "ok");
    }

    #[test]
    fn truncated_object_is_an_error() {
        let err = parse_reply::<Question>("not json{").unwrap_err();
        assert!(matches!(err, ReplyParseError::NoObject(_)));
    }

    #[test]
    fn empty_reply_is_an_error() {
        assert!(matches!(
            parse_reply::<Question>("  \n"),
            Err(ReplyParseError::Empty)
        ));
    }

    #[test]
    fn wrong_shape_is_reported() {
        let err = parse_reply::<Question>(r#"{"level": "B2"}"#).unwrap_err();
        assert!(matches!(err, ReplyParseError::Shape(_)));
    }
}
