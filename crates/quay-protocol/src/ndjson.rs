//! NDJSON frame splitting for the agent wire.
//!
//! A single WebSocket message may carry several JSON objects separated by
//! newlines. Splitting naively on `'\n'` corrupts frames whose string values
//! contain a literal LF, so the splitter tracks string and nesting state and
//! only treats a newline as a boundary at the top level.

/// Split a WebSocket text payload into individual JSON frames.
///
/// Boundaries are newlines outside of any string or bracket nesting. Empty
/// segments are dropped; segment content is not validated here, so callers
/// still parse each frame and skip the ones that fail.
pub fn split_frames(input: &str) -> Vec<&str> {
    let mut frames = Vec::new();
    let bytes = input.as_bytes();
    let mut start = 0usize;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth -= 1,
            b'\n' if depth <= 0 => {
                push_frame(&mut frames, &input[start..i]);
                start = i + 1;
                depth = 0;
            }
            _ => {}
        }
    }
    push_frame(&mut frames, &input[start..]);
    frames
}

fn push_frame<'a>(frames: &mut Vec<&'a str>, segment: &'a str) {
    let trimmed = segment.trim();
    if !trimmed.is_empty() {
        frames.push(trimmed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_single_frame() {
        let frames = split_frames(r#"{"type":"keep_alive"}"#);
        assert_eq!(frames, [r#"{"type":"keep_alive"}"#]);
    }

    #[test]
    fn test_multiple_frames_split_on_lf() {
        let frames = split_frames("{\"a\":1}\n{\"b\":2}\n{\"c\":3}");
        assert_eq!(frames.len(), 3);
        let parsed: Vec<Value> = frames
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect();
        assert_eq!(parsed[1], json!({"b": 2}));
    }

    #[test]
    fn test_blank_lines_ignored() {
        let frames = split_frames("\n\n{\"a\":1}\n\n\n{\"b\":2}\n");
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_lf_inside_string_does_not_split() {
        // A literal LF inside a JSON string value must not be a boundary.
        let input = "{\"type\":\"assistant\",\"content\":\"line one\nline two\"}\n{\"type\":\"keep_alive\"}";
        let frames = split_frames(input);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("line two"));
        assert_eq!(frames[1], r#"{"type":"keep_alive"}"#);
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let input = "{\"msg\":\"she said \\\"hi\\\"\n bye\"}\n{\"x\":1}";
        let frames = split_frames(input);
        assert_eq!(frames.len(), 2);
        let first: Value = serde_json::from_str(&frames[0].replace('\n', "\\n")).unwrap();
        assert!(first["msg"].as_str().unwrap().contains("hi"));
    }

    #[test]
    fn test_lf_between_nested_objects_does_not_split() {
        // Pretty-printed object spanning lines stays one frame.
        let input = "{\n  \"a\": {\n    \"b\": 1\n  }\n}\n{\"c\":2}";
        let frames = split_frames(input);
        assert_eq!(frames.len(), 2);
        let first: Value = serde_json::from_str(frames[0]).unwrap();
        assert_eq!(first["a"]["b"], 1);
    }

    #[test]
    fn test_crlf_tolerated() {
        let frames = split_frames("{\"a\":1}\r\n{\"b\":2}");
        assert_eq!(frames.len(), 2);
        let second: Value = serde_json::from_str(frames[1]).unwrap();
        assert_eq!(second["b"], 2);
    }
}
