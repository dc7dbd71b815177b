//! Incremental parsing of a JSON document that is still arriving.
//!
//! Streaming structured completions deliver the JSON object a few characters
//! at a time. [`PartialMerger`] accumulates those deltas and, after every push,
//! produces a complete value of the declared type: whatever has arrived so far
//! is laid over `T::default()`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Accumulates raw deltas and yields well-formed `T` snapshots.
#[derive(Debug)]
pub struct PartialMerger<T> {
    buffer: String,
    last: T,
}

impl<T> PartialMerger<T>
where
    T: DeserializeOwned + Serialize + Default + Clone,
{
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            last: T::default(),
        }
    }

    /// Append a delta and return the best snapshot so far.
    ///
    /// When the buffer cannot be interpreted yet, the previous snapshot
    /// (initially `T::default()`) is returned again.
    pub fn push(&mut self, delta: &str) -> T {
        self.buffer.push_str(delta);
        if let Some(value) = parse_partial::<T>(&self.buffer) {
            self.last = value;
        }
        self.last.clone()
    }

    /// Everything received so far.
    pub fn raw(&self) -> &str {
        &self.buffer
    }

    /// Parse the finished buffer strictly.
    pub fn finish(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.buffer)
    }
}

impl<T> Default for PartialMerger<T>
where
    T: DeserializeOwned + Serialize + Default + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret an incomplete JSON document as `T`, filling gaps from `T::default()`.
pub fn parse_partial<T>(input: &str) -> Option<T>
where
    T: DeserializeOwned + Serialize + Default,
{
    let repaired = repair_json(input)?;
    let received: Value = serde_json::from_str(&repaired).ok()?;
    let mut base = serde_json::to_value(T::default()).ok()?;
    overlay(&mut base, received);
    serde_json::from_value(base).ok()
}

/// Close an incomplete JSON document so it parses.
///
/// Open strings, arrays and objects are closed. A dangling `,` is dropped and
/// a dangling `:` gets `null`. When the tail still cannot be made valid (a
/// half-written key or literal), the document is cut back to the last element
/// boundary and closed from there.
pub fn repair_json(input: &str) -> Option<String> {
    // Trailing whitespace may sit inside an open string, so only the front is trimmed
    let input = input.trim_start();
    if input.trim_end().is_empty() {
        return None;
    }

    let mut boundaries = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if in_string {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => boundaries.push(i + 1),
            ',' => boundaries.push(i),
            _ => {}
        }
    }

    std::iter::once(input.len())
        .chain(boundaries.into_iter().rev())
        .filter_map(|cut| close(&input[..cut]))
        .find(|candidate| serde_json::from_str::<Value>(candidate).is_ok())
}

fn close(prefix: &str) -> Option<String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in prefix.chars() {
        if in_string {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop()?;
            }
            _ => {}
        }
    }

    let mut out = prefix.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str("null");
    }

    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    Some(out)
}

/// Lay `received` over `base`. Objects merge key by key; `null` never
/// overwrites a default.
fn overlay(base: &mut Value, received: Value) {
    match (base, received) {
        (Value::Object(base_map), Value::Object(received_map)) => {
            for (key, value) in received_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => {
            if !value.is_null() {
                *slot = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Draft {
        answer: String,
        sources: Vec<String>,
    }

    #[test]
    fn closes_open_string_and_object() {
        assert_eq!(
            repair_json(r#"{"answer": "Het tarief"#).as_deref(),
            Some(r#"{"answer": "Het tarief"}"#)
        );
    }

    #[test]
    fn drops_half_written_key() {
        let repaired = repair_json(r#"{"answer": "9%", "sou"#).unwrap();
        assert_eq!(repaired, r#"{"answer": "9%"}"#);
    }

    #[test]
    fn dangling_colon_becomes_null() {
        assert_eq!(
            repair_json(r#"{"answer":"#).as_deref(),
            Some(r#"{"answer":null}"#)
        );
    }

    #[test]
    fn dangling_escape_is_removed() {
        let repaired = repair_json(r#"{"answer": "regel\"#).unwrap();
        assert_eq!(repaired, r#"{"answer": "regel"}"#);
    }

    #[test]
    fn nested_arrays_are_closed() {
        let repaired = repair_json(r#"{"answer": "x", "sources": ["a", "b"#).unwrap();
        assert_eq!(repaired, r#"{"answer": "x", "sources": ["a", "b"]}"#);
    }

    #[test]
    fn empty_input_has_no_repair() {
        assert!(repair_json("   ").is_none());
    }

    #[test]
    fn missing_fields_come_from_default() {
        let draft: Draft = parse_partial(r#"{"answer": "Het"#).unwrap();
        assert_eq!(
            draft,
            Draft {
                answer: "Het".into(),
                sources: vec![]
            }
        );
    }

    #[test]
    fn merger_yields_default_before_any_field_arrives() {
        let mut merger = PartialMerger::<Draft>::new();

        assert_eq!(merger.push("{\"ans"), Draft::default());
        assert_eq!(merger.push("wer\": \"Het ").answer, "Het ");
        assert_eq!(merger.push("tarief is 9%\", ").answer, "Het tarief is 9%");
        assert_eq!(merger.push("\"sources\": []}").answer, "Het tarief is 9%");
        assert_eq!(merger.finish().unwrap().answer, "Het tarief is 9%");
    }

    #[test]
    fn finish_rejects_document_missing_a_field() {
        let mut merger = PartialMerger::<Draft>::new();

        let snapshot = merger.push(r#"{"answer": "Het tarief is 9%"}"#);
        assert_eq!(snapshot.answer, "Het tarief is 9%");
        assert!(merger.finish().is_err());
    }

    #[test]
    fn merger_keeps_last_snapshot_on_unparseable_tail() {
        let mut merger = PartialMerger::<Draft>::new();
        merger.push(r#"{"answer": "ok", "sources": [tr"#);
        let snapshot = merger.push("u");

        assert_eq!(snapshot.answer, "ok");
        assert!(merger.finish().is_err());
    }
}
