//! JSON batch handling for `application/json` streams.
//!
//! A POST body that is a JSON array is accepted as one atomic batch: the
//! stored bytes are the body verbatim minus the outer array brackets, and
//! each top-level element becomes one delivery unit. A body that is any
//! other JSON value is stored verbatim as a single unit.

use bytes::Bytes;
use serde_json::value::RawValue;

/// Outcome of preparing a JSON append body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonBatch {
    /// Bytes to commit to the log.
    pub data: Bytes,
    /// `(start, len)` of each top-level value within `data`. Separator
    /// bytes between spans are committed but never framed into an event.
    pub boundaries: Vec<(usize, usize)>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JsonBatchError {
    #[error("body is not valid JSON: {0}")]
    Invalid(String),

    #[error("empty arrays not allowed on append")]
    EmptyArray,
}

/// Validate a JSON append body and flatten top-level arrays.
pub fn prepare_json_append(body: &Bytes) -> Result<JsonBatch, JsonBatchError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| JsonBatchError::Invalid(format!("invalid utf-8: {}", e)))?;

    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        flatten_array(body, text)
    } else {
        single_value(body, text)
    }
}

fn flatten_array(body: &Bytes, text: &str) -> Result<JsonBatch, JsonBatchError> {
    let elements: Vec<&RawValue> =
        serde_json::from_str(text).map_err(|e| JsonBatchError::Invalid(e.to_string()))?;
    if elements.is_empty() {
        return Err(JsonBatchError::EmptyArray);
    }

    // The stored bytes are the body text between the outer brackets,
    // verbatim: element encodings plus the separators between them.
    let open = text
        .find('[')
        .ok_or_else(|| JsonBatchError::Invalid("missing '['".to_string()))?;
    let close = text
        .rfind(']')
        .ok_or_else(|| JsonBatchError::Invalid("missing ']'".to_string()))?;
    let inner_start = open + 1;

    let base = text.as_ptr() as usize;
    let boundaries = elements
        .iter()
        .map(|raw| {
            let s = raw.get();
            let abs = s.as_ptr() as usize - base;
            (abs - inner_start, s.len())
        })
        .collect();

    Ok(JsonBatch {
        data: body.slice(inner_start..close),
        boundaries,
    })
}

fn single_value(body: &Bytes, text: &str) -> Result<JsonBatch, JsonBatchError> {
    // Validation only; the body is stored verbatim.
    serde_json::from_str::<&RawValue>(text)
        .map_err(|e| JsonBatchError::Invalid(e.to_string()))?;

    let start = text.len() - text.trim_start().len();
    let end = text.trim_end().len();
    Ok(JsonBatch {
        data: body.clone(),
        boundaries: vec![(start, end - start)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(s: &str) -> JsonBatch {
        prepare_json_append(&Bytes::copy_from_slice(s.as_bytes())).unwrap()
    }

    #[test]
    fn flattens_array_verbatim_minus_brackets() {
        let batch = prepare(r#"[{"n":1},{"n":2}]"#);
        assert_eq!(batch.data, Bytes::from_static(br#"{"n":1},{"n":2}"#));
        assert_eq!(batch.data.len(), 15);
        assert_eq!(batch.boundaries, vec![(0, 7), (8, 7)]);
    }

    #[test]
    fn element_spans_recover_exact_text() {
        let batch = prepare(r#"[1, "two" ,[3]]"#);
        let texts: Vec<&[u8]> = batch
            .boundaries
            .iter()
            .map(|&(s, l)| &batch.data[s..s + l])
            .collect();
        assert_eq!(texts, vec![b"1".as_ref(), br#""two""#.as_ref(), b"[3]".as_ref()]);
    }

    #[test]
    fn single_value_stored_verbatim() {
        let batch = prepare(r#"{"a":1}"#);
        assert_eq!(batch.data, Bytes::from_static(br#"{"a":1}"#));
        assert_eq!(batch.boundaries, vec![(0, 7)]);
    }

    #[test]
    fn single_value_with_padding_frames_trimmed_span() {
        let batch = prepare(" {\"a\":1}\n");
        assert_eq!(batch.data.len(), 9);
        assert_eq!(batch.boundaries, vec![(1, 7)]);
    }

    #[test]
    fn rejects_empty_array() {
        let err = prepare_json_append(&Bytes::from_static(b"[]")).unwrap_err();
        assert_eq!(err, JsonBatchError::EmptyArray);
        let err = prepare_json_append(&Bytes::from_static(b"  [ ]  ")).unwrap_err();
        assert_eq!(err, JsonBatchError::EmptyArray);
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(
            prepare_json_append(&Bytes::from_static(b"{oops")),
            Err(JsonBatchError::Invalid(_))
        ));
        // Trailing garbage after a complete value is not a single JSON doc.
        assert!(matches!(
            prepare_json_append(&Bytes::from_static(b"{\"a\":1} {\"b\":2}")),
            Err(JsonBatchError::Invalid(_))
        ));
    }

    #[test]
    fn nested_arrays_only_flatten_one_level() {
        let batch = prepare(r#"[[1,2],[3]]"#);
        assert_eq!(batch.data, Bytes::from_static(b"[1,2],[3]"));
        assert_eq!(batch.boundaries, vec![(0, 5), (6, 3)]);
    }
}
