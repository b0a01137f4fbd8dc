use thiserror::Error;

use crate::RunEventV1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("line {line}: invalid event JSON: {source}")]
    InvalidJson {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: {reason}")]
    InvalidEvent { line: usize, reason: String },
}

/// Serialize a batch as NDJSON, one event per line, trailing newline.
pub fn encode_ndjson(events: &[RunEventV1]) -> String {
    let mut out = String::new();
    for event in events {
        // RunEventV1 contains no map keys that can fail to serialize.
        out.push_str(&serde_json::to_string(event).unwrap_or_default());
        out.push('\n');
    }
    out
}

/// Parse and validate an NDJSON batch. Blank lines are skipped; any invalid
/// line fails the whole batch, matching the server's all-or-nothing intake.
pub fn decode_ndjson(text: &str) -> Result<Vec<RunEventV1>, WireError> {
    let mut events = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: RunEventV1 = serde_json::from_str(trimmed)
            .map_err(|source| WireError::InvalidJson { line, source })?;
        event
            .validate()
            .map_err(|reason| WireError::InvalidEvent { line, reason })?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventBody, ItemStartedPayload, SCHEMA_VERSION};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(seq: u64) -> RunEventV1 {
        RunEventV1 {
            schema_version: SCHEMA_VERSION,
            event_id: Uuid::new_v4(),
            sequence: seq,
            sent_at: Utc::now(),
            run_id: "run-1".to_string(),
            body: EventBody::ItemStarted(ItemStartedPayload {
                item_id: format!("item_{seq}"),
                index: seq - 1,
                input: json!("in"),
                expected: None,
                item_metadata: json!({}),
            }),
        }
    }

    #[test]
    fn ndjson_round_trip() {
        let batch = vec![event(1), event(2), event(3)];
        let text = encode_ndjson(&batch);
        assert_eq!(text.lines().count(), 3);
        let decoded = decode_ndjson(&text).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let text = format!("\n{}\n\n", encode_ndjson(&[event(1)]));
        let decoded = decode_ndjson(&text).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn one_bad_line_fails_the_batch() {
        let mut text = encode_ndjson(&[event(1)]);
        text.push_str("{\"not\": \"an event\"}\n");
        let err = decode_ndjson(&text).unwrap_err();
        match err {
            WireError::InvalidJson { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_schema_version_fails_validation() {
        let mut evt = event(1);
        evt.schema_version = 7;
        let text = encode_ndjson(&[evt]);
        let err = decode_ndjson(&text).unwrap_err();
        assert!(matches!(err, WireError::InvalidEvent { line: 1, .. }));
    }
}
