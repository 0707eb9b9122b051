//! Counter decoder (C6): parses a module's JSON counter reply into typed
//! per-interface statistics (spec.md §4.5).

use serde::Deserialize;
use tracing::warn;

use crate::error::ServiceError;
use crate::state::{InputStats, OutputStats};

#[derive(Debug, Deserialize)]
struct RawIn {
    messages: u64,
    buffers: u64,
}

#[derive(Debug, Deserialize)]
struct RawOut {
    #[serde(rename = "sent-messages")]
    sent_messages: u64,
    #[serde(rename = "dropped-messages")]
    dropped_messages: u64,
    buffers: u64,
    #[serde(rename = "autoflushes")]
    autoflushes: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawCounters {
    #[serde(default, rename = "in")]
    input: Option<Vec<RawIn>>,
    #[serde(default)]
    out: Option<Vec<RawOut>>,
}

/// Decoded counters, positionally aligned to a module's declared IN/OUT
/// interfaces. An entry is `None` when the reply had no corresponding
/// element for that position (the caller should leave that interface's
/// previously scraped stats untouched).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecodedCounters {
    pub input: Vec<Option<InputStats>>,
    pub output: Vec<Option<OutputStats>>,
}

/// Decode a counter reply for a module declaring `n_in` IN interfaces and
/// `n_out` OUT interfaces, in declared order.
pub fn decode(payload: &[u8], n_in: usize, n_out: usize) -> Result<DecodedCounters, ServiceError> {
    let root: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| ServiceError::Decode(format!("invalid JSON: {e}")))?;
    if !root.is_object() {
        return Err(ServiceError::Decode("root is not an object".to_string()));
    }

    let raw: RawCounters =
        serde_json::from_value(root).map_err(|e| ServiceError::Decode(e.to_string()))?;

    if raw.input.is_none() && n_in > 0 {
        return Err(ServiceError::Decode(
            "missing required 'in' array".to_string(),
        ));
    }
    if raw.out.is_none() && n_out > 0 {
        return Err(ServiceError::Decode(
            "missing required 'out' array".to_string(),
        ));
    }

    let input = align(raw.input.unwrap_or_default(), n_in, "in").into_iter().map(|e| {
        e.map(|r: RawIn| InputStats {
            recv_msg: r.messages,
            recv_buffer: r.buffers,
        })
    }).collect();

    let output = align(raw.out.unwrap_or_default(), n_out, "out").into_iter().map(|e| {
        e.map(|r: RawOut| OutputStats {
            sent_msg: r.sent_messages,
            sent_buffer: r.buffers,
            dropped_msg: r.dropped_messages,
            autoflush: r.autoflushes,
        })
    }).collect();

    Ok(DecodedCounters { input, output })
}

/// Positionally align a reply array to `declared_len` entries: shorter
/// wins (missing declared positions map to `None`), longer is truncated
/// with a warning (spec.md §4.5).
fn align<T>(mut entries: Vec<T>, declared_len: usize, label: &str) -> Vec<Option<T>> {
    if entries.len() > declared_len {
        warn!(
            "counter reply has {} '{}' entries but module declares {}; ignoring supernumerary entries",
            entries.len(),
            label,
            declared_len
        );
        entries.truncate(declared_len);
    } else if entries.len() < declared_len {
        warn!(
            "counter reply has only {} '{}' entries but module declares {}",
            entries.len(),
            label,
            declared_len
        );
    }

    let mut out: Vec<Option<T>> = entries.into_iter().map(Some).collect();
    out.resize_with(declared_len, || None);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_payload() {
        let payload = br#"{"in":[{"messages":1,"buffers":2}],"out":[{"sent-messages":3,"dropped-messages":0,"buffers":4,"autoflushes":5}]}"#;
        let decoded = decode(payload, 1, 1).unwrap();
        assert_eq!(decoded.input[0].unwrap().recv_msg, 1);
        assert_eq!(decoded.output[0].unwrap().sent_msg, 3);
    }

    #[test]
    fn absence_of_in_is_permitted_with_zero_declared_in_interfaces() {
        let payload = br#"{"out":[]}"#;
        let decoded = decode(payload, 0, 0).unwrap();
        assert!(decoded.input.is_empty());
    }

    #[test]
    fn absence_of_in_fails_when_in_interfaces_are_declared() {
        let payload = br#"{"out":[]}"#;
        assert!(decode(payload, 1, 0).is_err());
    }

    #[test]
    fn shorter_array_leaves_trailing_positions_unset() {
        let payload = br#"{"in":[{"messages":1,"buffers":2}],"out":[]}"#;
        let decoded = decode(payload, 2, 0).unwrap();
        assert!(decoded.input[0].is_some());
        assert!(decoded.input[1].is_none());
    }

    #[test]
    fn longer_array_truncates_supernumerary_entries() {
        let payload = br#"{"in":[{"messages":1,"buffers":1},{"messages":2,"buffers":2}],"out":[]}"#;
        let decoded = decode(payload, 1, 0).unwrap();
        assert_eq!(decoded.input.len(), 1);
    }

    #[test]
    fn missing_required_key_fails_decode() {
        let payload = br#"{"in":[{"messages":1}],"out":[]}"#;
        assert!(decode(payload, 1, 0).is_err());
    }

    #[test]
    fn non_object_root_fails_decode() {
        let payload = br#"[1,2,3]"#;
        assert!(decode(payload, 0, 0).is_err());
    }
}
