//! `pack`/`unpack` — the trusted JSON envelope used for `NOTIFY` payloads.
//!
//! The envelope is opaque to the rest of the crate: it only needs to
//! round-trip any `serde_json::Value`.

use serde_json::Value;

use crate::error::{Error, Result};

/// Serialize a payload to the wire string sent as the `NOTIFY` literal.
pub fn pack(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(Error::Decode)
}

/// Parse a wire string received as a notification payload back into a value.
///
/// A payload not produced by `pack` (e.g. a bare unquoted string) fails to
/// parse as JSON and is reported as `Error::Decode`.
pub fn unpack(payload: &str) -> Result<Value> {
    serde_json::from_str(payload).map_err(Error::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_objects() {
        let value = json!({"user": "alice", "text": "hi"});
        let wire = pack(&value).unwrap();
        assert_eq!(unpack(&wire).unwrap(), value);
    }

    #[test]
    fn round_trips_scalars_and_arrays() {
        for value in [json!(42), json!("hi"), json!([1, 2, 3]), json!(null)] {
            let wire = pack(&value).unwrap();
            assert_eq!(unpack(&wire).unwrap(), value);
        }
    }

    #[test]
    fn rejects_non_json_payload() {
        assert!(unpack("not-json").is_err());
    }
}
