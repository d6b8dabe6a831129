// SPDX-License-Identifier: MIT
//!
//! Length-prefixed binary RPC frame codec.
//!
//! Wire format per frame:
//! ```text
//! ┌────────────┬───────────────────┬─────────────────┐
//! │ u32 BE len │ CBOR header       │ opaque payload   │
//! └────────────┴───────────────────┴─────────────────┘
//! ```
//!
//! `len` is the byte length of the CBOR-encoded header only; everything
//! after it to the end of the frame is the payload, passed through
//! untouched. The header is encoded as an **ordered array of `(key, value)`
//! pairs** rather than a CBOR map — map key order is not guaranteed stable
//! across CBOR implementations, array order is, so re-encoding an
//! unmodified header is guaranteed byte-identical to the original.

use ciborium::Value as CborValue;
use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};

/// One decoded RPC frame: header fields plus the unparsed payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// The leading header of a frame.
///
/// `from`, `to`, `ws`, `user` are the fields the router inspects and
/// rewrites; `extra` holds every other pair in original order, re-emitted
/// unchanged per the frame codec's contract (no other field may be mutated).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameHeader {
    pub from: String,
    pub to: String,
    pub ws: Option<String>,
    pub user: Option<serde_json::Value>,
    pub extra: Vec<(String, serde_json::Value)>,
}

impl FrameHeader {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ws: None,
            user: None,
            extra: Vec::new(),
        }
    }
}

/// Decode a frame's header without consuming or interpreting the payload.
pub fn decode(bytes: &[u8]) -> RouterResult<Frame> {
    if bytes.len() < 4 {
        return Err(RouterError::MalformedFrame(
            "frame shorter than length prefix".into(),
        ));
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let header_start = 4;
    let header_end = header_start
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| RouterError::MalformedFrame("header length exceeds frame size".into()))?;

    let header_bytes = &bytes[header_start..header_end];
    let payload = bytes[header_end..].to_vec();

    let pairs: Vec<(String, CborValue)> = ciborium::from_reader(header_bytes)
        .map_err(|e| RouterError::MalformedFrame(format!("header decode: {e}")))?;

    let mut header = FrameHeader::default();
    let mut have_from = false;
    let mut have_to = false;

    for (key, value) in pairs {
        match key.as_str() {
            "from" => {
                header.from = cbor_to_string(&value)?;
                have_from = true;
            }
            "to" => {
                header.to = cbor_to_string(&value)?;
                have_to = true;
            }
            "ws" => header.ws = Some(cbor_to_string(&value)?),
            "user" => header.user = Some(cbor_to_json(&value)?),
            _ => header.extra.push((key, cbor_to_json(&value)?)),
        }
    }

    if !have_from || !have_to {
        return Err(RouterError::MalformedFrame(
            "header missing 'from' or 'to'".into(),
        ));
    }

    Ok(Frame { header, payload })
}

/// Re-encode `header`, splicing it before `payload` unchanged.
pub fn encode(header: &FrameHeader, payload: &[u8]) -> RouterResult<Vec<u8>> {
    let mut pairs: Vec<(String, CborValue)> = Vec::with_capacity(4 + header.extra.len());
    pairs.push(("from".to_string(), CborValue::Text(header.from.clone())));
    pairs.push(("to".to_string(), CborValue::Text(header.to.clone())));
    if let Some(ws) = &header.ws {
        pairs.push(("ws".to_string(), CborValue::Text(ws.clone())));
    }
    if let Some(user) = &header.user {
        pairs.push(("user".to_string(), json_to_cbor(user)));
    }
    for (k, v) in &header.extra {
        pairs.push((k.clone(), json_to_cbor(v)));
    }

    let mut header_bytes = Vec::new();
    ciborium::into_writer(&pairs, &mut header_bytes)
        .map_err(|e| RouterError::MalformedFrame(format!("header encode: {e}")))?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode a full frame in one call.
pub fn encode_frame(frame: &Frame) -> RouterResult<Vec<u8>> {
    encode(&frame.header, &frame.payload)
}

fn cbor_to_string(v: &CborValue) -> RouterResult<String> {
    v.as_text()
        .map(|s| s.to_string())
        .ok_or_else(|| RouterError::MalformedFrame("expected string field".into()))
}

// serde_json::Value <-> ciborium::Value bridge. Frame headers carry small,
// JSON-shaped metadata (ids, user claims), so round-tripping through JSON's
// data model is sufficient and keeps the rest of the codebase in
// serde_json::Value rather than introducing a second value type everywhere.
fn cbor_to_json(v: &CborValue) -> RouterResult<serde_json::Value> {
    serde_json::to_value(CborValueSer(v.clone()))
        .map_err(|e| RouterError::MalformedFrame(format!("header value: {e}")))
}

fn json_to_cbor(v: &serde_json::Value) -> CborValue {
    // serde_json::Value serializes losslessly into ciborium's data model.
    ciborium::value::Value::serialized(v).unwrap_or(CborValue::Null)
}

/// Helper newtype so ciborium::Value re-serializes through serde into
/// serde_json::Value (ciborium::Value already implements Serialize).
struct CborValueSer(CborValue);

impl Serialize for CborValueSer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CborValueSer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        CborValue::deserialize(deserializer).map(CborValueSer)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_no_rewrites_is_byte_identical() {
        let header = FrameHeader {
            from: "default/client-1".into(),
            to: "default/workspace-manager:default".into(),
            ws: Some("default".into()),
            user: Some(serde_json::json!({"id": "anon-1"})),
            extra: vec![("id".to_string(), serde_json::json!(42))],
        };
        let payload = b"opaque-msgpack-rpc-bytes".to_vec();
        let encoded = encode(&header, &payload).unwrap();
        let decoded = decode(&encoded).unwrap();
        let re_encoded = encode(&decoded.header, &decoded.payload).unwrap();
        assert_eq!(encoded, re_encoded);
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn decode_rejects_truncated_length_prefix() {
        assert!(decode(&[0, 0]).is_err());
    }

    #[test]
    fn decode_rejects_header_longer_than_frame() {
        let mut bytes = 1000u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"short");
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_missing_from_or_to() {
        let pairs: Vec<(String, CborValue)> =
            vec![("to".to_string(), CborValue::Text("x/y".into()))];
        let mut header_bytes = Vec::new();
        ciborium::into_writer(&pairs, &mut header_bytes).unwrap();
        let mut bytes = (header_bytes.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&header_bytes);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn extra_fields_are_preserved_in_order() {
        let header = FrameHeader {
            from: "a/b".into(),
            to: "c/d".into(),
            ws: None,
            user: None,
            extra: vec![
                ("z".to_string(), serde_json::json!(1)),
                ("a".to_string(), serde_json::json!(2)),
            ],
        };
        let encoded = encode(&header, b"").unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.header.extra[0].0, "z");
        assert_eq!(decoded.header.extra[1].0, "a");
    }

    #[test]
    fn rewriting_from_to_preserves_extra_and_payload() {
        let mut header = FrameHeader::new("ws-1/client-1", "ws-1/client-2");
        header.extra.push(("id".to_string(), serde_json::json!(7)));
        let payload = b"payload-bytes".to_vec();
        let encoded = encode(&header, &payload).unwrap();
        let mut decoded = decode(&encoded).unwrap();

        decoded.header.from = "ws-1/client-1".into();
        decoded.header.to = "ws-2/client-9".into();
        decoded.header.ws = Some("ws-2".into());

        let re = encode(&decoded.header, &decoded.payload).unwrap();
        let re_decoded = decode(&re).unwrap();
        assert_eq!(re_decoded.header.to, "ws-2/client-9");
        assert_eq!(re_decoded.header.ws.as_deref(), Some("ws-2"));
        assert_eq!(re_decoded.header.extra, decoded.header.extra);
        assert_eq!(re_decoded.payload, payload);
    }
}
