//! JSON-RPC framing for the OVSDB wire protocol.
//!
//! OVSDB concatenates JSON values on the stream with no delimiter, so frames
//! are recovered by incremental parsing: bytes accumulate in a buffer and
//! complete values are split off as soon as they parse.

use serde_json::Value;

use crate::{OvsError, OvsResult};

/// Incremental decoder for concatenated JSON values.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the stream.
    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extracts the next complete JSON value, or `None` if the buffer holds
    /// only a partial frame.
    pub(crate) fn next_frame(&mut self) -> OvsResult<Option<Value>> {
        // Skip any inter-frame whitespace so byte_offset stays accurate.
        let start = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        self.buf.drain(..start);
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        match iter.next() {
            Some(Ok(value)) => {
                let consumed = iter.byte_offset();
                self.buf.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(OvsError::protocol(format!("invalid frame: {}", e))),
            None => Ok(None),
        }
    }
}

/// An incoming message, classified.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Reply to one of our requests.
    Reply {
        id: u64,
        result: Value,
        error: Value,
    },
    /// Server-initiated request that must be answered (`echo`).
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Notification (`update`); no reply expected.
    Notification { method: String, params: Value },
}

/// Classifies a decoded frame.
pub(crate) fn classify(value: Value) -> OvsResult<Incoming> {
    let obj = value
        .as_object()
        .ok_or_else(|| OvsError::protocol("message is not an object"))?;

    match obj.get("method").and_then(Value::as_str) {
        Some(method) => {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            let params = obj.get("params").cloned().unwrap_or(Value::Null);
            if id.is_null() {
                Ok(Incoming::Notification {
                    method: method.to_string(),
                    params,
                })
            } else {
                Ok(Incoming::Request {
                    id,
                    method: method.to_string(),
                    params,
                })
            }
        }
        None => {
            let id = obj
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| OvsError::protocol("reply without numeric id"))?;
            Ok(Incoming::Reply {
                id,
                result: obj.get("result").cloned().unwrap_or(Value::Null),
                error: obj.get("error").cloned().unwrap_or(Value::Null),
            })
        }
    }
}

/// Serializes a request frame.
pub(crate) fn request_frame(id: u64, method: &str, params: &Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "method": method,
        "params": params,
        "id": id,
    }))
    .expect("request serialization cannot fail")
}

/// Serializes the reply to a server-initiated request (echo keep-alive).
pub(crate) fn reply_frame(id: &Value, result: &Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "result": result,
        "error": null,
        "id": id,
    }))
    .expect("reply serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decoder_single_frame() {
        let mut dec = FrameDecoder::new();
        dec.extend(br#"{"id":1,"result":[],"error":null}"#);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame["id"], 1);
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_decoder_partial_then_complete() {
        let mut dec = FrameDecoder::new();
        dec.extend(br#"{"id":1,"re"#);
        assert!(dec.next_frame().unwrap().is_none());
        dec.extend(br#"sult":null,"error":null}"#);
        assert!(dec.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_decoder_concatenated_frames() {
        let mut dec = FrameDecoder::new();
        dec.extend(br#"{"id":1,"result":null,"error":null}{"id":2,"result":null,"error":null}"#);
        assert_eq!(dec.next_frame().unwrap().unwrap()["id"], 1);
        assert_eq!(dec.next_frame().unwrap().unwrap()["id"], 2);
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut dec = FrameDecoder::new();
        dec.extend(b"not json at all");
        assert!(dec.next_frame().is_err());
    }

    #[test]
    fn test_classify_reply() {
        let msg = json!({"id": 7, "result": ["ok"], "error": null});
        match classify(msg).unwrap() {
            Incoming::Reply { id, result, error } => {
                assert_eq!(id, 7);
                assert_eq!(result, json!(["ok"]));
                assert!(error.is_null());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_classify_echo_request() {
        let msg = json!({"id": "echo", "method": "echo", "params": []});
        match classify(msg).unwrap() {
            Incoming::Request { id, method, .. } => {
                assert_eq!(id, json!("echo"));
                assert_eq!(method, "echo");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_classify_update_notification() {
        let msg = json!({"id": null, "method": "update", "params": [null, {}]});
        match classify(msg).unwrap() {
            Incoming::Notification { method, .. } => assert_eq!(method, "update"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_request_frame_shape() {
        let frame = request_frame(3, "transact", &json!(["Open_vSwitch"]));
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["method"], "transact");
        assert_eq!(value["id"], 3);
    }
}
