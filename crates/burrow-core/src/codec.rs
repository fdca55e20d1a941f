//! JSON text codec for control frames.
//!
//! One frame per WebSocket text message; framing is delimited by the
//! underlying message boundary, so there is no length prefix.

use crate::error::{TunnelError, TunnelResult};
use crate::frames::Frame;

/// Encode a frame as a single JSON text message.
pub fn encode_frame(frame: &Frame) -> TunnelResult<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode one JSON text message into a frame.
///
/// A well-formed object whose `type` tag this implementation does not know
/// yields [`TunnelError::UnknownFrameType`] so callers can log and drop it
/// without tearing down the session.
pub fn decode_frame(text: &str) -> TunnelResult<Frame> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let tag = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| TunnelError::Codec("frame missing \"type\" field".into()))?
        .to_string();

    match serde_json::from_value::<Frame>(value) {
        Ok(frame) => Ok(frame),
        Err(_) if !Frame::KNOWN_TYPES.contains(&tag.as_str()) => {
            Err(TunnelError::UnknownFrameType(tag))
        }
        Err(e) => Err(TunnelError::Codec(format!("malformed {tag} frame: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{RegisterPayload, TcpDataPayload};

    #[test]
    fn round_trip() {
        let frame = Frame::Register {
            payload: RegisterPayload {
                subdomain: None,
                local_port: 3000,
                local_host: Some("localhost".into()),
                password: None,
                protocol: None,
            },
        };
        let text = encode_frame(&frame).unwrap();
        match decode_frame(&text).unwrap() {
            Frame::Register { payload } => {
                assert_eq!(payload.local_port, 3000);
                assert_eq!(payload.local_host.as_deref(), Some("localhost"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn tcp_data_round_trip() {
        let frame = Frame::TcpData {
            connection_id: 12,
            payload: TcpDataPayload::from_bytes(b"hello\n"),
        };
        let text = encode_frame(&frame).unwrap();
        match decode_frame(&text).unwrap() {
            Frame::TcpData {
                connection_id,
                payload,
            } => {
                assert_eq!(connection_id, 12);
                assert_eq!(payload.to_bytes().unwrap(), b"hello\n");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_distinguished() {
        let err = decode_frame(r#"{"type":"shutdown","payload":{}}"#).unwrap_err();
        match err {
            TunnelError::UnknownFrameType(tag) => assert_eq!(tag, "shutdown"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_known_type_is_codec_error() {
        // `request` without its correlation id is malformed, not unknown.
        let err = decode_frame(r#"{"type":"request","payload":{}}"#).unwrap_err();
        assert!(matches!(err, TunnelError::Codec(_)));
    }

    #[test]
    fn missing_type_is_codec_error() {
        let err = decode_frame(r#"{"payload":{}}"#).unwrap_err();
        assert!(matches!(err, TunnelError::Codec(_)));
    }

    #[test]
    fn invalid_json_is_codec_error() {
        assert!(matches!(
            decode_frame("not json").unwrap_err(),
            TunnelError::Codec(_)
        ));
    }
}
