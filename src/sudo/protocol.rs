// src/sudo/protocol.rs

//! Wire format between the sudo client and the helper process
//!
//! Every datagram is one frame:
//!
//! ```text
//! +------+-----------+-------+-------------+---------+
//! | tag  | u32 LE    | error | u32 LE      | payload |
//! | 4 B  | error len | UTF-8 | payload len | JSON    |
//! +------+-----------+-------+-------------+---------+
//! ```
//!
//! Requests carry the tag `RQST` and an empty error. Replies carry `RPLY`, the
//! error message of a failed operation (empty on success) and the reply value.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Tag of a request frame
pub const REQUEST_TAG: [u8; 4] = *b"RQST";
/// Tag of a reply frame
pub const REPLY_TAG: [u8; 4] = *b"RPLY";
/// Size of the receive buffer on both ends
pub const RECV_BUFFER_SIZE: usize = 8 * 1024;

/// Protocol-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected frame tag {0:?}")]
    BadTag([u8; 4]),

    #[error("truncated frame ({0} bytes)")]
    Truncated(usize),

    #[error("frame exceeds {RECV_BUFFER_SIZE} bytes")]
    TooLarge,

    #[error("unknown function '{0}' called in SudoServer")]
    UnknownFunction(String),

    #[error("invalid payload: {0}")]
    Payload(String),
}

/// The closed set of privileged operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SudoRequest {
    AttachLoopback {
        image: PathBuf,
        read_only: bool,
    },
    DetachLoopback {
        device: String,
    },
    Mount {
        device: String,
        mount_point: PathBuf,
        read_only: bool,
        fstype: String,
    },
    Unmount {
        mount_point: PathBuf,
        force: bool,
    },
    Mkfs {
        device: String,
        fstype: String,
        options: Vec<String>,
    },
    RemoveRecursive {
        path: PathBuf,
    },
    SetOwnerAndPermissionsRecursive {
        path: PathBuf,
        uid: u32,
        gid: u32,
        mode: u32,
    },
    StopServer,
}

impl SudoRequest {
    /// Serde discriminants of all known operations
    pub const OPERATIONS: [&'static str; 8] = [
        "attach_loopback",
        "detach_loopback",
        "mount",
        "unmount",
        "mkfs",
        "remove_recursive",
        "set_owner_and_permissions_recursive",
        "stop_server",
    ];
}

/// Value returned for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SudoReply {
    /// The operation failed or has no result
    Empty,
    /// The operation succeeded
    Done,
    /// Device node returned by `attach_loopback`
    Device(String),
}

/// Encode a frame
pub fn encode_frame(tag: [u8; 4], error: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let size = 4 + 4 + error.len() + 4 + payload.len();
    if size > RECV_BUFFER_SIZE {
        return Err(ProtocolError::TooLarge);
    }

    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&tag);
    frame.extend_from_slice(&(error.len() as u32).to_le_bytes());
    frame.extend_from_slice(error.as_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a frame, checking its tag. Returns the error string and payload.
pub fn decode_frame(frame: &[u8], expected_tag: [u8; 4]) -> Result<(String, &[u8]), ProtocolError> {
    if frame.len() < 12 {
        return Err(ProtocolError::Truncated(frame.len()));
    }

    let mut tag = [0u8; 4];
    tag.copy_from_slice(&frame[..4]);
    if tag != expected_tag {
        return Err(ProtocolError::BadTag(tag));
    }

    let (error, rest) = take_chunk(&frame[4..], frame.len())?;
    let (payload, rest) = take_chunk(rest, frame.len())?;
    if !rest.is_empty() {
        return Err(ProtocolError::Payload(format!(
            "{} trailing bytes after payload",
            rest.len()
        )));
    }

    let error = String::from_utf8(error.to_vec())
        .map_err(|e| ProtocolError::Payload(format!("error string is not UTF-8: {}", e)))?;
    Ok((error, payload))
}

fn take_chunk(data: &[u8], frame_len: usize) -> Result<(&[u8], &[u8]), ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::Truncated(frame_len));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&data[..4]);
    let len = u32::from_le_bytes(len) as usize;
    let data = &data[4..];
    if data.len() < len {
        return Err(ProtocolError::Truncated(frame_len));
    }
    Ok(data.split_at(len))
}

/// Encode a request frame
pub fn encode_request(request: &SudoRequest) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        serde_json::to_vec(request).map_err(|e| ProtocolError::Payload(e.to_string()))?;
    encode_frame(REQUEST_TAG, "", &payload)
}

/// Decode a request frame
pub fn decode_request(frame: &[u8]) -> Result<SudoRequest, ProtocolError> {
    let (_, payload) = decode_frame(frame, REQUEST_TAG)?;

    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Payload(e.to_string()))?;
    let op = value
        .get("op")
        .and_then(|op| op.as_str())
        .map(str::to_string);

    serde_json::from_value(value).map_err(|e| match op {
        Some(op) if !SudoRequest::OPERATIONS.contains(&op.as_str()) => {
            ProtocolError::UnknownFunction(op)
        }
        _ => ProtocolError::Payload(e.to_string()),
    })
}

/// Encode a reply frame
pub fn encode_reply(reply: &SudoReply, error: &str) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(reply).map_err(|e| ProtocolError::Payload(e.to_string()))?;
    // An oversized error message must not lose the reply
    match encode_frame(REPLY_TAG, error, &payload) {
        Err(ProtocolError::TooLarge) => {
            let mut cut = RECV_BUFFER_SIZE / 2;
            while !error.is_char_boundary(cut) {
                cut -= 1;
            }
            encode_frame(REPLY_TAG, &error[..cut], &payload)
        }
        other => other,
    }
}

/// Decode a reply frame into the reply value and its error string
pub fn decode_reply(frame: &[u8]) -> Result<(SudoReply, String), ProtocolError> {
    let (error, payload) = decode_frame(frame, REPLY_TAG)?;
    let reply =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Payload(e.to_string()))?;
    Ok((reply, error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_layout() {
        let frame = encode_request(&SudoRequest::StopServer).unwrap();
        assert_eq!(&frame[..4], b"RQST");
        assert_eq!(&frame[4..8], &0u32.to_le_bytes());
        let payload_len = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
        assert_eq!(frame.len(), 12 + payload_len);
        assert_eq!(&frame[12..], br#"{"op":"stop_server"}"#);
    }

    #[test]
    fn test_request_decodes() {
        let request = SudoRequest::SetOwnerAndPermissionsRecursive {
            path: PathBuf::from("/opt/am/apps/com.example.app+"),
            uid: 20001,
            gid: 20000,
            mode: 0o440,
        };
        let frame = encode_request(&request).unwrap();
        assert_eq!(decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn test_reply_carries_error() {
        let frame = encode_reply(&SudoReply::Empty, "mount failed").unwrap();
        let (reply, error) = decode_reply(&frame).unwrap();
        assert_eq!(reply, SudoReply::Empty);
        assert_eq!(error, "mount failed");
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let frame = encode_reply(&SudoReply::Done, "").unwrap();
        assert_eq!(
            decode_request(&frame).unwrap_err(),
            ProtocolError::BadTag(*b"RPLY")
        );
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_request(&SudoRequest::StopServer).unwrap();
        assert!(matches!(
            decode_request(&frame[..frame.len() - 3]),
            Err(ProtocolError::Truncated(_))
        ));
        assert!(matches!(decode_request(b"RQ"), Err(ProtocolError::Truncated(2))));
    }

    #[test]
    fn test_unknown_function() {
        let frame = encode_frame(REQUEST_TAG, "", br#"{"op":"format_disk"}"#).unwrap();
        let err = decode_request(&frame).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownFunction("format_disk".to_string()));
        assert_eq!(
            err.to_string(),
            "unknown function 'format_disk' called in SudoServer"
        );
    }

    #[test]
    fn test_known_function_bad_arguments() {
        let frame = encode_frame(REQUEST_TAG, "", br#"{"op":"mount"}"#).unwrap();
        assert!(matches!(
            decode_request(&frame),
            Err(ProtocolError::Payload(_))
        ));
    }

    #[test]
    fn test_oversized_error_is_cut() {
        let error = "x".repeat(RECV_BUFFER_SIZE * 2);
        let frame = encode_reply(&SudoReply::Empty, &error).unwrap();
        assert!(frame.len() <= RECV_BUFFER_SIZE);
        let (_, decoded) = decode_reply(&frame).unwrap();
        assert_eq!(decoded.len(), RECV_BUFFER_SIZE / 2);
    }
}
