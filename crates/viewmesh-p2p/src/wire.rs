//! Wire envelope exchanged between view sessions.
//!
//! Binary format uses postcard. Each message on the wire is:
//! [u32 LE length][postcard bytes]. The framing helpers feed the
//! bandwidth counters with `4 + len` per message.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::metrics::BandwidthMetrics;

/// Maximum message size (16 MB).
pub const MAX_MSG_SIZE: u32 = 16 * 1024 * 1024;

/// Outcome carried by a message: a regular payload, or an
/// application-level failure signalled distinctly from transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
}

/// A single unit of session traffic. Immutable once built; routed on the
/// receiving side by the (`session_id`, `context_id`) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub session_id: String,
    pub context_id: String,
    pub caller: String,
    /// Identifier of the sending endpoint.
    pub from_endpoint: String,
    /// Public-key identifier of the sending endpoint.
    pub from_pkid: Vec<u8>,
    pub status: Status,
    pub payload: Vec<u8>,
}

/// Encode a message and enforce the size guard.
pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    let bytes = postcard::to_allocvec(msg).map_err(|e| Error::Transport(e.to_string()))?;
    if bytes.len() as u32 > MAX_MSG_SIZE {
        return Err(Error::Transport(format!(
            "message too large: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decode one postcard-encoded message.
pub fn decode(bytes: &[u8]) -> Result<Message, Error> {
    postcard::from_bytes(bytes).map_err(|e| Error::Transport(e.to_string()))
}

/// Write a length-prefixed message to a send stream.
pub async fn write_msg(
    stream: &mut iroh::endpoint::SendStream,
    msg: &Message,
    metrics: &BandwidthMetrics,
) -> Result<(), Error> {
    let bytes = encode(msg)?;
    let len = bytes.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    stream
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    metrics.record_sent(4 + len as u64);
    Ok(())
}

/// Read a length-prefixed message from a recv stream.
pub async fn read_msg(
    stream: &mut iroh::endpoint::RecvStream,
    metrics: &BandwidthMetrics,
) -> Result<Message, Error> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_MSG_SIZE {
        return Err(Error::Transport(format!("message too large: {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    metrics.record_received(4 + len as u64);
    decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: Status, payload: &[u8]) -> Message {
        Message {
            session_id: "sid-1".into(),
            context_id: "ctx-1".into(),
            caller: "alice".into(),
            from_endpoint: "endpoint-1".into(),
            from_pkid: vec![1, 2, 3],
            status,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn envelope_round_trips() {
        let msg = sample(Status::Ok, b"hello");
        let bytes = encode(&msg).expect("encode");
        let decoded = decode(&bytes).expect("decode");

        assert_eq!(decoded.session_id, "sid-1");
        assert_eq!(decoded.context_id, "ctx-1");
        assert_eq!(decoded.caller, "alice");
        assert_eq!(decoded.from_endpoint, "endpoint-1");
        assert_eq!(decoded.from_pkid, vec![1, 2, 3]);
        assert_eq!(decoded.status, Status::Ok);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn error_status_survives_encoding() {
        let msg = sample(Status::Error, b"boom");
        let decoded = decode(&encode(&msg).expect("encode")).expect("decode");
        assert_eq!(decoded.status, Status::Error);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let msg = sample(Status::Ok, &vec![0u8; MAX_MSG_SIZE as usize + 1]);
        let err = encode(&msg).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
