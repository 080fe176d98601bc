//! Replication wire messages and length-prefixed frame codec.
//!
//! A frame is a 4-byte big-endian payload length followed by the
//! bincode-encoded [`Message`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tollgate_reputation::{NodeId, ReputationEvent, UserId};

use crate::error::{ReplError, Result};
use crate::views::NodeReputationView;

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest accepted payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Events pushed to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushBatch {
    /// Sender.
    pub from: NodeId,
    /// Replicable events, oldest first.
    pub events: Vec<ReputationEvent>,
    /// Sender's views of the users those events touched.
    pub views: Vec<NodeReputationView>,
}

/// Receiver's answer to a [`PushBatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// Events applied for the first time.
    pub applied: u32,
    /// Events whose hash was already present.
    pub duplicates: u32,
    /// Events refused (bad hash).
    pub rejected: u32,
}

/// Request for a peer's events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Requester; its own events are filtered out of the answer.
    pub from: NodeId,
    /// Return events with a larger id on the peer.
    pub after_id: u64,
    /// Maximum number of events to scan.
    pub limit: u32,
}

/// Answer to a [`PullRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PulledEvents {
    /// Replicable events, oldest first.
    pub events: Vec<ReputationEvent>,
    /// Highest id scanned; the requester's next cursor.
    pub last_id: u64,
    /// Responder's views of the users those events touched.
    pub views: Vec<NodeReputationView>,
}

/// A resolved score broadcast to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveNotice {
    /// Node that ran the resolve.
    pub from: NodeId,
    /// The user.
    pub user_id: UserId,
    /// Agreed score.
    pub score: f64,
    /// Surviving authoritative node, if any.
    pub authority: Option<NodeId>,
    /// When the resolve ran.
    pub timestamp_ms: u64,
}

/// Every message exchanged between replicators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Request: apply these events.
    Push(PushBatch),
    /// Request: send me your events.
    Pull(PullRequest),
    /// Request: adopt this resolved score.
    Resolve(ResolveNotice),
    /// Reply to `Push` or `Resolve`.
    Ack(PushAck),
    /// Reply to `Pull`.
    Events(PulledEvents),
    /// Reply when the request could not be served.
    Error {
        /// What went wrong.
        msg: String,
    },
}

impl Message {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Push(_) => "push",
            Message::Pull(_) => "pull",
            Message::Resolve(_) => "resolve",
            Message::Ack(_) => "ack",
            Message::Events(_) => "events",
            Message::Error { .. } => "error",
        }
    }

    /// Encode into one frame.
    pub fn encode(&self) -> Result<Bytes> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ReplError::Protocol {
                msg: format!("frame of {} bytes exceeds {}", payload.len(), MAX_FRAME_SIZE),
            });
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode a frame payload (without the length prefix).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Write one message as a frame.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ReplError::Protocol {
            msg: format!("frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE),
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Message::decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_reputation::{EventType, NewEvent};

    fn event() -> ReputationEvent {
        NewEvent::new("u1", EventType::Violation, -15.0, 1_000)
            .with_severity(3)
            .into_event(7, "node-a")
    }

    #[test]
    fn test_frame_has_length_prefix() {
        let msg = Message::Pull(PullRequest {
            from: "a".into(),
            after_id: 3,
            limit: 10,
        });
        let frame = msg.encode().unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_SIZE);
        assert_eq!(Message::decode(&frame[FRAME_HEADER_SIZE..]).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Message::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let push = Message::Push(PushBatch {
            from: "a".into(),
            events: vec![event()],
            views: vec![],
        });
        write_message(&mut client, &push).await.unwrap();
        write_message(&mut client, &Message::Error { msg: "x".into() }).await.unwrap();
        assert_eq!(read_message(&mut server).await.unwrap(), push);
        assert_eq!(read_message(&mut server).await.unwrap().kind(), "error");
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_message(&mut server).await,
            Err(ReplError::Protocol { .. })
        ));
    }
}
