// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for agent RPC streams.
//!
//! Each bidirectional QUIC stream carries one request frame and one reply
//! frame. A frame is a fixed header followed by a protobuf payload:
//!
//! ```text
//! +----------------+-------------+---------------------+
//! | length: u32 BE | kind: u16 BE| payload (length B)  |
//! +----------------+-------------+---------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload either side accepts (64 MB).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    /// The peer could not process the request at all; payload is an `RpcError`.
    Error = 3,
}

impl MessageType {
    fn from_wire(value: u16) -> Result<Self, FrameError> {
        Ok(match value {
            1 => Self::Request,
            2 => Self::Response,
            3 => Self::Error,
            other => return Err(FrameError::UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge(usize),

    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("stream closed before a frame arrived")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    len: usize,
    kind: MessageType,
}

impl Header {
    fn parse(raw: [u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(len));
        }
        let kind = MessageType::from_wire(u16::from_be_bytes([raw[4], raw[5]]))?;
        Ok(Self { len, kind })
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len as u32);
        buf.put_u16(self.kind as u16);
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::encode_message(MessageType::Request, msg)
    }

    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::encode_message(MessageType::Response, msg)
    }

    pub fn error<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::encode_message(MessageType::Error, msg)
    }

    fn encode_message<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let len = msg.encoded_len();
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(len));
        }
        Ok(Self {
            message_type,
            payload: msg.encode_to_vec().into(),
        })
    }

    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        M::decode(self.payload.as_ref()).map_err(FrameError::from)
    }

    /// Header and payload as one contiguous buffer.
    pub fn to_wire(&self) -> Bytes {
        let header = Header {
            len: self.payload.len(),
            kind: self.message_type,
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + header.len);
        header.put(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.to_wire()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. EOF before any header byte maps to [`FrameError::Closed`];
/// EOF anywhere later is an I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut raw = [0u8; HEADER_LEN];
    let first = reader.read(&mut raw).await?;
    if first == 0 {
        return Err(FrameError::Closed);
    }
    reader.read_exact(&mut raw[first..]).await?;
    let header = Header::parse(raw)?;

    let mut payload = BytesMut::zeroed(header.len);
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type: header.kind,
        payload: payload.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_proto::{AgentRequest, PingRequest, RpcError, agent_request};

    fn ping(token: &str) -> AgentRequest {
        AgentRequest {
            token: token.to_string(),
            request: Some(agent_request::Request::Ping(PingRequest {})),
        }
    }

    #[test]
    fn test_header_is_big_endian() {
        let frame = Frame::request(&ping("token")).unwrap();
        let wire = frame.to_wire();

        assert_eq!(&wire[..4], &(frame.payload.len() as u32).to_be_bytes());
        assert_eq!(&wire[4..6], &[0, 1]);
        assert_eq!(wire.len(), HEADER_LEN + frame.payload.len());
    }

    #[test]
    fn test_payload_limit_is_64_mb() {
        assert_eq!(MAX_PAYLOAD_LEN, 67_108_864);
        let mut raw = [0u8; HEADER_LEN];
        raw[..4].copy_from_slice(&(MAX_PAYLOAD_LEN as u32).to_be_bytes());
        raw[5] = 2;
        assert_eq!(Header::parse(raw).unwrap().len, MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let mut raw = [0u8; HEADER_LEN];
        raw[5] = 9;
        assert!(matches!(
            Header::parse(raw),
            Err(FrameError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_header_rejects_oversized_length() {
        let mut raw = [0u8; HEADER_LEN];
        raw[..4].copy_from_slice(&((MAX_PAYLOAD_LEN + 1) as u32).to_be_bytes());
        raw[5] = 1;
        match Header::parse(raw) {
            Err(FrameError::PayloadTooLarge(len)) => assert_eq!(len, MAX_PAYLOAD_LEN + 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_payload_is_io_error() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        let mut buf = BytesMut::new();
        Header {
            len: 10,
            kind: MessageType::Response,
        }
        .put(&mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        writer.write_all(&buf).await.unwrap();
        drop(writer);

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_read_write_frames_over_duplex() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);

        let error = RpcError {
            code: "UNAUTHENTICATED".to_string(),
            message: "token mismatch".to_string(),
        };
        write_frame(&mut writer, &Frame::request(&ping("abc")).unwrap())
            .await
            .unwrap();
        write_frame(&mut writer, &Frame::error(&error).unwrap())
            .await
            .unwrap();
        drop(writer);

        let first = read_frame(&mut reader).await.unwrap();
        assert_eq!(first.message_type, MessageType::Request);
        let decoded: AgentRequest = first.decode().unwrap();
        assert_eq!(decoded.token, "abc");

        let second = read_frame(&mut reader).await.unwrap();
        assert_eq!(second.message_type, MessageType::Error);
        let decoded: RpcError = second.decode().unwrap();
        assert_eq!(decoded.message, "token mismatch");

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Closed)
        ));
    }
}
