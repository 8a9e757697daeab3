// Copyright 2020 Joyent, Inc.

//! Framing used to carry many conversations over one TCP connection.
//!
//! Each frame has the following structure:
//!
//! * VERSION   1-byte integer. The only supported value is "1".
//!
//! * TYPE      1-byte integer:
//!
//!     * FRAME_OPEN        0x1  open request from the client
//!
//!     * FRAME_OPENED      0x2  successful open response
//!
//!     * FRAME_OPEN_FAILED 0x3  failed open response
//!
//!     * FRAME_ENVELOPE    0x4  one conversation envelope, either direction
//!
//! * CRC1...CRC4    4-byte big-endian unsigned integer holding the CRC16 of
//!                  the body
//!
//! * DLEN1...DLEN4  4-byte big-endian unsigned integer, the number of body
//!                  bytes that follow
//!
//! * DATA0...DATAN  JSON-encoded body

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use crc16::{State, ARC};
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_FRAME_LEN;
use crate::envelope::{ConversationId, MessageEnvelope};
use crate::error::{ConversationError, Result, WireError};
use crate::transport::MessageTransport;

const FP_OFF_VERSION: usize = 0x0;
const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_CRC: usize = 0x2;
const FP_OFF_DATALEN: usize = 0x6;
const FP_OFF_DATA: usize = 0xa;

const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

#[derive(FromPrimitive, ToPrimitive, Clone, Copy, Debug, PartialEq)]
pub enum FrameType {
    Open = 1,
    Opened = 2,
    OpenFailed = 3,
    Envelope = 4,
}

/// Asks the server to start a conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OpenRequest {
    pub service_type_id: String,
    /// Filled in by the server side of a connection; a client cannot speak
    /// for another connection's response transport.
    #[serde(default)]
    pub client_id: String,
    /// Id chosen by the opening side. The server allocates one when absent.
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl OpenRequest {
    pub fn new<S: Into<String>>(service_type_id: S) -> OpenRequest {
        OpenRequest {
            service_type_id: service_type_id.into(),
            client_id: String::new(),
            conversation_id: None,
            session_token: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationStart {
    pub conversation_id: ConversationId,
    /// The service type's client timeout, suggested as receive deadline.
    pub client_timeout_millis: u64,
    /// Conversations waiting for a worker when this one was admitted,
    /// counting itself.
    pub work_queue_size_at_startup: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OpenFrame {
    pub request_id: u32,
    pub request: OpenRequest,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OpenedFrame {
    pub request_id: u32,
    pub start: ConversationStart,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OpenFailedFrame {
    pub request_id: u32,
    pub error: WireError,
}

#[derive(Clone, Debug)]
pub enum Frame {
    Open(OpenFrame),
    Opened(OpenedFrame),
    OpenFailed(OpenFailedFrame),
    Envelope(MessageEnvelope),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Open(_) => FrameType::Open,
            Frame::Opened(_) => FrameType::Opened,
            Frame::OpenFailed(_) => FrameType::OpenFailed,
            Frame::Envelope(_) => FrameType::Envelope,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Frame::Open(f) => serde_json::to_vec(f)?,
            Frame::Opened(f) => serde_json::to_vec(f)?,
            Frame::OpenFailed(f) => serde_json::to_vec(f)?,
            Frame::Envelope(e) => serde_json::to_vec(e)?,
        };
        Ok(body)
    }

    fn decode_body(frame_type: FrameType, body: &[u8]) -> Result<Frame> {
        let frame = match frame_type {
            FrameType::Open => Frame::Open(serde_json::from_slice(body)?),
            FrameType::Opened => Frame::Opened(serde_json::from_slice(body)?),
            FrameType::OpenFailed => Frame::OpenFailed(serde_json::from_slice(body)?),
            FrameType::Envelope => Frame::Envelope(serde_json::from_slice(body)?),
        };
        Ok(frame)
    }
}

pub struct ConversationCodec {
    max_frame_len: usize,
}

impl ConversationCodec {
    pub fn new(max_frame_len: usize) -> ConversationCodec {
        ConversationCodec { max_frame_len }
    }
}

impl Default for ConversationCodec {
    fn default() -> Self {
        ConversationCodec::new(DEFAULT_MAX_FRAME_LEN)
    }
}

fn protocol_error<S: Into<String>>(msg: S) -> ConversationError {
    ConversationError::Protocol(msg.into())
}

impl Decoder for ConversationCodec {
    type Item = Frame;
    type Error = ConversationError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < FP_HEADER_SZ {
            return Ok(None);
        }

        if buf[FP_OFF_VERSION] != FP_VERSION_CURRENT {
            return Err(protocol_error(format!(
                "unsupported frame version {}",
                buf[FP_OFF_VERSION]
            )));
        }
        let frame_type: FrameType = FromPrimitive::from_u8(buf[FP_OFF_TYPE])
            .ok_or_else(|| protocol_error(format!("unknown frame type {}", buf[FP_OFF_TYPE])))?;
        let expected_crc = BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
        let data_len = BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4]) as usize;

        if data_len > self.max_frame_len {
            return Err(protocol_error(format!(
                "frame of {} bytes exceeds limit of {}",
                data_len, self.max_frame_len
            )));
        }
        if buf.len() < FP_HEADER_SZ + data_len {
            buf.reserve(FP_HEADER_SZ + data_len - buf.len());
            return Ok(None);
        }

        buf.advance(FP_HEADER_SZ);
        let body = buf.split_to(data_len);
        let crc = u32::from(State::<ARC>::calculate(&body));
        if crc != expected_crc {
            return Err(protocol_error("calculated CRC does not match the provided CRC"));
        }
        Frame::decode_body(frame_type, &body).map(Some)
    }
}

impl Encoder<Frame> for ConversationCodec {
    type Error = ConversationError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<()> {
        let frame_type = ToPrimitive::to_u8(&frame.frame_type())
            .ok_or_else(|| protocol_error("invalid frame type"))?;
        let body = frame.encode_body()?;
        if body.len() > self.max_frame_len {
            return Err(protocol_error(format!(
                "frame of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame_len
            )));
        }
        buf.reserve(FP_HEADER_SZ + body.len());
        buf.put_u8(FP_VERSION_CURRENT);
        buf.put_u8(frame_type);
        buf.put_u32(u32::from(State::<ARC>::calculate(&body)));
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(())
    }
}

/// Sends envelopes as frames through a connection's writer task.
#[derive(Clone)]
pub struct FrameTransport {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameTransport {
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> FrameTransport {
        FrameTransport { tx }
    }

    pub fn into_shared(self) -> Arc<dyn MessageTransport> {
        Arc::new(self)
    }
}

impl MessageTransport for FrameTransport {
    fn send(&self, envelope: MessageEnvelope) -> Result<()> {
        self.tx
            .send(Frame::Envelope(envelope))
            .map_err(|_| ConversationError::Transport(String::from("connection closed")))
    }
}
