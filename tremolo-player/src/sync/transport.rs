//! TCP transport framing
//!
//! Frames carry the same (topic, encoded payload) pairs on both roles:
//! a u32 little-endian length prefix followed by a codec-encoded body.
//! A malformed frame is fatal for the stream; a malformed payload inside
//! a well-formed Publish is dropped per-message by the receive loops.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tremolo_common::codec::{DecodeError, WireReader, WireWriter};

use crate::error::{Error, Result};

/// Upper bound on a single frame, guarding against absurd allocations
/// from a corrupt or hostile length prefix.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Delivery guarantee for a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Best effort, no acknowledgment (live audio chunks)
    AtMostOnce,
    /// Acknowledged, retried on timeout, possibly duplicated
    AtLeastOnce,
}

impl QoS {
    fn to_wire(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }

    fn from_wire(tag: u8) -> std::result::Result<Self, DecodeError> {
        match tag {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            _ => Err(DecodeError::UnknownTag {
                kind: "QoS",
                tag: tag as i32,
            }),
        }
    }
}

/// One publishable unit: a topic plus its encoded payload and delivery
/// flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Transport frames exchanged over the persistent stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Publish { id: u32, message: WireMessage },
    Ack { id: u32 },
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
}

const KIND_PUBLISH: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_SUBSCRIBE: u8 = 3;
const KIND_UNSUBSCRIBE: u8 = 4;

impl Frame {
    /// Encode the frame body (without the length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            Frame::Publish { id, message } => {
                w.push_u8(KIND_PUBLISH);
                w.push_i32(*id as i32);
                w.push_u8(message.qos.to_wire());
                w.push_bool(message.retain);
                w.push_string(&message.topic);
                w.push_blob(&message.payload);
            }
            Frame::Ack { id } => {
                w.push_u8(KIND_ACK);
                w.push_i32(*id as i32);
            }
            Frame::Subscribe { topics } => {
                w.push_u8(KIND_SUBSCRIBE);
                w.push_strings(Some(topics));
            }
            Frame::Unsubscribe { topics } => {
                w.push_u8(KIND_UNSUBSCRIBE);
                w.push_strings(Some(topics));
            }
        }
        w.into_vec()
    }

    /// Decode a frame body.
    pub fn decode(body: &[u8]) -> std::result::Result<Frame, DecodeError> {
        let mut r = WireReader::new(body);
        match r.read_u8()? {
            KIND_PUBLISH => {
                let id = r.read_i32()? as u32;
                let qos = QoS::from_wire(r.read_u8()?)?;
                let retain = r.read_bool()?;
                let topic = r.read_string()?;
                let payload = r.read_blob()?;
                Ok(Frame::Publish {
                    id,
                    message: WireMessage {
                        topic,
                        payload,
                        qos,
                        retain,
                    },
                })
            }
            KIND_ACK => Ok(Frame::Ack {
                id: r.read_i32()? as u32,
            }),
            KIND_SUBSCRIBE => Ok(Frame::Subscribe {
                topics: r
                    .read_strings()?
                    .ok_or(DecodeError::UnexpectedNull("topic list"))?,
            }),
            KIND_UNSUBSCRIBE => Ok(Frame::Unsubscribe {
                topics: r
                    .read_strings()?
                    .ok_or(DecodeError::UnexpectedNull("topic list"))?,
            }),
            kind => Err(DecodeError::UnknownTag {
                kind: "frame",
                tag: kind as i32,
            }),
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(stream: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode();
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(Error::Transport(format!(
            "outbound frame of {} bytes exceeds the frame cap",
            body.len()
        )));
    }
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. A clean EOF (or a reset) surfaces as
/// [`Error::ConnectionClosed`]; a bad length prefix or undecodable body is
/// a transport error and fatal for the stream.
pub async fn read_frame<R>(stream: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_bytes).await {
        return Err(closed_or_io(e));
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(Error::Transport(format!(
            "inbound frame length {len} exceeds the frame cap"
        )));
    }
    let mut body = vec![0u8; len as usize];
    if let Err(e) = stream.read_exact(&mut body).await {
        return Err(closed_or_io(e));
    }
    Frame::decode(&body).map_err(|e| Error::Transport(format!("bad frame: {e}")))
}

fn closed_or_io(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
        _ => Error::Io(e),
    }
}
