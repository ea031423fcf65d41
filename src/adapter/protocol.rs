//! Wire format for the external-process UDP adapter protocol (spec.md
//! §4.5). Bit-exact: a 16-byte header in network byte order followed by a
//! type-dependent body, capped at 1024 bytes per datagram.

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 16;
pub const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum MsgType {
    Request = 1,
    Accept = 2,
    Reject = 3,
    Data = 4,
    Stop = 5,
    Pause = 6,
    Resume = 7,
}

impl MsgType {
    fn from_u16(v: u16) -> Result<Self> {
        Ok(match v {
            1 => MsgType::Request,
            2 => MsgType::Accept,
            3 => MsgType::Reject,
            4 => MsgType::Data,
            5 => MsgType::Stop,
            6 => MsgType::Pause,
            7 => MsgType::Resume,
            other => return Err(Error::Protocol(format!("unknown msgType {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Request {
        flags: i32,
        schema: String,
        requested_sim_millis: i64,
        interval_millis: i32,
    },
    Accept {
        server_flags: i32,
        sim_millis: i64,
        interval_millis: i32,
        assigned_client_id: i32,
    },
    Reject {
        reason_code: i32,
    },
    Data {
        bytes: Vec<u8>,
    },
    Stop,
    Pause,
    Resume,
}

fn need(body: &[u8], n: usize) -> Result<()> {
    if body.len() < n {
        Err(Error::Protocol(format!(
            "short frame body: need {n} bytes, have {}",
            body.len()
        )))
    } else {
        Ok(())
    }
}

impl FrameBody {
    fn msg_type(&self) -> MsgType {
        match self {
            FrameBody::Request { .. } => MsgType::Request,
            FrameBody::Accept { .. } => MsgType::Accept,
            FrameBody::Reject { .. } => MsgType::Reject,
            FrameBody::Data { .. } => MsgType::Data,
            FrameBody::Stop => MsgType::Stop,
            FrameBody::Pause => MsgType::Pause,
            FrameBody::Resume => MsgType::Resume,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            FrameBody::Request {
                flags,
                schema,
                requested_sim_millis,
                interval_millis,
            } => {
                let schema_bytes = schema.as_bytes();
                let mut buf = Vec::with_capacity(4 + 2 + schema_bytes.len() + 8 + 4);
                buf.extend_from_slice(&flags.to_be_bytes());
                buf.extend_from_slice(&(schema_bytes.len() as u16).to_be_bytes());
                buf.extend_from_slice(schema_bytes);
                buf.extend_from_slice(&requested_sim_millis.to_be_bytes());
                buf.extend_from_slice(&interval_millis.to_be_bytes());
                buf
            }
            FrameBody::Accept {
                server_flags,
                sim_millis,
                interval_millis,
                assigned_client_id,
            } => {
                let mut buf = Vec::with_capacity(4 + 8 + 4 + 4);
                buf.extend_from_slice(&server_flags.to_be_bytes());
                buf.extend_from_slice(&sim_millis.to_be_bytes());
                buf.extend_from_slice(&interval_millis.to_be_bytes());
                buf.extend_from_slice(&assigned_client_id.to_be_bytes());
                buf
            }
            FrameBody::Reject { reason_code } => reason_code.to_be_bytes().to_vec(),
            FrameBody::Data { bytes } => bytes.clone(),
            FrameBody::Stop | FrameBody::Pause | FrameBody::Resume => Vec::new(),
        }
    }

    fn decode(msg_type: MsgType, body: &[u8]) -> Result<Self> {
        match msg_type {
            MsgType::Request => {
                need(body, 4 + 2)?;
                let flags = i32::from_be_bytes(body[0..4].try_into().expect("slice len"));
                let schema_len =
                    u16::from_be_bytes(body[4..6].try_into().expect("slice len")) as usize;
                need(body, 6 + schema_len + 8 + 4)?;
                let schema = String::from_utf8(body[6..6 + schema_len].to_vec())
                    .map_err(|e| Error::Protocol(format!("invalid schema utf8: {e}")))?;
                let off = 6 + schema_len;
                let requested_sim_millis =
                    i64::from_be_bytes(body[off..off + 8].try_into().expect("slice len"));
                let interval_millis =
                    i32::from_be_bytes(body[off + 8..off + 12].try_into().expect("slice len"));
                Ok(FrameBody::Request {
                    flags,
                    schema,
                    requested_sim_millis,
                    interval_millis,
                })
            }
            MsgType::Accept => {
                need(body, 4 + 8 + 4 + 4)?;
                let server_flags = i32::from_be_bytes(body[0..4].try_into().expect("slice len"));
                let sim_millis = i64::from_be_bytes(body[4..12].try_into().expect("slice len"));
                let interval_millis =
                    i32::from_be_bytes(body[12..16].try_into().expect("slice len"));
                let assigned_client_id =
                    i32::from_be_bytes(body[16..20].try_into().expect("slice len"));
                Ok(FrameBody::Accept {
                    server_flags,
                    sim_millis,
                    interval_millis,
                    assigned_client_id,
                })
            }
            MsgType::Reject => {
                need(body, 4)?;
                Ok(FrameBody::Reject {
                    reason_code: i32::from_be_bytes(body[0..4].try_into().expect("slice len")),
                })
            }
            MsgType::Data => Ok(FrameBody::Data {
                bytes: body.to_vec(),
            }),
            MsgType::Stop => Ok(FrameBody::Stop),
            MsgType::Pause => Ok(FrameBody::Pause),
            MsgType::Resume => Ok(FrameBody::Resume),
        }
    }
}

/// One UDP datagram conforming to the adapter protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender_id: i32,
    pub epoch_millis: i64,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(sender_id: i32, epoch_millis: i64, body: FrameBody) -> Self {
        Frame {
            sender_id,
            epoch_millis,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body_bytes = self.body.encode();
        let total = HEADER_LEN + body_bytes.len();
        if total > MAX_DATAGRAM {
            return Err(Error::Protocol(format!(
                "frame of {total} bytes exceeds max datagram {MAX_DATAGRAM}"
            )));
        }
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&(self.body.msg_type() as u16).to_be_bytes());
        buf.extend_from_slice(&(body_bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.sender_id.to_be_bytes());
        buf.extend_from_slice(&self.epoch_millis.to_be_bytes());
        buf.extend_from_slice(&body_bytes);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "frame shorter than the {HEADER_LEN}-byte header: {} bytes",
                bytes.len()
            )));
        }
        let msg_type = MsgType::from_u16(u16::from_be_bytes(
            bytes[0..2].try_into().expect("slice len"),
        ))?;
        // msgLen (bytes[2..4]) is informational only -- 0 means "variable,
        // implied by UDP length" (spec.md §4.5); the body is always
        // everything after the header, never cross-checked against it.
        let sender_id = i32::from_be_bytes(bytes[4..8].try_into().expect("slice len"));
        let epoch_millis = i64::from_be_bytes(bytes[8..16].try_into().expect("slice len"));
        let body = FrameBody::decode(msg_type, &bytes[HEADER_LEN..])?;
        Ok(Frame {
            sender_id,
            epoch_millis,
            body,
        })
    }
}
