//! Frames exchanged between peers.
//!
//! Every frame starts with a 4 byte header, the message kind and an error
//! code, both little-endian `u16`. The payload that follows depends on the
//! kind, see [`FrameCodec`] for the exact layouts.
mod codec;

pub use codec::*;

use crate::hash::HexHash;

/// Size of the kind + error header.
pub const HEADER_LEN: usize = 4;
/// Most file bytes a single RES frame carries.
pub const DATA_MAX: usize = 4092;
/// Size of the identifier field, NUL padded.
pub const IDENT_LEN: usize = 1024;
/// offset(4) size(4) hash(64) ident(1024)
pub const REQ_PAYLOAD_LEN: usize = 4 + 4 + crate::hash::HASH_LEN + IDENT_LEN;
/// offset(4) data(4092) read_len(2) hash(64) ident(1024)
pub const RES_PAYLOAD_LEN: usize =
    4 + DATA_MAX + 2 + crate::hash::HASH_LEN + IDENT_LEN;
/// Error code carried by a RES that couldn't be served.
pub const RES_ERROR: u16 = 1;

#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Pong = 0x00,
    Acp = 0x02,
    Dsn = 0x03,
    Req = 0x06,
    Res = 0x07,
    Ack = 0x0c,
    Ping = 0xff,
}

impl TryFrom<u16> for MessageKind {
    type Error = u16;

    fn try_from(k: u16) -> Result<Self, Self::Error> {
        use MessageKind::*;
        match k {
            k if k == Pong as u16 => Ok(Pong),
            k if k == Acp as u16 => Ok(Acp),
            k if k == Dsn as u16 => Ok(Dsn),
            k if k == Req as u16 => Ok(Req),
            k if k == Res as u16 => Ok(Res),
            k if k == Ack as u16 => Ok(Ack),
            k if k == Ping as u16 => Ok(Ping),
            k => Err(k),
        }
    }
}

/// Ask the owner of a package for a byte range of its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub offset: u32,
    pub size: u32,
    pub hash: HexHash,
    pub ident: String,
}

/// Bytes of a package file starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub offset: u32,
    pub data: Vec<u8>,
    pub hash: HexHash,
    pub ident: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake acknowledgement.
    Ack,
    /// Connection open greeting.
    Acp,
    /// The sender is disconnecting.
    Dsn,
    Ping,
    Pong,
    Request(Request),
    Response(Response),
    /// A RES that could not be served, carries the nonzero error code.
    ResponseError(u16),
    /// A kind we don't understand, only the header was consumed.
    Unknown(u16),
}

impl Message {
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Message::Ack => Some(MessageKind::Ack),
            Message::Acp => Some(MessageKind::Acp),
            Message::Dsn => Some(MessageKind::Dsn),
            Message::Ping => Some(MessageKind::Ping),
            Message::Pong => Some(MessageKind::Pong),
            Message::Request(_) => Some(MessageKind::Req),
            Message::Response(_) | Message::ResponseError(_) => {
                Some(MessageKind::Res)
            }
            Message::Unknown(_) => None,
        }
    }
}
