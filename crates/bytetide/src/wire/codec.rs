use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::Error,
    hash::{HexHash, HASH_LEN},
};

use super::*;

/// Codec of peer frames.
///
/// All integers are little-endian.
///
/// ```text
/// header   kind(u16) error(u16)
/// ACK ACP DSN PNG POG, error RES
///          header only
/// REQ      header offset(u32) size(u32) hash(64) ident(1024)
/// RES      header offset(u32) data(4092) read_len(u16) hash(64) ident(1024)
/// ```
///
/// The RES data slot is always 4092 bytes on the wire, only the first
/// `read_len` are meaningful. Identifiers are NUL padded to 1024 bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Bytes that follow the header of a frame with this kind and error.
    fn payload_len(kind: u16, error: u16) -> usize {
        match MessageKind::try_from(kind) {
            Ok(MessageKind::Req) => REQ_PAYLOAD_LEN,
            Ok(MessageKind::Res) if error == 0 => RES_PAYLOAD_LEN,
            _ => 0,
        }
    }
}

fn put_ident(buf: &mut BytesMut, ident: &str) -> Result<(), Error> {
    let bytes = ident.as_bytes();
    if bytes.len() > IDENT_LEN {
        return Err(Error::Protocol(format!(
            "identifier is {} bytes, the limit is {IDENT_LEN}",
            bytes.len()
        )));
    }
    buf.extend_from_slice(bytes);
    buf.put_bytes(0, IDENT_LEN - bytes.len());
    Ok(())
}

/// Identifiers are padded with NULs by us, and with NULs or spaces by other
/// implementations.
fn get_ident(buf: &mut BytesMut) -> Result<String, Error> {
    let raw = buf.split_to(IDENT_LEN);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(IDENT_LEN);
    let ident = std::str::from_utf8(&raw[..end])
        .map_err(|_| Error::Protocol("identifier is not UTF-8".into()))?;
    Ok(ident.trim_end_matches(' ').to_owned())
}

fn get_hash(buf: &mut BytesMut) -> Result<HexHash, Error> {
    let mut raw = [0u8; HASH_LEN];
    buf.copy_to_slice(&mut raw);
    if !raw.iter().all(|b| b.is_ascii()) {
        return Err(Error::Protocol("hash is not ASCII".into()));
    }
    Ok(HexHash::from_raw(raw))
}

// From message to bytes
impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::Ack
            | Message::Acp
            | Message::Dsn
            | Message::Ping
            | Message::Pong => {
                let kind = item.kind().map(|k| k as u16).unwrap_or_default();
                buf.put_u16_le(kind);
                buf.put_u16_le(0);
            }
            Message::Request(req) => {
                buf.reserve(HEADER_LEN + REQ_PAYLOAD_LEN);
                buf.put_u16_le(MessageKind::Req as u16);
                buf.put_u16_le(0);
                buf.put_u32_le(req.offset);
                buf.put_u32_le(req.size);
                buf.extend_from_slice(req.hash.as_bytes());
                put_ident(buf, &req.ident)?;
            }
            Message::Response(res) => {
                if res.data.len() > DATA_MAX {
                    return Err(Error::Protocol(format!(
                        "response carries {} bytes, the limit is {DATA_MAX}",
                        res.data.len()
                    )));
                }
                buf.reserve(HEADER_LEN + RES_PAYLOAD_LEN);
                buf.put_u16_le(MessageKind::Res as u16);
                buf.put_u16_le(0);
                buf.put_u32_le(res.offset);
                buf.extend_from_slice(&res.data);
                buf.put_bytes(0, DATA_MAX - res.data.len());
                buf.put_u16_le(res.data.len() as u16);
                buf.extend_from_slice(res.hash.as_bytes());
                put_ident(buf, &res.ident)?;
            }
            Message::ResponseError(code) => {
                buf.put_u16_le(MessageKind::Res as u16);
                buf.put_u16_le(code.max(RES_ERROR));
            }
            Message::Unknown(kind) => {
                buf.put_u16_le(kind);
                buf.put_u16_le(0);
            }
        }
        Ok(())
    }
}

// From bytes to message
impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.remaining() < HEADER_LEN {
            return Ok(None);
        }

        // peek the header, the payload may not be here yet
        let mut tmp_buf = Cursor::new(&buf);
        let kind = tmp_buf.get_u16_le();
        let error = tmp_buf.get_u16_le();

        let payload_len = Self::payload_len(kind, error);

        if buf.remaining() < HEADER_LEN + payload_len {
            buf.reserve(HEADER_LEN + payload_len - buf.remaining());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);

        let msg = match MessageKind::try_from(kind) {
            Ok(MessageKind::Ack) => Message::Ack,
            Ok(MessageKind::Acp) => Message::Acp,
            Ok(MessageKind::Dsn) => Message::Dsn,
            Ok(MessageKind::Ping) => Message::Ping,
            Ok(MessageKind::Pong) => Message::Pong,
            Ok(MessageKind::Req) => {
                let offset = buf.get_u32_le();
                let size = buf.get_u32_le();
                let hash = get_hash(buf)?;
                let ident = get_ident(buf)?;
                Message::Request(Request { offset, size, hash, ident })
            }
            Ok(MessageKind::Res) if error != 0 => Message::ResponseError(error),
            Ok(MessageKind::Res) => {
                let offset = buf.get_u32_le();
                let slot = buf.split_to(DATA_MAX);
                let read_len = buf.get_u16_le() as usize;
                if read_len > DATA_MAX {
                    return Err(Error::Protocol(format!(
                        "read_len {read_len} exceeds {DATA_MAX}"
                    )));
                }
                let hash = get_hash(buf)?;
                let ident = get_ident(buf)?;
                Message::Response(Response {
                    offset,
                    data: slot[..read_len].to_vec(),
                    hash,
                    ident,
                })
            }
            Err(kind) => Message::Unknown(kind),
        };

        Ok(Some(msg))
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::Protocol(format!(
                "connection closed with a partial frame of {} bytes",
                buf.len()
            ))),
        }
    }
}
