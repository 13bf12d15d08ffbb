// SPDX-License-Identifier: MIT
// Wire codec (C1): length-prefixed framing and the IDSCP2 message union.
//
// Every record on the wire is `u32 length (big-endian) || body[length]`. Body tag numbers
// are part of the wire contract and must never be renumbered once shipped.

use crate::error::{Idscp2Error, Idscp2Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CauseCode {
    UserShutdown = 0,
    Timeout = 1,
    HandshakeFailed = 2,
    RaProverFailed = 3,
    RaVerifierFailed = 4,
    DatInvalid = 5,
    Error = 6,
}

impl CauseCode {
    fn from_u8(v: u8) -> Idscp2Result<Self> {
        Ok(match v {
            0 => CauseCode::UserShutdown,
            1 => CauseCode::Timeout,
            2 => CauseCode::HandshakeFailed,
            3 => CauseCode::RaProverFailed,
            4 => CauseCode::RaVerifierFailed,
            5 => CauseCode::DatInvalid,
            6 => CauseCode::Error,
            other => return Err(Idscp2Error::Codec(format!("unknown cause code {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdscpMessage {
    Hello {
        dat: Vec<u8>,
        supported_ra: Vec<String>,
        expected_ra: Vec<String>,
    },
    Close {
        reason: String,
        cause_code: CauseCode,
    },
    DatExpired,
    Dat {
        token: Vec<u8>,
    },
    RaProver {
        data: Vec<u8>,
    },
    RaVerifier {
        data: Vec<u8>,
    },
    ReRa {
        cause: String,
    },
    Ack {
        alternating_bit: bool,
    },
    /// Carries a 1-bit alternating sequence number so a receiver can recognize a
    /// retransmitted `Data` (its `Ack` was lost) and avoid redelivering it to the
    /// application listener while still re-acknowledging it (spec §4.6 "ACK mode").
    Data {
        payload: Vec<u8>,
        alternating_bit: bool,
    },
}

impl IdscpMessage {
    /// Wire tag. These numbers are part of the deployed protocol and must stay stable.
    fn tag(&self) -> u8 {
        match self {
            IdscpMessage::Hello { .. } => 1,
            IdscpMessage::Close { .. } => 2,
            IdscpMessage::DatExpired => 3,
            IdscpMessage::Dat { .. } => 4,
            IdscpMessage::RaProver { .. } => 5,
            IdscpMessage::RaVerifier { .. } => 6,
            IdscpMessage::ReRa { .. } => 7,
            IdscpMessage::Ack { .. } => 8,
            IdscpMessage::Data { .. } => 9,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(self.tag());
        match self {
            IdscpMessage::Hello {
                dat,
                supported_ra,
                expected_ra,
            } => {
                put_bytes(&mut body, dat);
                put_string_list(&mut body, supported_ra);
                put_string_list(&mut body, expected_ra);
            }
            IdscpMessage::Close { reason, cause_code } => {
                put_str(&mut body, reason);
                body.put_u8(*cause_code as u8);
            }
            IdscpMessage::DatExpired => {}
            IdscpMessage::Dat { token } => put_bytes(&mut body, token),
            IdscpMessage::RaProver { data } => put_bytes(&mut body, data),
            IdscpMessage::RaVerifier { data } => put_bytes(&mut body, data),
            IdscpMessage::ReRa { cause } => put_str(&mut body, cause),
            IdscpMessage::Ack { alternating_bit } => body.put_u8(*alternating_bit as u8),
            IdscpMessage::Data {
                payload,
                alternating_bit,
            } => {
                put_bytes(&mut body, payload);
                body.put_u8(*alternating_bit as u8);
            }
        }
        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32(body.len() as u32);
        framed.extend_from_slice(&body);
        framed
    }

    pub fn decode(body: &[u8]) -> Idscp2Result<Self> {
        let mut buf = Bytes::copy_from_slice(body);
        let tag = get_u8(&mut buf)?;
        Ok(match tag {
            1 => IdscpMessage::Hello {
                dat: get_bytes(&mut buf)?,
                supported_ra: get_string_list(&mut buf)?,
                expected_ra: get_string_list(&mut buf)?,
            },
            2 => IdscpMessage::Close {
                reason: get_string(&mut buf)?,
                cause_code: CauseCode::from_u8(get_u8(&mut buf)?)?,
            },
            3 => IdscpMessage::DatExpired,
            4 => IdscpMessage::Dat {
                token: get_bytes(&mut buf)?,
            },
            5 => IdscpMessage::RaProver {
                data: get_bytes(&mut buf)?,
            },
            6 => IdscpMessage::RaVerifier {
                data: get_bytes(&mut buf)?,
            },
            7 => IdscpMessage::ReRa {
                cause: get_string(&mut buf)?,
            },
            8 => IdscpMessage::Ack {
                alternating_bit: get_u8(&mut buf)? != 0,
            },
            9 => IdscpMessage::Data {
                payload: get_bytes(&mut buf)?,
                alternating_bit: get_u8(&mut buf)? != 0,
            },
            other => return Err(Idscp2Error::Codec(format!("unknown message tag {other}"))),
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn put_string_list(buf: &mut BytesMut, items: &[String]) {
    buf.put_u32(items.len() as u32);
    for item in items {
        put_str(buf, item);
    }
}

fn get_u8(buf: &mut Bytes) -> Idscp2Result<u8> {
    if buf.remaining() < 1 {
        return Err(Idscp2Error::Codec("truncated frame (u8)".into()));
    }
    Ok(buf.get_u8())
}

fn get_bytes(buf: &mut Bytes) -> Idscp2Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(Idscp2Error::Codec("truncated frame (len)".into()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Idscp2Error::Codec("truncated frame (body)".into()));
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn get_string(buf: &mut Bytes) -> Idscp2Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes).map_err(|e| Idscp2Error::Codec(format!("invalid utf8: {e}")))
}

fn get_string_list(buf: &mut Bytes) -> Idscp2Result<Vec<String>> {
    if buf.remaining() < 4 {
        return Err(Idscp2Error::Codec("truncated frame (list len)".into()));
    }
    let count = buf.get_u32() as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        out.push(get_string(buf)?);
    }
    Ok(out)
}

/// Reads exactly one length-prefixed record off `reader`. Returns `Ok(None)` on a clean
/// EOF before any bytes of a new record have been read; any other EOF (mid-length or
/// mid-body) is an error, per spec §4.1.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Idscp2Result<Option<BytesMut>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Idscp2Error::Codec(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }
    let mut body = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
