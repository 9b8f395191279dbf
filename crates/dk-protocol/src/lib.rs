#![forbid(unsafe_code)]

//! Wire codec.
//!
//! Requests are a length-prefixed array of length-prefixed byte strings:
//!
//! ```text
//! u32 total_len | u32 nstr | nstr * (u32 len | bytes)    (all little-endian)
//! ```
//!
//! Replies are one framed tagged value:
//!
//! ```text
//! u32 payload_len | tag byte | tag-specific payload
//! ```
//!
//! A partial frame is normal: the parser reports "incomplete" and the
//! connection keeps the bytes buffered until more arrive. Malformed or
//! oversized frames are protocol errors and tear the connection down.

/// Hard cap on a single request frame.
pub const MAX_MSG_LEN: usize = 32 << 20;

const TAG_INT: u8 = 0;
const TAG_STR: u8 = 1;
const TAG_ARR: u8 = 2;
const TAG_NIL: u8 = 3;
const TAG_ERR: u8 = 4;
const TAG_DBL: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    FrameTooLarge,
    Malformed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge => write!(f, "request frame exceeds maximum length"),
            Self::Malformed => write!(f, "malformed frame"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// One tagged reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Double(f64),
    Str(Vec<u8>),
    Array(Vec<Reply>),
    Error(String),
}

/// Extract one complete request from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete, otherwise the
/// argv and the number of bytes consumed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, ProtocolError> {
    let Some(total_len) = peek_u32(buf, 0) else {
        return Ok(None);
    };
    let total_len = total_len as usize;
    if total_len > MAX_MSG_LEN {
        return Err(ProtocolError::FrameTooLarge);
    }
    if buf.len() < 4 + total_len {
        return Ok(None);
    }
    let payload = &buf[4..4 + total_len];

    let mut pos = 0_usize;
    let nstr = read_u32(payload, &mut pos)? as usize;
    if nstr == 0 {
        return Err(ProtocolError::Malformed);
    }
    let mut argv = Vec::with_capacity(nstr.min(64));
    for _ in 0..nstr {
        let len = read_u32(payload, &mut pos)? as usize;
        let token = payload
            .get(pos..pos + len)
            .ok_or(ProtocolError::Malformed)?;
        argv.push(token.to_vec());
        pos += len;
    }
    if pos != payload.len() {
        return Err(ProtocolError::Malformed);
    }
    Ok(Some((argv, 4 + total_len)))
}

/// Append one framed request. Client-side half of `parse_request`, used by
/// tests and client tooling.
pub fn encode_request(argv: &[&[u8]], out: &mut Vec<u8>) {
    let header = out.len();
    out.extend_from_slice(&[0; 4]);
    push_u32(out, argv.len());
    for arg in argv {
        push_u32(out, arg.len());
        out.extend_from_slice(arg);
    }
    patch_len(out, header);
}

/// Append one framed reply.
pub fn encode_reply(reply: &Reply, out: &mut Vec<u8>) {
    let header = out.len();
    out.extend_from_slice(&[0; 4]);
    encode_value(reply, out);
    patch_len(out, header);
}

fn encode_value(reply: &Reply, out: &mut Vec<u8>) {
    match reply {
        Reply::Nil => out.push(TAG_NIL),
        Reply::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Reply::Double(d) => {
            out.push(TAG_DBL);
            out.extend_from_slice(&d.to_le_bytes());
        }
        Reply::Str(bytes) => {
            out.push(TAG_STR);
            push_u32(out, bytes.len());
            out.extend_from_slice(bytes);
        }
        Reply::Array(items) => {
            out.push(TAG_ARR);
            push_u32(out, items.len());
            for item in items {
                encode_value(item, out);
            }
        }
        Reply::Error(message) => {
            out.push(TAG_ERR);
            push_u32(out, message.len());
            out.extend_from_slice(message.as_bytes());
        }
    }
}

/// Decode one framed reply from the front of `buf`. `Ok(None)` while
/// incomplete. Used by tests and client tooling.
pub fn decode_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, ProtocolError> {
    let Some(payload_len) = peek_u32(buf, 0) else {
        return Ok(None);
    };
    let payload_len = payload_len as usize;
    if buf.len() < 4 + payload_len {
        return Ok(None);
    }
    let payload = &buf[4..4 + payload_len];
    let mut pos = 0_usize;
    let reply = decode_value(payload, &mut pos)?;
    if pos != payload.len() {
        return Err(ProtocolError::Malformed);
    }
    Ok(Some((reply, 4 + payload_len)))
}

fn decode_value(payload: &[u8], pos: &mut usize) -> Result<Reply, ProtocolError> {
    let tag = *payload.get(*pos).ok_or(ProtocolError::Malformed)?;
    *pos += 1;
    match tag {
        TAG_NIL => Ok(Reply::Nil),
        TAG_INT => {
            let bytes = take_n::<8>(payload, pos)?;
            Ok(Reply::Int(i64::from_le_bytes(bytes)))
        }
        TAG_DBL => {
            let bytes = take_n::<8>(payload, pos)?;
            Ok(Reply::Double(f64::from_le_bytes(bytes)))
        }
        TAG_STR => {
            let len = read_u32(payload, pos)? as usize;
            let bytes = payload
                .get(*pos..*pos + len)
                .ok_or(ProtocolError::Malformed)?;
            *pos += len;
            Ok(Reply::Str(bytes.to_vec()))
        }
        TAG_ARR => {
            let count = read_u32(payload, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                items.push(decode_value(payload, pos)?);
            }
            Ok(Reply::Array(items))
        }
        TAG_ERR => {
            let len = read_u32(payload, pos)? as usize;
            let bytes = payload
                .get(*pos..*pos + len)
                .ok_or(ProtocolError::Malformed)?;
            *pos += len;
            let message = String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Malformed)?;
            Ok(Reply::Error(message))
        }
        _ => Err(ProtocolError::Malformed),
    }
}

fn peek_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn read_u32(payload: &[u8], pos: &mut usize) -> Result<u32, ProtocolError> {
    let value = peek_u32(payload, *pos).ok_or(ProtocolError::Malformed)?;
    *pos += 4;
    Ok(value)
}

fn take_n<const N: usize>(payload: &[u8], pos: &mut usize) -> Result<[u8; N], ProtocolError> {
    let bytes: [u8; N] = payload
        .get(*pos..*pos + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(ProtocolError::Malformed)?;
    *pos += N;
    Ok(bytes)
}

fn push_u32(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&u32::try_from(len).unwrap_or(u32::MAX).to_le_bytes());
}

fn patch_len(out: &mut Vec<u8>, header: usize) {
    let len = u32::try_from(out.len() - header - 4).unwrap_or(u32::MAX);
    out[header..header + 4].copy_from_slice(&len.to_le_bytes());
}
