//! Wire framing: a varint-prefixed header naming `(service, method,
//! args_size)` followed by the argument payload, read and written directly
//! on a `TcpStream` (spec §4.5, grounded in the original `mprpcchannel`'s
//! length-delimited RPC header and the teacher's `MessageCodec`).

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One RPC call's worth of framing metadata plus its serialized arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service: String,
    pub method: String,
    pub payload: Vec<u8>,
}

fn write_varint(out: &mut BytesMut, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if v == 0 {
            break;
        }
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(Error::Protocol("varint too long".into()));
        }
        let byte = reader.read_u8().await?;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

/// Encode `(service, method, args_size)` header plus `payload` into one
/// buffer, length-prefixed so the reader knows exactly how much to pull off
/// the socket before attempting to decode the header.
pub fn encode_frame(service: &str, method: &str, payload: &[u8]) -> Vec<u8> {
    let mut header = BytesMut::new();
    write_varint(&mut header, service.len() as u64);
    header.put_slice(service.as_bytes());
    write_varint(&mut header, method.len() as u64);
    header.put_slice(method.as_bytes());
    write_varint(&mut header, payload.len() as u64);

    let mut out = BytesMut::with_capacity(10 + header.len() + payload.len());
    write_varint(&mut out, (header.len() + payload.len()) as u64);
    out.put_slice(&header);
    out.put_slice(payload);
    out.to_vec()
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, service: &str, method: &str, payload: &[u8]) -> Result<()> {
    let bytes = encode_frame(service, method, payload);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from the stream, blocking until it is fully available.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let total_len = read_varint(reader).await? as usize;
    if total_len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("frame of {total_len} bytes exceeds max size")));
    }
    let mut buf = vec![0u8; total_len];
    reader.read_exact(&mut buf).await?;

    let mut pos = 0usize;
    let service = read_length_prefixed_string(&buf, &mut pos)?;
    let method = read_length_prefixed_string(&buf, &mut pos)?;
    let args_size = read_buf_varint(&buf, &mut pos)? as usize;
    if pos + args_size > buf.len() {
        return Err(Error::Protocol("args_size exceeds frame body".into()));
    }
    let payload = buf[pos..pos + args_size].to_vec();

    Ok(Frame {
        service,
        method,
        payload,
    })
}

fn read_buf_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::Protocol("truncated varint in frame header".into()))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

fn read_length_prefixed_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_buf_varint(buf, pos)? as usize;
    let end = *pos + len;
    if end > buf.len() {
        return Err(Error::Protocol("truncated string in frame header".into()));
    }
    let s = String::from_utf8(buf[*pos..end].to_vec()).map_err(|e| Error::Protocol(e.to_string()))?;
    *pos = end;
    Ok(s)
}
