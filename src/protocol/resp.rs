use std::io::{Read, Write};
use std::net::TcpStream;

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};
use thiserror::Error;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// One RESP-2 value. `File` is the unterminated bulk used only for the
/// full-resync snapshot transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(String),
    NullBulk,
    Array(Vec<Resp>),
    File(Vec<u8>),
}

impl Resp {
    pub fn simple(s: &str) -> Self {
        Resp::Simple(s.to_string())
    }

    pub fn bulk(s: &str) -> Self {
        Resp::Bulk(s.to_string())
    }

    /// Client-style request frame: an array of bulk strings.
    pub fn command(parts: &[&str]) -> Self {
        Resp::Array(parts.iter().map(|p| Resp::bulk(p)).collect())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Resp::Simple(s) => {
                out.extend_from_slice(format!("+{}\r\n", s).as_bytes());
            }
            Resp::Error(s) => {
                out.extend_from_slice(format!("-{}\r\n", s).as_bytes());
            }
            Resp::Int(n) => {
                out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
            }
            Resp::Bulk(s) => {
                out.extend_from_slice(format!("${}\r\n{}\r\n", s.len(), s).as_bytes());
            }
            Resp::NullBulk => {
                out.extend_from_slice(b"$-1\r\n");
            }
            Resp::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
            Resp::File(payload) => {
                // no trailing CRLF after the raw payload
                out.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
                out.extend_from_slice(payload);
            }
        }
    }

    /// Request argv when the frame is an array of bulk strings.
    pub fn into_argv(self) -> Option<Vec<String>> {
        match self {
            Resp::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Resp::Bulk(s) => Some(s),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("need more data to decode a complete frame")]
    Incomplete,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == [CR, LF])
}

/// Leading line without its CRLF, plus the bytes consumed including it.
fn read_line(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let end = find_crlf(buf).ok_or(DecodeError::Incomplete)?;
    let line = std::str::from_utf8(&buf[..end])
        .map_err(|_| DecodeError::Malformed("line is not valid utf-8".to_string()))?;
    Ok((line, end + 2))
}

/// Decodes one top-level RESP value, returning it with the exact number of
/// input bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Resp, usize), DecodeError> {
    match buf.first() {
        None => Err(DecodeError::Incomplete),
        Some(b'+') => {
            let (line, consumed) = read_line(&buf[1..])?;
            Ok((Resp::Simple(line.to_string()), consumed + 1))
        }
        Some(b'-') => {
            let (line, consumed) = read_line(&buf[1..])?;
            Ok((Resp::Error(line.to_string()), consumed + 1))
        }
        Some(b':') => {
            let (line, consumed) = read_line(&buf[1..])?;
            let n = line
                .parse::<i64>()
                .map_err(|_| DecodeError::Malformed(format!("bad integer: {}", line)))?;
            Ok((Resp::Int(n), consumed + 1))
        }
        Some(b'$') => decode_bulk(buf),
        Some(b'*') => decode_array(buf),
        Some(byte) => Err(DecodeError::Malformed(format!(
            "unknown frame prefix: {:#04x}",
            byte
        ))),
    }
}

fn decode_bulk(buf: &[u8]) -> Result<(Resp, usize), DecodeError> {
    let (line, header) = read_line(&buf[1..])?;
    let declared = line
        .parse::<i64>()
        .map_err(|_| DecodeError::Malformed(format!("bad bulk length: {}", line)))?;
    if declared < 0 {
        return Ok((Resp::NullBulk, header + 1));
    }
    let len = declared as usize;
    let start = header + 1;
    if buf.len() < start + len + 2 {
        return Err(DecodeError::Incomplete);
    }
    if buf[start + len] != CR || buf[start + len + 1] != LF {
        return Err(DecodeError::Malformed(
            "bulk payload is not CRLF-terminated".to_string(),
        ));
    }
    let payload = std::str::from_utf8(&buf[start..start + len])
        .map_err(|_| DecodeError::Malformed("bulk payload is not valid utf-8".to_string()))?;
    Ok((Resp::Bulk(payload.to_string()), start + len + 2))
}

fn decode_array(buf: &[u8]) -> Result<(Resp, usize), DecodeError> {
    let (line, header) = read_line(&buf[1..])?;
    let count = line
        .parse::<usize>()
        .map_err(|_| DecodeError::Malformed(format!("bad array length: {}", line)))?;
    let mut offset = header + 1;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let (item, consumed) = decode(&buf[offset..])?;
        items.push(item);
        offset += consumed;
    }
    Ok((Resp::Array(items), offset))
}

/// Decodes back-to-back request frames from one contiguous buffer, yielding
/// `(argv, byte_length)` pairs. The per-command length is the authoritative
/// increment for a replica's processed-byte counter.
pub fn decode_commands(buf: &[u8]) -> Result<Vec<(Vec<String>, usize)>, DecodeError> {
    let mut commands = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (frame, consumed) = decode(&buf[offset..])?;
        let argv = frame.into_argv().ok_or_else(|| {
            DecodeError::Malformed("request frame must be an array of bulk strings".to_string())
        })?;
        commands.push((argv, consumed));
        offset += consumed;
    }
    Ok(commands)
}

/// A TCP connection speaking RESP, with a growable read buffer so that
/// frames split or coalesced by the transport are reassembled exactly.
pub struct RespConnection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl RespConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// A second handle on the underlying socket, used to register the
    /// connection as a replica writer.
    pub fn writer_handle(&self) -> Result<TcpStream> {
        Ok(self.stream.try_clone()?)
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4 * 1024];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            bail!("connection closed by peer");
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Reads exactly one frame, returning its exact encoded length.
    pub fn read_frame(&mut self) -> Result<(usize, Resp)> {
        loop {
            match decode(&self.buffer) {
                Ok((frame, consumed)) => {
                    self.buffer.advance(consumed);
                    return Ok((consumed, frame));
                }
                Err(DecodeError::Incomplete) => self.fill()?,
                Err(err @ DecodeError::Malformed(_)) => bail!(err),
            }
        }
    }

    /// Drains every complete request frame currently buffered, reading from
    /// the socket until at least one is available. A frame split across TCP
    /// reads stays buffered until its remainder arrives.
    pub fn read_command_batch(&mut self) -> Result<Vec<(Vec<String>, usize)>> {
        loop {
            match decode(&self.buffer) {
                Ok(_) => break,
                Err(DecodeError::Incomplete) => self.fill()?,
                Err(err @ DecodeError::Malformed(_)) => bail!(err),
            }
        }
        let mut end = 0;
        while let Ok((_, consumed)) = decode(&self.buffer[end..]) {
            end += consumed;
        }
        let batch = decode_commands(&self.buffer[..end])?;
        self.buffer.advance(end);
        Ok(batch)
    }

    /// Reads the full-resync snapshot frame: `$<len>\r\n<bytes>` with no
    /// trailing CRLF.
    pub fn read_rdb(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(end) = find_crlf(&self.buffer) {
                if self.buffer.first() != Some(&b'$') {
                    bail!("snapshot frame must start with '$'");
                }
                let len = std::str::from_utf8(&self.buffer[1..end])?.parse::<usize>()?;
                let total = end + 2 + len;
                if self.buffer.len() >= total {
                    let payload = self.buffer[end + 2..total].to_vec();
                    self.buffer.advance(total);
                    return Ok(payload);
                }
            }
            self.fill()?;
        }
    }

    pub fn send_frame(&mut self, frame: &Resp) -> Result<usize> {
        self.send_frames(std::slice::from_ref(frame))
    }

    pub fn send_frames(&mut self, frames: &[Resp]) -> Result<usize> {
        let mut written = 0;
        for frame in frames {
            let bytes = frame.encode();
            self.stream.write_all(&bytes)?;
            written += bytes.len();
        }
        self.stream.flush()?;
        Ok(written)
    }
}
