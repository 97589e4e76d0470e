use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed RESP input: {0}")]
    Malformed(String),

    #[error("connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RespError>;

/// Encode a command line as a RESP array of bulk strings
pub fn encode_command(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Find the CRLF-terminated line starting at `pos`. Returns the line
/// (without CRLF) and the position just past it, or None if incomplete.
fn take_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let hay = &buf[pos..];
    let idx = hay.windows(2).position(|w| w == b"\r\n")?;
    Some((&hay[..idx], pos + idx + 2))
}

fn parse_len(line: &[u8], prefix: u8) -> Result<usize> {
    if line.first() != Some(&prefix) {
        return Err(RespError::Malformed(format!(
            "expected '{}', got {:?}",
            prefix as char,
            String::from_utf8_lossy(line)
        )));
    }
    std::str::from_utf8(&line[1..])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| RespError::Malformed("bad length field".to_string()))
}

/// Try to decode one command array from the front of `buf`.
///
/// Returns the decoded arguments plus the number of encoded bytes
/// consumed, or None when the buffer holds an incomplete command.
pub fn decode_command(buf: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>> {
    let Some((header, mut pos)) = take_line(buf, 0) else {
        return Ok(None);
    };
    let count = parse_len(header, b'*')?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let Some((line, next)) = take_line(buf, pos) else {
            return Ok(None);
        };
        let len = parse_len(line, b'$')?;
        pos = next;

        if buf.len() < pos + len + 2 {
            return Ok(None);
        }
        args.push(buf[pos..pos + len].to_vec());
        if &buf[pos + len..pos + len + 2] != b"\r\n" {
            return Err(RespError::Malformed("missing bulk terminator".to_string()));
        }
        pos += len + 2;
    }

    Ok(Some((args, pos)))
}

/// Buffered RESP reader over an async byte stream.
///
/// `read_command` reports the encoded byte length of every command so
/// callers can track stream offsets exactly.
pub struct RespReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> RespReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    async fn fill(&mut self) -> Result<usize> {
        let n = self.inner.read_buf(&mut self.buf).await?;
        Ok(n)
    }

    /// Read the next command array. Returns None on a clean EOF at a
    /// command boundary.
    pub async fn read_command(&mut self) -> Result<Option<(Vec<Vec<u8>>, usize)>> {
        loop {
            if let Some((args, consumed)) = decode_command(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(Some((args, consumed)));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RespError::Malformed("truncated command".to_string()));
            }
        }
    }

    /// Read a single CRLF-terminated line (status replies, resync headers)
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some((line, next)) = take_line(&self.buf, 0) {
                let text = String::from_utf8_lossy(line).into_owned();
                self.buf.advance(next);
                return Ok(text);
            }
            if self.fill().await? == 0 {
                return Err(RespError::Closed);
            }
        }
    }

    /// Read a `$<len>\r\n` header followed by exactly `len` raw bytes
    /// (no trailing CRLF) — the snapshot blob framing.
    pub async fn read_blob(&mut self) -> Result<Vec<u8>> {
        let header = self.read_line().await?;
        let len = header
            .strip_prefix('$')
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| RespError::Malformed(format!("bad blob header: {header}")))?;

        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(RespError::Malformed("truncated blob".to_string()));
            }
        }
        let blob = self.buf.split_to(len);
        Ok(blob.to_vec())
    }
}
