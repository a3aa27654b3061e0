// Async STOMP codec: newline-delimited command/headers, NUL-terminated body.
use bytes::{BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Frame, Headers, Result, Version, WireError, escape_value, header, unescape_value};

/// One inbound wire event. A bare end-of-line between frames is a heartbeat.
#[derive(Debug)]
pub enum ReadEvent {
    Frame(Frame),
    Heartbeat,
}

/// Reads frames from a buffered byte stream.
///
/// `content-length`, when present, is authoritative for the body length and
/// the body may contain NUL octets; otherwise the body runs to the next NUL.
/// The frame terminator is always consumed.
pub struct FrameReader<R> {
    reader: R,
    version: Version,
    max_frame_bytes: usize,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            version: Version::V1_0,
            max_frame_bytes,
            line: Vec::new(),
        }
    }

    /// Switch header decoding rules after version negotiation.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Next event, or `None` on a clean end of stream between frames.
    pub async fn read_event(&mut self) -> Result<Option<ReadEvent>> {
        let read = self.read_line().await?;
        if read == 0 {
            return Ok(None);
        }
        let command_line = trim_eol(&self.line);
        if command_line.is_empty() {
            return Ok(Some(ReadEvent::Heartbeat));
        }
        let command = std::str::from_utf8(command_line)
            .map_err(|_| WireError::BadHeader)?
            .to_string();

        let mut total = read;
        let mut headers = Headers::new();
        let mut content_length: Option<usize> = None;
        loop {
            let read = self.read_line().await?;
            if read == 0 {
                return Err(WireError::Incomplete);
            }
            total += read;
            if total > self.max_frame_bytes {
                return Err(WireError::FrameTooLarge(self.max_frame_bytes));
            }
            let line = trim_eol(&self.line);
            if line.is_empty() {
                break;
            }
            let text = std::str::from_utf8(line).map_err(|_| WireError::BadHeader)?;
            let (raw_name, raw_value) = text.split_once(':').ok_or(WireError::BadHeader)?;
            let (name, value) = if self.version.escapes_headers() {
                (unescape_value(raw_name)?, unescape_value(raw_value)?)
            } else {
                (raw_name.to_string(), raw_value.to_string())
            };
            // First occurrence is authoritative, also for content-length.
            if name == header::CONTENT_LENGTH && content_length.is_none() {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| WireError::BadContentLength)?,
                );
            }
            headers.push(name, value);
        }

        let body = match content_length {
            Some(length) => {
                if total + length + 1 > self.max_frame_bytes {
                    return Err(WireError::FrameTooLarge(self.max_frame_bytes));
                }
                let mut body = vec![0u8; length];
                self.reader
                    .read_exact(&mut body)
                    .await
                    .map_err(eof_as_incomplete)?;
                let mut terminator = [0u8; 1];
                self.reader
                    .read_exact(&mut terminator)
                    .await
                    .map_err(eof_as_incomplete)?;
                if terminator[0] != 0 {
                    return Err(WireError::MissingTerminator);
                }
                Bytes::from(body)
            }
            None => {
                let mut body = Vec::new();
                let read = self.reader.read_until(0, &mut body).await?;
                if read == 0 || body.last() != Some(&0) {
                    return Err(WireError::Incomplete);
                }
                body.pop();
                if total + body.len() + 1 > self.max_frame_bytes {
                    return Err(WireError::FrameTooLarge(self.max_frame_bytes));
                }
                Bytes::from(body)
            }
        };

        Ok(Some(ReadEvent::Frame(Frame {
            command,
            headers,
            body,
        })))
    }

    async fn read_line(&mut self) -> Result<usize> {
        self.line.clear();
        Ok(self.reader.read_until(b'\n', &mut self.line).await?)
    }
}

/// Writes frames and heartbeats, flushing after each.
pub struct FrameWriter<W> {
    writer: W,
    version: Version,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            version: Version::V1_0,
        }
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut buf = BytesMut::with_capacity(64 + frame.body.len());
        buf.extend_from_slice(frame.command.as_bytes());
        buf.put_u8(b'\n');
        for h in frame.headers.iter() {
            // content-length is restamped below from the actual body.
            if h.name == header::CONTENT_LENGTH {
                continue;
            }
            if self.version.escapes_headers() {
                buf.extend_from_slice(escape_value(&h.name).as_bytes());
                buf.put_u8(b':');
                buf.extend_from_slice(escape_value(&h.value).as_bytes());
            } else {
                buf.extend_from_slice(h.name.as_bytes());
                buf.put_u8(b':');
                buf.extend_from_slice(h.value.as_bytes());
            }
            buf.put_u8(b'\n');
        }
        if !frame.body.is_empty() {
            buf.extend_from_slice(header::CONTENT_LENGTH.as_bytes());
            buf.put_u8(b':');
            buf.extend_from_slice(frame.body.len().to_string().as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.extend_from_slice(&frame.body);
        buf.put_u8(0);
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// A heartbeat is a single end-of-line outside any frame.
    pub async fn write_heartbeat(&mut self) -> Result<()> {
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn eof_as_incomplete(err: std::io::Error) -> WireError {
    if err.kind() == ErrorKind::UnexpectedEof {
        WireError::Incomplete
    } else {
        WireError::Io(err)
    }
}
