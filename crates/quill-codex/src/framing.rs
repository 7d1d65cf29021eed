//! Newline-delimited framing over the child's stdio. The decoder tolerates
//! very large lines up to a configured cap; a line past the cap is consumed
//! through its terminating newline and reported as a discrete error so the
//! reader can log it and keep going.

use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;

#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a message as one frame: compact JSON plus exactly one trailing
/// newline. Compact JSON escapes any newline inside string values, so the
/// payload itself never contains a raw `\n`.
pub(crate) fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}

pub(crate) struct FramedReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
}

enum Line {
    Eof,
    Oversized,
    Data(String),
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_frame_bytes,
        }
    }

    /// Next non-empty frame, or `None` at EOF. `FrameError::Oversized` is
    /// recoverable: the offending line has already been consumed.
    pub async fn next_frame(&mut self) -> Result<Option<String>, FrameError> {
        loop {
            match self.read_line().await? {
                Line::Eof => return Ok(None),
                Line::Oversized => {
                    return Err(FrameError::Oversized {
                        limit: self.max_frame_bytes,
                    })
                }
                Line::Data(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(line.to_string()));
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<Line, FrameError> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                // EOF. A partial line with no terminator is still delivered.
                if line.is_empty() {
                    return Ok(Line::Eof);
                }
                return Ok(Line::Data(String::from_utf8_lossy(&line).into_owned()));
            }

            if let Some(pos) = available.iter().position(|b| *b == b'\n') {
                if line.len() + pos > self.max_frame_bytes {
                    self.reader.consume(pos + 1);
                    return Ok(Line::Oversized);
                }
                line.extend_from_slice(&available[..pos]);
                self.reader.consume(pos + 1);
                return Ok(Line::Data(String::from_utf8_lossy(&line).into_owned()));
            }

            let chunk = available.len();
            if line.len() + chunk > self.max_frame_bytes {
                self.reader.consume(chunk);
                self.discard_to_newline().await?;
                return Ok(Line::Oversized);
            }
            line.extend_from_slice(available);
            self.reader.consume(chunk);
        }
    }

    async fn discard_to_newline(&mut self) -> Result<(), FrameError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            if let Some(pos) = available.iter().position(|b| *b == b'\n') {
                self.reader.consume(pos + 1);
                return Ok(());
            }
            let chunk = available.len();
            self.reader.consume(chunk);
        }
    }
}
