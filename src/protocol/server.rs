use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::verdict::Verdict;
use crate::protection::detector::Detector;

/// Longest accepted input line in bytes, newline excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// One unit read from the transport.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A complete line; the bytes are in the caller's buffer.
    Line,
    /// A line longer than the limit, already discarded.
    Oversized,
    Eof,
}

/// Read up to and including the next `\n` into `buf` (newline stripped).
///
/// Bytes past `max_len` are dropped as they arrive, so an unterminated line
/// never grows the buffer beyond the limit. A final line without a newline
/// is still returned.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut seen_any = false;
    let mut oversized = false;

    loop {
        let (used, done) = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                break;
            }
            seen_any = true;

            let (content, used, done) = match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => (&chunk[..i], i + 1, true),
                None => (chunk, chunk.len(), false),
            };
            if !oversized {
                if buf.len() + content.len() > max_len {
                    oversized = true;
                    buf.clear();
                } else {
                    buf.extend_from_slice(content);
                }
            }
            (used, done)
        };
        reader.consume(used);

        if done {
            break;
        }
    }

    Ok(match (seen_any, oversized) {
        (false, _) => Frame::Eof,
        (true, true) => Frame::Oversized,
        (true, false) => Frame::Line,
    })
}

/// Synchronous request/response loop over a line transport.
///
/// Reads one line, writes exactly one verdict line and flushes before reading
/// the next, so the caller can pair answers with requests by position. Lines
/// are decoded lossily; only transport errors end the loop with an error.
pub struct LineServer {
    detector: Arc<Detector>,
    max_line_length: usize,
}

impl LineServer {
    pub fn new(detector: Arc<Detector>, max_line_length: usize) -> Self {
        Self {
            detector,
            max_line_length,
        }
    }

    /// Serve until the input closes or `cancel` fires.
    /// Returns the number of lines answered.
    pub async fn run<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        cancel: CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        let mut handled: u64 = 0;

        info!(max_line_length = self.max_line_length, "Waiting for input lines");

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Line server cancelled");
                    break;
                }
                frame = read_frame(&mut reader, &mut buf, self.max_line_length) => {
                    frame.context("Failed to read input line")?
                }
            };

            let verdict = match frame {
                Frame::Eof => {
                    debug!("Input closed");
                    break;
                }
                Frame::Oversized => {
                    debug!(limit = self.max_line_length, "Line too long, allowing");
                    Verdict::Ok
                }
                Frame::Line => {
                    let raw = buf.strip_suffix(b"\r").unwrap_or(&buf[..]);
                    let line = String::from_utf8_lossy(raw);
                    let verdict = self.detector.handle_line(&line);
                    if verdict.is_blocking() {
                        debug!(line = %line, "Blocking request");
                    }
                    verdict
                }
            };

            writer
                .write_all(verdict.as_str().as_bytes())
                .await
                .context("Failed to write verdict")?;
            writer
                .write_all(b"\n")
                .await
                .context("Failed to write verdict")?;
            writer.flush().await.context("Failed to flush verdict")?;

            handled += 1;
        }

        Ok(handled)
    }
}
