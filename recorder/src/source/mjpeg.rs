use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use motioncam_common::frame::Frame;
use std::time::Duration;
use tracing::{debug, info};

use super::{FrameSource, SourceError};

const HEADER_END: &[u8] = b"\r\n\r\n";
const DEFAULT_BOUNDARY: &str = "frame";

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting part bytes until the next boundary.
    CollectingPart,
}

/// Incremental splitter for `multipart/x-mixed-replace` bodies.
///
/// Feed it chunks as they arrive with [`push`](Self::push) and pull complete
/// parts with [`next_part`](Self::next_part). Boundaries may span chunks.
pub struct MultipartParser {
    marker: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for the closing boundary.
    scan_from: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let boundary = boundary.trim_start_matches("--");
        Self {
            marker: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete, non-empty part body, or `None` if more data is needed.
    pub fn next_part(&mut self) -> Option<Vec<u8>> {
        let marker_len = self.marker.len();
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.marker) {
                        // Discard everything up to and including the boundary
                        let _ = self.buffer.split_to(pos + marker_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        if self.buffer.len() > marker_len {
                            let _ = self.buffer.split_to(self.buffer.len() - marker_len);
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = ParseState::CollectingPart;
                    } else {
                        return None;
                    }
                }
                ParseState::CollectingPart => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], &self.marker)
                    else {
                        // Avoid re-scanning old data on the next chunk
                        self.scan_from = self.buffer.len().saturating_sub(marker_len);
                        return None;
                    };

                    let part_end = self.scan_from + pos;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..part_end].ends_with(b"\r\n") {
                        part_end - 2
                    } else {
                        part_end
                    };
                    let part = self.buffer[..end].to_vec();

                    // Already past boundary, go to header parsing
                    let _ = self.buffer.split_to(part_end + marker_len);
                    self.state = ParseState::SeekingHeaderEnd;

                    if !part.is_empty() {
                        return Some(part);
                    }
                }
            }
        }
    }
}

/// Extract the boundary parameter from a multipart `Content-Type` value.
fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

/// IP camera serving an HTTP MJPEG stream.
pub struct MjpegSource {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: MultipartParser,
    seq: u64,
}

impl MjpegSource {
    pub async fn connect(url: &str) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(SourceError::HttpConnect)?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(SourceError::HttpConnect)?;

        if !response.status().is_success() {
            return Err(SourceError::HttpStatus(response.status().as_u16()));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

        info!(url, status = %response.status(), boundary, "connected to MJPEG stream");

        Ok(Self {
            stream: response.bytes_stream().boxed(),
            parser: MultipartParser::new(&boundary),
            seq: 0,
        })
    }
}

impl FrameSource for MjpegSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        loop {
            if let Some(jpeg) = self.parser.next_part() {
                let seq = self.seq;
                self.seq += 1;
                debug!(seq, bytes = jpeg.len(), "MJPEG part received");
                return Ok(Frame::from_jpeg(&jpeg, Utc::now().timestamp_millis(), seq)?);
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => return Err(SourceError::HttpStream(e)),
                None => return Err(SourceError::Ended),
            }
        }
    }

    async fn release(&mut self) {
        self.stream = futures_util::stream::empty().boxed();
        info!(frames = self.seq, "MJPEG stream released");
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
