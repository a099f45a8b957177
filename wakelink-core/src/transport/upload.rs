//! Chunked upload of a recorded utterance.
//!
//! ## Protocol
//!
//! 1. Open one `POST` connection with `Content-Length = 44 + payload`.
//! 2. Send the container header, then the PCM payload, in `chunk_size` pieces.
//!    A write that errors or accepts zero bytes is retried after
//!    `retry_delay`; `max_consecutive_failures` in a row abort the upload.
//!    A partial write advances by what was accepted and resets the counter.
//! 3. Poll for response headers until `response_timeout` has elapsed.
//! 4. Read at most `max_response_bytes` of body into the caller's
//!    [`ResponseBuffer`].
//!
//! The connection is dropped (released) on every return path.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffering::SampleBuffer;
use crate::container::{self, HEADER_LEN};
use crate::error::{Result, WakeError};
use crate::transport::{Connection, LocationInfo, Request, ResponseBuffer, Transport};

/// Header carrying the device location alongside an upload.
pub const LOCATION_HEADER: &str = "x-esp32-loc";

#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    pub chunk_size: usize,
    pub max_consecutive_failures: u32,
    pub retry_delay: Duration,
    /// Pause between successful chunks so a slow link can drain.
    pub inter_chunk_delay: Duration,
    pub response_timeout: Duration,
    pub poll_interval: Duration,
    pub max_response_bytes: usize,
    /// Emit a progress line every this many bytes.
    pub progress_log_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2048,
            max_consecutive_failures: 5,
            retry_delay: Duration::from_millis(50),
            inter_chunk_delay: Duration::from_millis(5),
            response_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            max_response_bytes: 4096,
            progress_log_bytes: 8192,
        }
    }
}

/// Where an upload goes and what rides along with it.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget<'a> {
    pub url: &'a str,
    pub api_key: &'a str,
    pub location: Option<&'a LocationInfo>,
}

/// Live state of one upload call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    /// Header and payload bytes accepted so far.
    pub bytes_sent: usize,
    pub consecutive_failures: u32,
    pub target_bytes: usize,
    next_log: usize,
}

impl UploadProgress {
    pub fn new(target_bytes: usize) -> Self {
        Self {
            bytes_sent: 0,
            consecutive_failures: 0,
            target_bytes,
            next_log: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.target_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOutcome {
    pub status: u16,
    pub bytes_sent: usize,
    pub body_len: usize,
    pub body_truncated: bool,
}

/// Stream `samples` as a container to `target`, leaving the response body in
/// `response`.
///
/// # Errors
/// `ConnectionOpen`, `WriteRetriesExhausted`, `ResponseTimeout` or
/// `HttpStatus` (non-2xx, after the body has been read for logging).
pub fn upload(
    transport: &dyn Transport,
    target: &UploadTarget<'_>,
    samples: &SampleBuffer,
    response: &mut ResponseBuffer,
    config: &UploadConfig,
) -> Result<UploadOutcome> {
    let payload_bytes = samples.payload_bytes();
    let total = HEADER_LEN + payload_bytes;
    let payload_field = u32::try_from(payload_bytes)
        .map_err(|_| WakeError::InvalidContainer("payload exceeds 4 GiB"))?;

    let mut request = Request::post(
        target.url,
        total as u64,
        config.response_timeout + Duration::from_secs(30),
    )
    .header("Content-Type", "audio/wav")
    .header("X-API-KEY", target.api_key);
    if let Some(location) = target.location {
        request = request.header(LOCATION_HEADER, location.header_value());
    }

    info!(
        url = target.url,
        bytes = total,
        duration_secs = samples.duration_secs(),
        "upload starting"
    );
    let started = Instant::now();
    let mut conn = transport.open(&request)?;
    let mut progress = UploadProgress::new(total);

    let header = container::build_header(payload_field, samples.sample_rate());
    send_all(conn.as_mut(), &header, &mut progress, config)?;

    let mut scratch = vec![0u8; config.chunk_size.max(2)];
    container::pcm_to_le_bytes(samples.samples(), &mut scratch, |piece| {
        send_all(conn.as_mut(), piece, &mut progress, config)?;
        if !config.inter_chunk_delay.is_zero() {
            std::thread::sleep(config.inter_chunk_delay);
        }
        Ok(())
    })?;

    info!(
        bytes = progress.bytes_sent,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "upload body sent, waiting for response"
    );

    let head = await_headers(conn.as_mut(), config)?;
    response.clear();
    let body_len = read_body(conn.as_mut(), response, config.max_response_bytes);

    let outcome = UploadOutcome {
        status: head.status,
        bytes_sent: progress.bytes_sent,
        body_len,
        body_truncated: response.is_truncated(),
    };

    if !head.is_success() {
        warn!(status = head.status, body = %response.text(), "upload rejected");
        return Err(WakeError::HttpStatus(head.status));
    }
    info!(
        status = head.status,
        body_len,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "upload complete"
    );
    Ok(outcome)
}

/// Write all of `bytes`, retrying failed writes.
pub(crate) fn send_all(
    conn: &mut dyn Connection,
    bytes: &[u8],
    progress: &mut UploadProgress,
    config: &UploadConfig,
) -> Result<()> {
    let chunk = config.chunk_size.max(1);
    let mut offset = 0;

    while offset < bytes.len() {
        let end = (offset + chunk).min(bytes.len());
        let failure = match conn.write(&bytes[offset..end]) {
            Ok(0) => io::Error::new(io::ErrorKind::WriteZero, "zero-length write"),
            Ok(n) => {
                offset += n;
                progress.bytes_sent += n;
                progress.consecutive_failures = 0;
                if progress.bytes_sent >= progress.next_log {
                    debug!(
                        sent = progress.bytes_sent,
                        total = progress.target_bytes,
                        "upload progress"
                    );
                    progress.next_log = progress.bytes_sent + config.progress_log_bytes.max(1);
                }
                continue;
            }
            Err(e) => e,
        };

        progress.consecutive_failures += 1;
        warn!(
            error = %failure,
            attempt = progress.consecutive_failures,
            sent = progress.bytes_sent,
            "upload write failed"
        );
        if progress.consecutive_failures >= config.max_consecutive_failures {
            return Err(WakeError::WriteRetriesExhausted {
                bytes_sent: progress.bytes_sent,
                failures: progress.consecutive_failures,
            });
        }
        if !config.retry_delay.is_zero() {
            std::thread::sleep(config.retry_delay);
        }
    }
    Ok(())
}

/// Poll for response headers until `response_timeout` has elapsed.
pub(crate) fn await_headers(
    conn: &mut dyn Connection,
    config: &UploadConfig,
) -> Result<super::ResponseHead> {
    let started = Instant::now();
    let mut next_log = Duration::from_secs(10);

    loop {
        let elapsed = started.elapsed();
        if elapsed >= config.response_timeout {
            return Err(WakeError::ResponseTimeout(config.response_timeout));
        }
        let wait = config
            .poll_interval
            .min(config.response_timeout - elapsed);
        if let Some(head) = conn.fetch_headers(wait)? {
            return Ok(head);
        }
        if started.elapsed() >= next_log {
            info!(
                waited_secs = started.elapsed().as_secs(),
                "still waiting for server response"
            );
            next_log += Duration::from_secs(10);
        }
    }
}

/// Read up to `limit` bytes into `response`. Read errors end the body early.
pub(crate) fn read_body(
    conn: &mut dyn Connection,
    response: &mut ResponseBuffer,
    limit: usize,
) -> usize {
    let mut chunk = [0u8; 512];
    let mut total = 0;

    while total < limit && response.remaining() > 0 {
        let want = chunk.len().min(limit - total);
        match conn.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => {
                response.push(&chunk[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, read = total, "response body read failed");
                break;
            }
        }
    }
    response.len()
}
