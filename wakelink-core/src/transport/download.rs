//! Size-capped download of the synthesised reply.
//!
//! The advertised length is checked before anything is allocated or read:
//! missing, zero or over-cap lengths are rejected outright. The body is then
//! read into a buffer of exactly that size; ending early is a failure.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::audio::SampleSink;
use crate::container::{self, WavHeader, HEADER_LEN};
use crate::error::{Result, WakeError};
use crate::transport::{Request, Transport};

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfig {
    pub max_bytes: usize,
    pub timeout: Duration,
    pub read_chunk: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 500_000,
            timeout: Duration::from_secs(30),
            read_chunk: 4096,
        }
    }
}

/// A validated container, decoded to samples.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedAudio {
    pub header: WavHeader,
    pub samples: Vec<i16>,
    pub bytes: usize,
}

/// Fetch and validate a container from `url`.
pub fn download(
    transport: &dyn Transport,
    url: &str,
    config: &DownloadConfig,
) -> Result<DownloadedAudio> {
    let started = Instant::now();
    let request = Request::get(url, config.timeout);
    let mut conn = transport.open(&request)?;

    let head = conn
        .fetch_headers(config.timeout)?
        .ok_or(WakeError::ResponseTimeout(config.timeout))?;
    if !head.is_success() {
        return Err(WakeError::HttpStatus(head.status));
    }

    let expected = match head.content_length {
        None | Some(0) => return Err(WakeError::InvalidContentLength(head.content_length)),
        Some(len) if len > config.max_bytes as u64 => {
            return Err(WakeError::DownloadTooLarge {
                advertised: len,
                cap: config.max_bytes,
            })
        }
        Some(len) => len as usize,
    };

    let mut bytes: Vec<u8> = Vec::new();
    bytes
        .try_reserve_exact(expected)
        .map_err(|_| WakeError::ResourceExhausted {
            purpose: "download buffer",
            bytes: expected,
        })?;
    bytes.resize(expected, 0);

    let step = config.read_chunk.max(1);
    let mut received = 0;
    let mut next_report = expected / 10;
    while received < expected {
        let end = (received + step).min(expected);
        match conn.read(&mut bytes[received..end]) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WakeError::Io(e)),
        }
        if received >= next_report {
            debug!(received, expected, "download progress");
            next_report = received + expected / 10;
        }
    }
    drop(conn);

    if received < expected {
        return Err(WakeError::ShortRead { received, expected });
    }

    let header = container::validate(&bytes)?;
    let samples = container::decode_pcm(&bytes[HEADER_LEN..]);
    info!(
        bytes = expected,
        sample_rate = header.sample_rate,
        samples = samples.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "reply audio downloaded"
    );
    Ok(DownloadedAudio {
        header,
        samples,
        bytes: expected,
    })
}

/// Download `url` and play it through `sink`. Returns the bytes fetched.
pub fn download_and_play(
    transport: &dyn Transport,
    url: &str,
    sink: &mut dyn SampleSink,
    config: &DownloadConfig,
) -> Result<usize> {
    let audio = download(transport, url, config)?;
    if audio.header.channels > 1 {
        debug!(channels = audio.header.channels, "reply is not mono, playing as-is");
    }
    sink.play(&audio.samples, audio.header.sample_rate)?;
    Ok(audio.bytes)
}
