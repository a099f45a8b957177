//! Streaming transfer to and from the inference service.
//!
//! ## Seams
//!
//! ```text
//! Transport::open(Request) ──► Connection
//!                               ├─ write(&[u8])       request body, chunk by chunk
//!                               ├─ fetch_headers(wait) status + content length
//!                               └─ read(&mut [u8])    response body
//! ```
//!
//! A connection is released when it is dropped, so every early return in the
//! sessions releases it. [`http::HttpTransport`] is the production transport;
//! tests drive the sessions through scripted connections.

pub mod download;
#[cfg(feature = "http")]
pub mod http;
pub mod location;
pub mod reply;
pub mod upload;

pub use download::{download, download_and_play, DownloadConfig, DownloadedAudio};
#[cfg(feature = "http")]
pub use http::{HttpConfig, HttpTransport};
pub use location::{report_location, LocationInfo};
pub use reply::ServiceReply;
pub use upload::{upload, UploadConfig, UploadOutcome, UploadProgress, UploadTarget};

use std::io;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Exact body length for `POST`. The transport sends it as `Content-Length`.
    pub content_length: Option<u64>,
    /// Wall-clock bound on the whole exchange.
    pub timeout: Duration,
}

impl Request {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            content_length: None,
            timeout,
        }
    }

    pub fn post(url: impl Into<String>, content_length: u64, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            content_length: Some(content_length),
            timeout,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status line and length of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An open request/response exchange.
pub trait Connection {
    /// Write part of the request body. `Ok(0)` or an error is a failed write.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Finish the request body and wait up to `wait` for response headers.
    /// `Ok(None)` means they have not arrived yet; the caller may poll again.
    fn fetch_headers(&mut self, wait: Duration) -> Result<Option<ResponseHead>>;

    /// Read part of the response body. `Ok(0)` is end of body.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens connections. Failure to open maps to `WakeError::ConnectionOpen`.
pub trait Transport {
    fn open(&self, request: &Request) -> Result<Box<dyn Connection>>;
}

/// Fixed-capacity text buffer for a response body.
///
/// Holds at most `capacity - 1` bytes followed by a zero terminator and never
/// grows after construction.
#[derive(Debug, Clone)]
pub struct ResponseBuffer {
    buf: Vec<u8>,
    len: usize,
    truncated: bool,
}

impl ResponseBuffer {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "response buffer needs room for the terminator");
        Self {
            buf: vec![0; capacity],
            len: 0,
            truncated: false,
        }
    }

    /// Room left for payload bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - 1 - self.len
    }

    /// Copy as much of `bytes` as fits; returns bytes kept.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let take = self.remaining().min(bytes.len());
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        self.buf[self.len] = 0;
        if take < bytes.len() {
            self.truncated = true;
        }
        take
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
        self.buf[0] = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Stored bytes including the terminator.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..=self.len]
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted connections for session tests.

    use super::*;
    use crate::error::WakeError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// What the scripted connection does on each `write` call.
    #[derive(Debug, Clone, Copy)]
    pub enum WriteStep {
        Accept,
        /// Accept at most this many bytes.
        Partial(usize),
        Zero,
        Fail,
    }

    #[derive(Debug, Default)]
    pub struct Record {
        pub requests: Vec<Request>,
        pub write_calls: usize,
        pub body: Vec<u8>,
        pub read_calls: usize,
        pub dropped: bool,
    }

    pub struct ScriptedTransport {
        pub record: Arc<Mutex<Record>>,
        pub writes: Arc<Mutex<VecDeque<WriteStep>>>,
        /// Repeats once `writes` is empty.
        pub default_write: WriteStep,
        pub head: Option<ResponseHead>,
        pub body: Vec<u8>,
        pub refuse: bool,
    }

    impl ScriptedTransport {
        pub fn responding(status: u16, body: &[u8]) -> Self {
            Self {
                record: Arc::default(),
                writes: Arc::default(),
                default_write: WriteStep::Accept,
                head: Some(ResponseHead {
                    status,
                    content_length: Some(body.len() as u64),
                }),
                body: body.to_vec(),
                refuse: false,
            }
        }
    }

    struct ScriptedConnection {
        record: Arc<Mutex<Record>>,
        writes: Arc<Mutex<VecDeque<WriteStep>>>,
        default_write: WriteStep,
        head: Option<ResponseHead>,
        body: VecDeque<u8>,
    }

    impl Transport for ScriptedTransport {
        fn open(&self, request: &Request) -> Result<Box<dyn Connection>> {
            if self.refuse {
                return Err(WakeError::ConnectionOpen {
                    url: request.url.clone(),
                    reason: "refused".into(),
                });
            }
            self.record.lock().requests.push(request.clone());
            Ok(Box::new(ScriptedConnection {
                record: Arc::clone(&self.record),
                writes: Arc::clone(&self.writes),
                default_write: self.default_write,
                head: self.head,
                body: self.body.iter().copied().collect(),
            }))
        }
    }

    impl Connection for ScriptedConnection {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let step = self.writes.lock().pop_front().unwrap_or(self.default_write);
            let mut rec = self.record.lock();
            rec.write_calls += 1;
            let n = match step {
                WriteStep::Accept => buf.len(),
                WriteStep::Partial(max) => buf.len().min(max),
                WriteStep::Zero => 0,
                WriteStep::Fail => return Err(io::Error::new(io::ErrorKind::TimedOut, "stub")),
            };
            rec.body.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn fetch_headers(&mut self, _wait: Duration) -> Result<Option<ResponseHead>> {
            Ok(self.head)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.record.lock().read_calls += 1;
            let n = buf.len().min(self.body.len());
            for (dst, src) in buf.iter_mut().zip(self.body.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    impl Drop for ScriptedConnection {
        fn drop(&mut self) {
            self.record.lock().dropped = true;
        }
    }
}
