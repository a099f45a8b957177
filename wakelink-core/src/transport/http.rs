//! Blocking HTTP transport on top of `reqwest`.
//!
//! A request runs on its own thread. For `POST` the body is a sized reader fed
//! through a bounded channel, so each [`Connection::write`] hands one chunk to
//! the socket side and can fail (timeout, peer gone) independently. The
//! response comes back over a second channel and is polled by
//! [`Connection::fetch_headers`].

use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use reqwest::blocking::{Body, Client, Response};
use tracing::debug;

use crate::error::{Result, WakeError};
use crate::transport::{Connection, Method, Request, ResponseHead, Transport};

#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// How long one body chunk may wait for the socket before the write fails.
    pub write_timeout: Duration,
    /// Body chunks buffered between the caller and the socket.
    pub channel_depth: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            channel_depth: 4,
        }
    }
}

pub struct HttpTransport {
    client: Client,
    config: HttpConfig,
}

impl HttpTransport {
    /// Build the client. Must not be called from inside an async task.
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| WakeError::ConnectionOpen {
                url: String::new(),
                reason: format!("client build failed: {e}"),
            })?;
        Ok(Self { client, config })
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: &Request) -> Result<Box<dyn Connection>> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder.timeout(request.timeout);
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body_tx = match (request.method, request.content_length) {
            (Method::Post, Some(len)) => {
                let (tx, rx) = bounded::<Vec<u8>>(self.config.channel_depth.max(1));
                builder = builder.body(Body::sized(ChannelReader::new(rx), len));
                Some(tx)
            }
            _ => None,
        };

        let (response_tx, response_rx) = bounded(1);
        let url = request.url.clone();
        thread::Builder::new()
            .name("wakelink-http".into())
            .spawn(move || {
                let result = builder.send();
                if let Err(e) = &result {
                    debug!(error = %e, "http request ended with error");
                }
                let _ = response_tx.send(result);
            })
            .map_err(|e| WakeError::ConnectionOpen {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(HttpConnection {
            url,
            body_tx,
            response_rx,
            early: None,
            response: None,
            write_timeout: self.config.write_timeout,
        }))
    }
}

struct HttpConnection {
    url: String,
    body_tx: Option<Sender<Vec<u8>>>,
    response_rx: Receiver<reqwest::Result<Response>>,
    /// Response that arrived while the body was still being written.
    early: Option<reqwest::Result<Response>>,
    response: Option<Response>,
    write_timeout: Duration,
}

impl HttpConnection {
    fn accept(&mut self, result: reqwest::Result<Response>) -> Result<ResponseHead> {
        match result {
            Ok(response) => {
                let head = ResponseHead {
                    status: response.status().as_u16(),
                    content_length: response.content_length(),
                };
                self.response = Some(response);
                Ok(head)
            }
            Err(e) => Err(WakeError::ConnectionOpen {
                url: self.url.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

impl Connection for HttpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(tx) = &self.body_tx else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "request body closed"));
        };
        match tx.send_timeout(buf.to_vec(), self.write_timeout) {
            Ok(()) => Ok(buf.len()),
            Err(SendTimeoutError::Timeout(_)) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "socket not draining"))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                let reason = match self.response_rx.try_recv() {
                    Ok(Err(e)) => {
                        let reason = e.to_string();
                        self.early = Some(Err(e));
                        reason
                    }
                    Ok(Ok(response)) => {
                        let reason = format!("server answered early ({})", response.status());
                        self.early = Some(Ok(response));
                        reason
                    }
                    Err(_) => "request ended".to_string(),
                };
                Err(io::Error::new(io::ErrorKind::BrokenPipe, reason))
            }
        }
    }

    fn fetch_headers(&mut self, wait: Duration) -> Result<Option<ResponseHead>> {
        // Dropping the sender ends the body stream.
        self.body_tx = None;

        if let Some(response) = &self.response {
            return Ok(Some(ResponseHead {
                status: response.status().as_u16(),
                content_length: response.content_length(),
            }));
        }
        if let Some(result) = self.early.take() {
            return self.accept(result).map(Some);
        }
        match self.response_rx.recv_timeout(wait) {
            Ok(result) => self.accept(result).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(WakeError::ConnectionOpen {
                url: self.url.clone(),
                reason: "request thread exited".into(),
            }),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.response.as_mut() {
            Some(response) => response.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no response yet")),
        }
    }
}

/// Request body assembled from chunks sent over a channel. Ends when every
/// sender is gone.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_reader_joins_chunks_and_ends_on_disconnect() {
        let (tx, rx) = bounded(4);
        tx.send(b"RIFF".to_vec()).unwrap();
        tx.send(Vec::new()).unwrap();
        tx.send(b"WAVE".to_vec()).unwrap();
        drop(tx);

        let mut out = Vec::new();
        ChannelReader::new(rx).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"RIFFWAVE");
    }

    #[test]
    fn channel_reader_respects_small_buffers() {
        let (tx, rx) = bounded(1);
        tx.send(vec![1, 2, 3]).unwrap();
        drop(tx);
        let mut reader = ChannelReader::new(rx);
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
