//! Streaming transport contracts and the glue pumping bytes into the engine.
//!
//! The core does not pick an HTTP stack. It consumes an abstract transport
//! that can start a request with headers and a body, deliver the response as
//! a sequence of opaque byte chunks, and honor pause/resume within half a
//! second so bandwidth caps bite. Retries replay the same idempotency id; the
//! server deduplicates on it.
//!
//! [`HttpPump`] is the engine-side consumer: it buffers unconsumed bytes,
//! feeds the request dispatcher as chunks arrive, and translates engine
//! backpressure into [`Flow::Pause`] for the transport.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::commands::{RequestDispatcher, RetryReason};

/// Flow-control verdict returned by body producers and chunk consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop delivering within 500 ms; the transfer stays alive and resumes
    /// when the peer asks again.
    Pause,
}

/// Identifier of one in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// How a finished transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    NetworkError,
}

/// One request handed to the transport.
pub struct TransportRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Replayed verbatim on retry; appended as a query parameter by the
    /// HTTP layer.
    pub idempotency_id: String,
    pub body: Bytes,
}

/// Receiver of response bytes for one transfer.
pub trait TransferSink: Send {
    /// A chunk of response body. Returning [`Flow::Pause`] suspends
    /// delivery; the transport keeps the rest buffered.
    fn on_chunk(&mut self, chunk: &[u8]) -> Flow;

    /// Transfer finished or died. After a `NetworkError` the same bytes may
    /// be retransmitted under the same idempotency id.
    fn on_complete(&mut self, status: TransferStatus);
}

/// Minimal surface the engine requires of an HTTP implementation.
pub trait StreamingTransport {
    fn start(&mut self, request: TransportRequest, sink: Box<dyn TransferSink>) -> TransferId;
    fn cancel(&mut self, id: TransferId);
}

/// Bandwidth ceilings for the two directions, bytes per second. Zero is not
/// a valid cap; use `None` for unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthCaps {
    download_bps: Option<u64>,
    upload_bps: Option<u64>,
}

impl BandwidthCaps {
    pub fn set_download_bps(&mut self, cap: Option<u64>) -> bool {
        if cap == Some(0) {
            tracing::warn!("rejecting zero download cap");
            return false;
        }
        self.download_bps = cap;
        true
    }

    pub fn set_upload_bps(&mut self, cap: Option<u64>) -> bool {
        if cap == Some(0) {
            tracing::warn!("rejecting zero upload cap");
            return false;
        }
        self.upload_bps = cap;
        true
    }

    pub fn download_bps(&self) -> Option<u64> {
        self.download_bps
    }

    pub fn upload_bps(&self) -> Option<u64> {
        self.upload_bps
    }
}

/// Proof-of-work challenge extracted from the `X-Hashcash` response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashcashChallenge {
    pub easiness: u8,
    pub timestamp: i64,
    /// 64 Base64 characters, 48 bytes decoded.
    pub token: String,
}

impl HashcashChallenge {
    /// Solves the challenge; empty on a malformed token.
    pub fn solve(&self, max_workers: usize) -> String {
        crate::hashcash::gencash(&self.token, self.easiness, max_workers)
    }

    /// Value of the `X-Hashcash` request header carrying the solution.
    pub fn retry_header(prefix: &str) -> String {
        format!("1:{prefix}")
    }
}

/// Parses an `X-Hashcash: 1:<easiness>:<timestamp>:<token>` header value.
///
/// The input is a length-bounded slice, never assumed NUL-terminated, and
/// the token must be exactly 64 Base64 characters.
pub fn parse_hashcash_header(value: &[u8]) -> Option<HashcashChallenge> {
    let text = std::str::from_utf8(value).ok()?.trim();
    let mut parts = text.splitn(4, ':');
    if parts.next()? != "1" {
        return None;
    }
    let easiness = parts.next()?.parse::<u8>().ok()?;
    let timestamp = parts.next()?.parse::<i64>().ok()?;
    let token = parts.next()?;
    if token.len() != 64 {
        return None;
    }
    if !token
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'-' | b'_' | b'='))
    {
        return None;
    }
    Some(HashcashChallenge {
        easiness,
        timestamp,
        token: token.to_string(),
    })
}

/// Engine-side chunk consumer for the command channel: buffers what the
/// dispatcher has not consumed yet and replays it with the next chunk.
pub struct HttpPump {
    dispatcher: Rc<RefCell<RequestDispatcher>>,
    buffer: Vec<u8>,
    paused: bool,
}

impl HttpPump {
    pub fn new(dispatcher: Rc<RefCell<RequestDispatcher>>) -> Self {
        Self {
            dispatcher,
            buffer: Vec::new(),
            paused: false,
        }
    }

    /// Suspends or resumes delivery into the dispatcher. While paused,
    /// arriving chunks are buffered and the transport is told to hold off.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        if !paused && !self.buffer.is_empty() {
            let consumed = self.dispatcher.borrow_mut().server_chunk(&self.buffer);
            self.buffer.drain(..consumed);
        }
    }

    /// Feeds one arriving chunk; the return value is the transport's cue.
    pub fn deliver(&mut self, chunk: &[u8]) -> Flow {
        self.buffer.extend_from_slice(chunk);
        if self.paused {
            return Flow::Pause;
        }
        let consumed = self.dispatcher.borrow_mut().server_chunk(&self.buffer);
        self.buffer.drain(..consumed);
        Flow::Continue
    }

    /// The transfer ended; flush whatever remains as the final bytes.
    pub fn complete(&mut self) {
        let rest = std::mem::take(&mut self.buffer);
        self.dispatcher.borrow_mut().server_response(&rest);
    }

    /// The transfer died; the dispatcher rewinds for a retry under the same
    /// idempotency id.
    pub fn failed(&mut self) {
        self.buffer.clear();
        self.dispatcher
            .borrow_mut()
            .inflight_failure(RetryReason::NetworkFailure);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drains a whole chunk stream into the dispatcher, honoring pauses by
    /// polling again on resume. Convenience seam for stream-shaped
    /// transports.
    pub async fn drive_stream<S>(&mut self, stream: &mut S)
    where
        S: futures_util::Stream<Item = Bytes> + Unpin,
    {
        use futures_util::StreamExt as _;
        while let Some(chunk) = stream.next().await {
            let _ = self.deliver(&chunk);
        }
        self.complete();
    }
}
