//! The single byte-stream link to the microcontroller.
//!
//! A [`Link`] is cheap to clone; every clone refers to the same physical
//! port. The ingestor owns the lifecycle (open / read / close); the command
//! channel only writes. Reads and writes go through separate halves of the
//! port so a pending read never holds up a command.
//!
//! ```text
//! Disconnected ──open ok──▶ Connected ──i/o error──▶ Failed
//!      ▲                        │                      │
//!      └─────────close──────────┴──────────close───────┘
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::{watch, Mutex};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

use crate::config::SerialConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connected,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("port {path} unavailable: {reason}")]
    PortUnavailable { path: String, reason: String },
    #[error("link not connected")]
    NotConnected,
    #[error("link i/o failure: {0}")]
    IoFailure(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Ports and connectors
// ---------------------------------------------------------------------------

/// Anything that can stand in for the serial device.
pub trait Port: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Port for T {}

pub type BoxedPort = Box<dyn Port>;

/// Produces a fresh physical connection each time the link is opened.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<BoxedPort, LinkError>;
}

/// Opens the configured serial device through `tokio-serial`.
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(cfg: &SerialConfig) -> Self {
        Self {
            path: cfg.port.clone(),
            baud_rate: cfg.baud_rate,
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> Result<BoxedPort, LinkError> {
        let stream = tokio_serial::new(&self.path, self.baud_rate)
            .open_native_async()
            .map_err(|e| LinkError::PortUnavailable {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}

// ---------------------------------------------------------------------------
// Line reader
// ---------------------------------------------------------------------------

/// Longest line kept before the reader gives up on finding its end.
pub const MAX_LINE_LEN: usize = 1024;

/// Buffered read half that keeps partial lines across timeouts.
struct LineReader {
    inner: BufReader<ReadHalf<BoxedPort>>,
    partial: Vec<u8>,
    /// Set after an overlong line; bytes are dropped up to the next newline.
    skipping: bool,
}

impl LineReader {
    fn new(half: ReadHalf<BoxedPort>) -> Self {
        Self {
            inner: BufReader::new(half),
            partial: Vec::with_capacity(256),
            skipping: false,
        }
    }

    /// Bytes consumed before a cancellation stay in `partial`, so this is
    /// safe to race against a timeout.
    ///
    /// A line longer than [`MAX_LINE_LEN`] is cut off and returned as is;
    /// the rest of it up to the next newline is discarded.
    async fn next_line(&mut self) -> io::Result<String> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device closed the stream",
                ));
            }
            let newline = available.iter().position(|b| *b == b'\n');

            if self.skipping {
                let used = match newline {
                    Some(i) => {
                        self.skipping = false;
                        i + 1
                    }
                    None => available.len(),
                };
                self.inner.consume(used);
                continue;
            }

            let room = MAX_LINE_LEN - self.partial.len();
            let (used, complete) = match newline {
                Some(i) if i < room => (i + 1, true),
                _ => (available.len().min(room), false),
            };
            self.partial.extend_from_slice(&available[..used]);
            self.inner.consume(used);

            if complete {
                return Ok(self.take_line());
            }
            if self.partial.len() >= MAX_LINE_LEN {
                warn!(limit = MAX_LINE_LEN, "link: line too long, discarding rest");
                self.skipping = true;
                return Ok(self.take_line());
            }
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.partial).trim().to_string();
        self.partial.clear();
        line
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Link {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Box<dyn Connector>,
    state: watch::Sender<LinkState>,
    // Lock order when both are needed: reader, then writer.
    reader: Mutex<Option<LineReader>>,
    writer: Mutex<Option<WriteHalf<BoxedPort>>>,
}

impl Link {
    pub fn new(connector: impl Connector + 'static) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector: Box::new(connector),
                state,
                reader: Mutex::new(None),
                writer: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.inner.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "link state changed");
        }
    }

    /// Open the physical port. A no-op when already connected.
    pub async fn open(&self) -> Result<(), LinkError> {
        let mut reader = self.inner.reader.lock().await;
        let mut writer = self.inner.writer.lock().await;

        if self.state() == LinkState::Connected && reader.is_some() {
            return Ok(());
        }

        // Release any stale halves first: one physical connection at a time.
        reader.take();
        writer.take();

        let port = match self.inner.connector.connect() {
            Ok(port) => port,
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };

        let (rd, wr) = tokio::io::split(port);
        *reader = Some(LineReader::new(rd));
        *writer = Some(wr);
        self.set_state(LinkState::Connected);
        Ok(())
    }

    pub async fn close(&self) {
        let mut reader = self.inner.reader.lock().await;
        let mut writer = self.inner.writer.lock().await;
        reader.take();
        writer.take();
        self.set_state(LinkState::Disconnected);
    }

    /// Wait up to `timeout` for one complete line.
    ///
    /// `Ok(None)` means nothing arrived in time. End of stream counts as an
    /// I/O failure: the device went away.
    pub async fn read_line(&self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let mut guard = self.inner.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        match tokio::time::timeout(timeout, reader.next_line()).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok(line)) => Ok(Some(line)),
            Ok(Err(e)) => {
                self.set_state(LinkState::Failed);
                Err(LinkError::IoFailure(e))
            }
        }
    }

    /// Write and flush `bytes` as one unit. Concurrent callers queue on the
    /// write lock in arrival order.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.inner.writer.lock().await;
        if self.state() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.set_state(LinkState::Failed);
            return Err(LinkError::IoFailure(e));
        }
        Ok(())
    }
}

// ===========================================================================
// Test doubles (shared with other modules' tests)
// ===========================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};
    use tokio::time::Instant;

    /// In-memory stand-in for the serial device.
    ///
    /// Reads come from a duplex pipe fed by [`Device`]. Writes are appended
    /// to a shared log a few bytes at a time, yielding between chunks so
    /// concurrent writers get every chance to interleave.
    pub(crate) struct TestPort {
        incoming: DuplexStream,
        written: Arc<StdMutex<Vec<u8>>>,
        max_chunk: usize,
        yield_next: bool,
        fail_after_lines: Option<usize>,
    }

    impl TestPort {
        /// Fail every write once `lines` complete lines have gone out.
        pub(crate) fn fail_after_lines(mut self, lines: usize) -> Self {
            self.fail_after_lines = Some(lines);
            self
        }
    }

    impl AsyncRead for TestPort {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.incoming).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TestPort {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = &mut *self;
            if let Some(limit) = this.fail_after_lines {
                let lines = this.written.lock().unwrap().iter().filter(|b| **b == b'\n').count();
                if lines >= limit {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "device unplugged",
                    )));
                }
            }
            if this.yield_next {
                this.yield_next = false;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            this.yield_next = true;
            let n = buf.len().min(this.max_chunk);
            this.written.lock().unwrap().extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// The test's side of a [`TestPort`]: feeds lines in, inspects writes.
    pub(crate) struct Device {
        tx: DuplexStream,
        written: Arc<StdMutex<Vec<u8>>>,
    }

    impl Device {
        pub(crate) async fn send_line(&mut self, line: &str) {
            self.tx.write_all(line.as_bytes()).await.unwrap();
            self.tx.write_all(b"\n").await.unwrap();
        }

        pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
            self.tx.write_all(bytes).await.unwrap();
        }

        pub(crate) fn written(&self) -> String {
            String::from_utf8(self.written.lock().unwrap().clone()).unwrap()
        }

        pub(crate) fn written_lines(&self) -> Vec<String> {
            self.written().lines().map(str::to_string).collect()
        }
    }

    pub(crate) fn port_pair() -> (TestPort, Device) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let written = Arc::new(StdMutex::new(Vec::new()));
        let port = TestPort {
            incoming: ours,
            written: Arc::clone(&written),
            max_chunk: 3,
            yield_next: false,
            fail_after_lines: None,
        };
        (port, Device { tx: theirs, written })
    }

    /// Hands out pre-built ports in order; `None` slots (or an exhausted
    /// queue) simulate a missing device. Records every attempt.
    pub(crate) struct TestConnector {
        slots: StdMutex<VecDeque<Option<TestPort>>>,
        attempts: Arc<StdMutex<Vec<Instant>>>,
    }

    impl TestConnector {
        pub(crate) fn new(slots: Vec<Option<TestPort>>) -> Self {
            Self {
                slots: StdMutex::new(slots.into()),
                attempts: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        pub(crate) fn attempts(&self) -> Arc<StdMutex<Vec<Instant>>> {
            Arc::clone(&self.attempts)
        }
    }

    impl Connector for TestConnector {
        fn connect(&self) -> Result<BoxedPort, LinkError> {
            self.attempts.lock().unwrap().push(Instant::now());
            match self.slots.lock().unwrap().pop_front() {
                Some(Some(port)) => Ok(Box::new(port)),
                _ => Err(LinkError::PortUnavailable {
                    path: "/dev/test".into(),
                    reason: "no such device".into(),
                }),
            }
        }
    }

    /// A link that is already open on a fresh test port.
    pub(crate) async fn connected_link() -> (Link, Device) {
        let (port, device) = port_pair();
        let link = Link::new(TestConnector::new(vec![Some(port)]));
        link.open().await.unwrap();
        (link, device)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
