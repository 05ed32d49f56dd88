//! In-memory relay transport
//!
//! `pair()` returns two connected endpoints; whatever one side sends, the
//! other receives, frame by frame. `MemoryConnector` hands one endpoint to a
//! relay session and records the connect requests it saw, so tests can play
//! the relay on the other endpoint.
//!
//! An endpoint can be told to stop writing after a number of frames, which
//! stands in for a relay that no longer reads.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::{
    ConnectRequest, FramePair, FrameSink, FrameSource, RelayConnector, TransportError,
    TransportResult,
};

/// One side of an in-memory connection
#[derive(Debug)]
pub struct MemoryEndpoint {
    pub sink: MemorySink,
    pub source: MemorySource,
}

impl MemoryEndpoint {
    /// Deliver the next `frames` frames, then block every later write forever
    pub fn stall_writes_after(mut self, frames: usize) -> Self {
        self.sink.write_budget = Some(frames);
        self
    }

    pub fn into_boxed(self) -> FramePair {
        (Box::new(self.sink), Box::new(self.source))
    }
}

/// Create two connected endpoints
pub fn pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    (
        MemoryEndpoint {
            sink: MemorySink {
                tx: Some(a_tx),
                write_budget: None,
            },
            source: MemorySource { rx: b_rx },
        },
        MemoryEndpoint {
            sink: MemorySink {
                tx: Some(b_tx),
                write_budget: None,
            },
            source: MemorySource { rx: a_rx },
        },
    )
}

#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// Frames left before writes stall; `None` never stalls
    write_budget: Option<usize>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        match self.write_budget.as_mut() {
            Some(0) => std::future::pending::<()>().await,
            Some(left) => *left -= 1,
            None => {}
        }
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        // Dropping the sender ends the peer's source
        self.tx.take();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

/// Connector that hands out a pre-built endpoint
#[derive(Debug)]
pub struct MemoryConnector {
    endpoint: Mutex<Option<MemoryEndpoint>>,
    rejection: Option<String>,
    requests: Mutex<Vec<ConnectRequest>>,
}

impl MemoryConnector {
    pub fn new(endpoint: MemoryEndpoint) -> Self {
        Self {
            endpoint: Mutex::new(Some(endpoint)),
            rejection: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A connector whose relay refuses the credential at connect time
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            endpoint: Mutex::new(None),
            rejection: Some(reason.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Connect requests seen so far
    pub async fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<FramePair> {
        self.requests.lock().await.push(request.clone());

        if let Some(reason) = &self.rejection {
            return Err(TransportError::AuthenticationFailed(reason.clone()));
        }

        self.endpoint
            .lock()
            .await
            .take()
            .map(MemoryEndpoint::into_boxed)
            .ok_or_else(|| TransportError::ConnectionError("Endpoint already used".to_string()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
