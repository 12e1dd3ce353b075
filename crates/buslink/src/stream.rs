use std::sync::Arc;

use bytes::Buf;
use tokio::sync::oneshot;

use crate::claim::{ClaimShared, PendingWrite};
use crate::error::{ClaimError, Result};

/// One logical, ordered byte stream multiplexed over a claimed device.
///
/// Handles are cheap to clone; the stream itself is owned by the claim's
/// connection map, and every operation re-checks that it is still there. Bytes
/// arrive in the order the peer produced them; nothing is guaranteed across
/// different streams.
#[derive(Clone)]
pub struct StreamConnection {
    shared: Arc<ClaimShared>,
    id: i32,
}

impl StreamConnection {
    pub(crate) fn new(shared: Arc<ClaimShared>, id: i32) -> Self {
        Self { shared, id }
    }

    /// The device-assigned stream id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// True while the stream is open and its claim is healthy.
    pub fn is_alive(&self) -> bool {
        let state = self.shared.lock_state();
        state
            .streams
            .get(&self.id)
            .is_some_and(|s| !s.closed && s.fault.is_none())
    }

    /// Buffered inbound bytes deliverable without suspending.
    pub fn available(&self) -> usize {
        let state = self.shared.lock_state();
        state
            .streams
            .get(&self.id)
            .map_or(0, |s| s.inbound.len())
    }

    /// Read some bytes. Drains buffered inbound data first; parks until the
    /// demultiplexer delivers more otherwise. Returns `Ok(0)` at clean EOF
    /// after the peer closed its end.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let read_ready = {
                let mut state = self.shared.lock_state();
                let Some(stream) = state.streams.get_mut(&self.id) else {
                    return Err(ClaimError::BrokenPipe);
                };

                if !stream.inbound.is_empty() {
                    let n = buf.len().min(stream.inbound.len());
                    buf[..n].copy_from_slice(&stream.inbound[..n]);
                    stream.inbound.advance(n);
                    return Ok(n);
                }
                if let Some(fault) = stream.fault.clone() {
                    if !stream.fault_reported {
                        stream.fault_reported = true;
                        return Err(ClaimError::Device(fault));
                    }
                    return Err(ClaimError::BrokenPipe);
                }
                if stream.remote_closed {
                    return Ok(0);
                }
                if stream.closed {
                    return Err(ClaimError::BrokenPipe);
                }
                Arc::clone(&stream.read_ready)
            };
            read_ready.notified().await;
        }
    }

    /// Write some bytes. Completion means the claim has copied every byte
    /// into an outbound subpacket, not that the device received them.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let done = {
            let mut state = self.shared.lock_state();
            let Some(stream) = state.streams.get_mut(&self.id) else {
                return Err(ClaimError::BrokenPipe);
            };
            if let Some(fault) = stream.fault.clone() {
                if !stream.fault_reported {
                    stream.fault_reported = true;
                    return Err(ClaimError::Device(fault));
                }
                return Err(ClaimError::BrokenPipe);
            }
            if stream.closed || stream.remote_closed {
                return Err(ClaimError::BrokenPipe);
            }
            let (tx, rx) = oneshot::channel();
            stream.pending_writes.push_back(PendingWrite {
                data: bytes::Bytes::copy_from_slice(data),
                offset: 0,
                done: tx,
            });
            rx
        };
        self.shared.write_wake.notify_one();
        match done.await {
            Ok(result) => result,
            Err(_) => Err(ClaimError::Aborted),
        }
    }

    /// Close this stream. Idempotent; pending reads and writes fail with a
    /// broken-pipe error, and the device is told unless the peer already
    /// signaled closure. Other streams on the same claim are untouched
    /// (unless this was the last one, which releases the claim).
    pub async fn close(&self) {
        self.shared.close_stream(self.id).await;
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .finish()
    }
}
