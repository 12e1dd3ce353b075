//! Exclusive device ownership and the multiplex/demultiplex engine.
//!
//! A [`DeviceClaim`] owns a device's bulk pipe pair for as long as any logical
//! stream is open. All stream writes funnel through its fair write scheduler
//! onto the single bulk-out pipe; all bulk-in completions are re-ordered by
//! submission sequence and demultiplexed back out to the stream matching the
//! subpacket's id. The physical channel is the unit of failure isolation: any
//! bulk-transfer error or inbound command subpacket closes the whole claim.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use buslink_backend::{BackendContext, ControlRequest, DeviceBackend, DeviceIo};
use buslink_frame::{
    decode_subpacket, encode_subpacket, Notification, SubpacketError, CMD_CLOSE_STREAM,
    CMD_OPEN_STREAM, CMD_RESET_ALL, CMD_SET_PROTOCOL, FLAG_DATA, HEADER_SIZE,
};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ClaimError, Result};
use crate::reorder::SequenceReorderer;
use crate::retry::RetryPolicy;
use crate::settings::{DeviceSettings, DeviceStatus};
use crate::stream::StreamConnection;

const VENDOR_OUT: u8 = 0x41;
const VENDOR_IN: u8 = 0xC1;

/// Tunables for one claim. The pool sizes are hand-tuned inheritance; they
/// bound concurrently outstanding bulk-in reads and encoded-but-unsent
/// outbound subpackets.
#[derive(Debug, Clone, Copy)]
pub struct ClaimConfig {
    pub read_buffer_count: usize,
    pub write_buffer_count: usize,
    pub retry: RetryPolicy,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            read_buffer_count: 4,
            write_buffer_count: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Exclusive claim over one device's bulk pipes.
pub struct DeviceClaim {
    shared: Arc<ClaimShared>,
}

impl DeviceClaim {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        ctx: Arc<BackendContext>,
        path: impl Into<String>,
        settings: Arc<DeviceSettings>,
        config: ClaimConfig,
    ) -> Self {
        Self {
            shared: Arc::new(ClaimShared {
                backend,
                ctx,
                path: path.into(),
                settings,
                config,
                state: Mutex::new(ClaimState::new()),
                write_wake: Notify::new(),
            }),
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.shared.lock_state().status
    }

    pub fn settings(&self) -> &Arc<DeviceSettings> {
        &self.shared.settings
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Open one logical stream, claiming the device first if nobody has.
    ///
    /// Requests arriving while a claim acquisition is in flight are queued and
    /// replayed in arrival order once the claim settles; if acquisition fails,
    /// every queued request fails with the same error.
    pub async fn create_connection(&self) -> Result<StreamConnection> {
        self.shared.create_connection().await
    }

    /// Close the claim: abort in-flight transfers, fail pending operations,
    /// wait for the engine to drain, release the device. Idempotent.
    pub async fn close(&self) {
        self.shared.close(None).await;
    }
}

enum CreateEntry {
    OpenNow,
    Wait(oneshot::Receiver<Result<StreamConnection>>),
    Acquire(oneshot::Receiver<Result<StreamConnection>>),
}

pub(crate) struct ClaimShared {
    backend: Arc<dyn DeviceBackend>,
    ctx: Arc<BackendContext>,
    path: String,
    pub(crate) settings: Arc<DeviceSettings>,
    config: ClaimConfig,
    pub(crate) state: Mutex<ClaimState>,
    pub(crate) write_wake: Notify,
}

pub(crate) struct ClaimState {
    pub(crate) status: DeviceStatus,
    pub(crate) io: Option<Arc<dyn DeviceIo>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    pub(crate) streams: HashMap<i32, StreamState>,
    pub(crate) active: VecDeque<i32>,
    pub(crate) idle: VecDeque<i32>,
    pending_creates: VecDeque<oneshot::Sender<Result<StreamConnection>>>,
    reorder: SequenceReorderer<Vec<u8>>,
    rx_buf: BytesMut,
}

impl ClaimState {
    fn new() -> Self {
        Self {
            status: DeviceStatus::Ready,
            io: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            streams: HashMap::new(),
            active: VecDeque::new(),
            idle: VecDeque::new(),
            pending_creates: VecDeque::new(),
            reorder: SequenceReorderer::new(),
            rx_buf: BytesMut::new(),
        }
    }

    pub(crate) fn unlist(&mut self, id: i32) {
        self.active.retain(|&x| x != id);
        self.idle.retain(|&x| x != id);
    }
}

/// Per-stream bookkeeping, owned by the claim's connection map.
pub(crate) struct StreamState {
    pub(crate) inbound: BytesMut,
    pub(crate) read_ready: Arc<Notify>,
    pub(crate) pending_writes: VecDeque<PendingWrite>,
    pub(crate) send_paused: bool,
    pub(crate) remote_closed: bool,
    pub(crate) closed: bool,
    pub(crate) fault: Option<String>,
    pub(crate) fault_reported: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            inbound: BytesMut::new(),
            read_ready: Arc::new(Notify::new()),
            pending_writes: VecDeque::new(),
            send_paused: false,
            remote_closed: false,
            closed: false,
            fault: None,
            fault_reported: false,
        }
    }

    fn has_sendable(&self) -> bool {
        !self.closed && !self.remote_closed && !self.send_paused && !self.pending_writes.is_empty()
    }

    fn fail_pending_writes(&mut self, make_err: impl Fn() -> ClaimError) {
        while let Some(pw) = self.pending_writes.pop_front() {
            let _ = pw.done.send(Err(make_err()));
        }
    }
}

pub(crate) struct PendingWrite {
    pub(crate) data: Bytes,
    pub(crate) offset: usize,
    pub(crate) done: oneshot::Sender<Result<usize>>,
}

impl ClaimShared {
    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, ClaimState> {
        self.state.lock().expect("claim state lock poisoned")
    }

    fn vendor_out(&self, request: u8, value: u16) -> ControlRequest {
        ControlRequest {
            request_type: VENDOR_OUT,
            request,
            value,
            index: self.settings.interface as u16,
        }
    }

    fn vendor_in(&self, request: u8, value: u16) -> ControlRequest {
        ControlRequest {
            request_type: VENDOR_IN,
            request,
            value,
            index: self.settings.interface as u16,
        }
    }

    async fn create_connection(self: &Arc<Self>) -> Result<StreamConnection> {
        self.ctx.check().map_err(ClaimError::from)?;

        let entry = {
            let mut state = self.lock_state();
            match state.status {
                DeviceStatus::Claimed => CreateEntry::OpenNow,
                DeviceStatus::Claiming => {
                    let (tx, rx) = oneshot::channel();
                    state.pending_creates.push_back(tx);
                    CreateEntry::Wait(rx)
                }
                DeviceStatus::Ready
                | DeviceStatus::Closed
                | DeviceStatus::Busy
                | DeviceStatus::Error => {
                    state.status = DeviceStatus::Claiming;
                    let (tx, rx) = oneshot::channel();
                    state.pending_creates.push_back(tx);
                    CreateEntry::Acquire(rx)
                }
                DeviceStatus::Closing | DeviceStatus::Cleanup => {
                    return Err(ClaimError::Aborted)
                }
                DeviceStatus::Shutdown => return Err(ClaimError::Shutdown),
                other => {
                    return Err(ClaimError::Device(format!(
                        "device not claimable (status {other})"
                    )))
                }
            }
        };

        match entry {
            CreateEntry::OpenNow => self.open_stream().await,
            CreateEntry::Wait(rx) => rx.await.map_err(|_| ClaimError::Aborted)?,
            CreateEntry::Acquire(rx) => {
                self.acquire().await;
                rx.await.map_err(|_| ClaimError::Aborted)?
            }
        }
    }

    /// Run one claim acquisition, then settle the queued create requests:
    /// replay them in order on success, fail them together on failure.
    async fn acquire(self: &Arc<Self>) {
        match self.acquire_inner().await {
            Ok(()) => loop {
                let Some(tx) = self.lock_state().pending_creates.pop_front() else {
                    break;
                };
                let result = self.open_stream().await;
                let _ = tx.send(result);
            },
            Err(err) => {
                warn!(path = %self.path, error = %err, "claim acquisition failed");
                let pending = {
                    let mut state = self.lock_state();
                    state.status = match &err {
                        ClaimError::Busy => DeviceStatus::Busy,
                        ClaimError::Unauthorized => DeviceStatus::Unauthorized,
                        ClaimError::Shutdown => DeviceStatus::Shutdown,
                        ClaimError::Invalid(_) => DeviceStatus::Invalid,
                        _ => DeviceStatus::Error,
                    };
                    std::mem::take(&mut state.pending_creates)
                };
                for tx in pending {
                    let _ = tx.send(Err(err.duplicate()));
                }
            }
        }
    }

    async fn acquire_inner(self: &Arc<Self>) -> Result<()> {
        let io = self
            .config
            .retry
            .run(|| async { Ok(self.backend.open_exclusive(&self.path).await?) })
            .await?;

        // Claim ritual: reset device-side stream state, clear any latched
        // halt on both pipes, announce the protocol version we will speak.
        io.control_out(self.vendor_out(CMD_RESET_ALL, 0), &[])
            .await
            .map_err(ClaimError::from)?;
        io.clear_halt(self.settings.bulk_in.address)
            .await
            .map_err(ClaimError::from)?;
        io.clear_halt(self.settings.bulk_out.address)
            .await
            .map_err(ClaimError::from)?;
        let version = self.settings.preferred_protocol().ok_or_else(|| {
            ClaimError::Invalid("device declares no protocol versions".to_string())
        })?;
        io.control_out(self.vendor_out(CMD_SET_PROTOCOL, version), &[])
            .await
            .map_err(ClaimError::from)?;

        let mut state = self.lock_state();
        if state.status != DeviceStatus::Claiming {
            // Closed out from under us mid-acquisition.
            return Err(ClaimError::Aborted);
        }
        state.streams.clear();
        state.active.clear();
        state.idle.clear();
        state.reorder = SequenceReorderer::new();
        state.rx_buf.clear();
        state.io = Some(Arc::clone(&io));
        let cancel = CancellationToken::new();
        state.cancel = cancel.clone();
        state.tasks = vec![
            tokio::spawn(read_pump(
                Arc::clone(self),
                Arc::clone(&io),
                cancel.clone(),
            )),
            tokio::spawn(write_loop(Arc::clone(self), io, cancel)),
        ];
        state.status = DeviceStatus::Claimed;
        drop(state);

        info!(path = %self.path, version, "device claimed");
        Ok(())
    }

    /// Open one logical stream on an already-claimed device.
    pub(crate) async fn open_stream(self: &Arc<Self>) -> Result<StreamConnection> {
        let io = {
            let state = self.lock_state();
            if state.status != DeviceStatus::Claimed {
                return Err(ClaimError::Aborted);
            }
            state.io.clone().ok_or(ClaimError::BrokenPipe)?
        };

        let bytes = io
            .control_in(self.vendor_in(CMD_OPEN_STREAM, 0), 4)
            .await
            .map_err(ClaimError::from)?;
        if bytes.len() < 4 {
            return Err(ClaimError::Invalid(format!(
                "short open-stream response ({} bytes)",
                bytes.len()
            )));
        }
        let id = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if id < 0 {
            return Err(ClaimError::Invalid(format!(
                "device refused stream (id {id})"
            )));
        }

        {
            let mut state = self.lock_state();
            if state.status != DeviceStatus::Claimed {
                return Err(ClaimError::Aborted);
            }
            if state.streams.contains_key(&id) {
                return Err(ClaimError::Invalid(format!(
                    "device reused live stream id {id}"
                )));
            }
            state.streams.insert(id, StreamState::new());
            state.idle.push_back(id);
        }

        debug!(path = %self.path, id, "stream opened");
        Ok(StreamConnection::new(Arc::clone(self), id))
    }

    /// Consumer-side close of one stream. Sends close-stream to the device
    /// unless the peer already signaled closure; closing the last stream
    /// closes the claim.
    pub(crate) async fn close_stream(self: &Arc<Self>, id: i32) {
        let (cmd_io, last) = {
            let mut state = self.lock_state();
            let Some(stream) = state.streams.get_mut(&id) else {
                return;
            };
            if stream.closed {
                return;
            }
            stream.closed = true;
            stream.fail_pending_writes(|| ClaimError::BrokenPipe);
            stream.read_ready.notify_one();
            let send_cmd = !stream.remote_closed && stream.fault.is_none();
            state.streams.remove(&id);
            state.unlist(id);
            let last = state.streams.is_empty() && state.status == DeviceStatus::Claimed;
            let io = if send_cmd { state.io.clone() } else { None };
            (io, last)
        };

        if let Some(io) = cmd_io {
            if let Err(err) = io
                .control_out(self.vendor_out(CMD_CLOSE_STREAM, 0), &id.to_le_bytes())
                .await
            {
                debug!(id, error = %err, "close-stream command failed");
            }
        }
        debug!(path = %self.path, id, "stream closed");

        if last {
            self.close(None).await;
        }
    }

    /// Fatal-path close entry: runs the close on a fresh task so engine tasks
    /// can trigger it and still drain.
    fn spawn_fatal_close(self: &Arc<Self>, reason: String) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.close(Some(reason)).await;
        });
    }

    /// Tear the claim down. `fault` is set on the device-error path and
    /// propagates to every stream as a once-reported device error; a plain
    /// close marks streams closed instead. Idempotent.
    pub(crate) async fn close(self: &Arc<Self>, fault: Option<String>) {
        let (io, cancel, tasks, pending) = {
            let mut state = self.lock_state();
            if !matches!(state.status, DeviceStatus::Claimed | DeviceStatus::Claiming) {
                return;
            }
            state.status = DeviceStatus::Closing;
            for stream in state.streams.values_mut() {
                match &fault {
                    Some(msg) => stream.fault = Some(msg.clone()),
                    None => stream.closed = true,
                }
                stream.fail_pending_writes(|| ClaimError::Aborted);
                stream.read_ready.notify_one();
            }
            state.active.clear();
            state.idle.clear();
            let pending = std::mem::take(&mut state.pending_creates);
            (
                state.io.take(),
                state.cancel.clone(),
                std::mem::take(&mut state.tasks),
                pending,
            )
        };

        match &fault {
            Some(reason) => {
                warn!(path = %self.path, %reason, "closing claim after device error")
            }
            None => info!(path = %self.path, "closing claim"),
        }

        for tx in pending {
            let _ = tx.send(Err(ClaimError::Aborted));
        }

        cancel.cancel();
        // Ask the device to abort anything still in flight, then drain the
        // engine tasks before the handle is released (draw-down).
        if let Some(io) = &io {
            if let Err(err) = io.control_out(self.vendor_out(CMD_RESET_ALL, 0), &[]).await {
                debug!(error = %err, "reset-all during close failed");
            }
        }
        for task in tasks {
            let _ = task.await;
        }

        self.lock_state().status = DeviceStatus::Cleanup;
        drop(io);

        let mut state = self.lock_state();
        state.status = if fault.is_some() {
            DeviceStatus::Error
        } else {
            DeviceStatus::Closed
        };
    }

    /// Build up to `limit` outbound subpackets, preferring streams mid-burst
    /// (active) over newly ready ones (idle). Each subpacket carries exactly
    /// one stream's next chunk, capped at the out pipe's packet size.
    fn build_batch_locked(&self, state: &mut ClaimState, max_payload: usize) -> Vec<Bytes> {
        let mut batch = Vec::new();
        while batch.len() < self.config.write_buffer_count {
            let Some(id) = pick_sendable(state) else {
                break;
            };
            let Some(stream) = state.streams.get_mut(&id) else {
                continue;
            };
            let Some(pw) = stream.pending_writes.front_mut() else {
                state.idle.push_back(id);
                continue;
            };

            let remaining = pw.data.len() - pw.offset;
            let chunk = remaining.min(max_payload);
            let mut buf = BytesMut::with_capacity(HEADER_SIZE + chunk);
            if let Err(err) =
                encode_subpacket(FLAG_DATA, id, &pw.data[pw.offset..pw.offset + chunk], &mut buf)
            {
                let pw = stream
                    .pending_writes
                    .pop_front()
                    .expect("front write vanished");
                let _ = pw.done.send(Err(ClaimError::Protocol(err)));
                state.idle.push_back(id);
                continue;
            }
            pw.offset += chunk;
            if pw.offset == pw.data.len() {
                // Write completion is copy-into-subpacket, not transmission.
                let pw = stream
                    .pending_writes
                    .pop_front()
                    .expect("front write vanished");
                let _ = pw.done.send(Ok(pw.data.len()));
            }

            if stream.has_sendable() {
                state.active.push_back(id);
            } else {
                state.idle.push_back(id);
            }
            batch.push(buf.freeze());
        }
        batch
    }
}

/// Pop the next stream with sendable bytes, active list first.
fn pick_sendable(state: &mut ClaimState) -> Option<i32> {
    for list in [true, false] {
        let queue = if list { &state.active } else { &state.idle };
        let position = queue.iter().position(|id| {
            state
                .streams
                .get(id)
                .is_some_and(|stream| stream.has_sendable())
        });
        if let Some(pos) = position {
            let queue = if list {
                &mut state.active
            } else {
                &mut state.idle
            };
            return queue.remove(pos);
        }
    }
    None
}

/// Keeps a fixed pool of bulk-in reads outstanding, re-orders completions by
/// submission sequence, and demultiplexes each in-order chunk.
async fn read_pump(
    shared: Arc<ClaimShared>,
    io: Arc<dyn DeviceIo>,
    cancel: CancellationToken,
) {
    let pipe = shared.settings.bulk_in.address;
    let len = shared.settings.bulk_in.buffer_size;
    let mut inflight = FuturesUnordered::new();

    loop {
        while inflight.len() < shared.config.read_buffer_count {
            let seq = shared.lock_state().reorder.issue();
            let io = Arc::clone(&io);
            inflight.push(async move { (seq, io.bulk_in(pipe, len).await) }.boxed());
        }

        let (seq, result) = tokio::select! {
            _ = cancel.cancelled() => return,
            Some(done) = inflight.next() => done,
        };

        match result {
            Ok(data) => {
                let fatal = {
                    let mut state = shared.lock_state();
                    let ready = state.reorder.complete(seq, data);
                    let mut fatal = None;
                    for chunk in ready {
                        if let Err(reason) = demux_locked(&mut state, &shared.write_wake, &chunk)
                        {
                            fatal = Some(reason);
                            break;
                        }
                    }
                    fatal
                };
                if let Some(reason) = fatal {
                    shared.spawn_fatal_close(reason);
                    return;
                }
            }
            Err(err) => {
                shared.spawn_fatal_close(format!("bulk-in transfer failed: {err}"));
                return;
            }
        }
    }
}

/// Route every complete subpacket in one in-order chunk. Returns the fatal
/// reason if the chunk violates the protocol.
fn demux_locked(
    state: &mut ClaimState,
    write_wake: &Notify,
    chunk: &[u8],
) -> std::result::Result<(), String> {
    state.rx_buf.extend_from_slice(chunk);
    loop {
        let pkt = match decode_subpacket(&mut state.rx_buf) {
            Ok(Some(pkt)) => pkt,
            Ok(None) => return Ok(()),
            Err(err) => return Err(format!("malformed subpacket: {err}")),
        };

        if pkt.is_command() {
            return Err(format!("peer sent command subpacket on stream {}", pkt.id));
        }

        if pkt.is_notification() {
            match Notification::decode(&pkt.payload) {
                Ok(Notification::SocketClosed) => {
                    if let Some(stream) = state.streams.get_mut(&pkt.id) {
                        debug!(id = pkt.id, "peer closed stream");
                        stream.remote_closed = true;
                        stream.fail_pending_writes(|| ClaimError::BrokenPipe);
                        stream.read_ready.notify_one();
                        state.unlist(pkt.id);
                    }
                }
                Ok(Notification::PauseRequest) => {
                    if let Some(stream) = state.streams.get_mut(&pkt.id) {
                        debug!(id = pkt.id, "peer paused stream");
                        stream.send_paused = true;
                    }
                }
                Ok(Notification::ResumeRequest) => {
                    if let Some(stream) = state.streams.get_mut(&pkt.id) {
                        debug!(id = pkt.id, "peer resumed stream");
                        stream.send_paused = false;
                        write_wake.notify_one();
                    }
                }
                Err(SubpacketError::UnknownNotification(code)) => {
                    debug!(id = pkt.id, code, "ignoring unknown notification");
                }
                Err(err) => return Err(format!("malformed notification: {err}")),
            }
            continue;
        }

        match state.streams.get_mut(&pkt.id) {
            Some(stream) if !stream.closed && !stream.remote_closed => {
                stream.inbound.extend_from_slice(&pkt.payload);
                stream.read_ready.notify_one();
            }
            _ => trace!(id = pkt.id, "dropping data for unknown stream"),
        }
    }
}

/// Drains pending stream writes onto the bulk-out pipe. Subpackets are built
/// under the claim lock and transmitted strictly in build order, so the wire
/// preserves per-stream byte order.
async fn write_loop(shared: Arc<ClaimShared>, io: Arc<dyn DeviceIo>, cancel: CancellationToken) {
    let pipe = shared.settings.bulk_out.address;
    let max_payload = shared
        .settings
        .bulk_out
        .max_packet_size
        .saturating_sub(HEADER_SIZE)
        .max(1);

    loop {
        let wakeup = shared.write_wake.notified();
        let batch = {
            let mut state = shared.lock_state();
            shared.build_batch_locked(&mut state, max_payload)
        };

        if batch.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = wakeup => continue,
            }
        }

        for buf in batch {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                r = io.bulk_out(pipe, &buf) => r,
            };
            if let Err(err) = result {
                shared.spawn_fatal_close(format!("bulk-out transfer failed: {err}"));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use buslink_backend::mock::{MockBackend, MockDevice};
    use buslink_frame::FLAG_NOTIFICATION;

    use super::*;

    fn settings() -> Arc<DeviceSettings> {
        Arc::new(DeviceSettings {
            interface: 0,
            alt_setting: 0,
            bulk_in: crate::settings::PipeSettings {
                address: 0x81,
                max_packet_size: 512,
                buffer_size: 512,
            },
            bulk_out: crate::settings::PipeSettings {
                address: 0x02,
                max_packet_size: 512,
                buffer_size: 512,
            },
            node_id: None,
            node_name: None,
            protocol_versions: vec![2],
        })
    }

    fn claim_over(device: Arc<MockDevice>) -> DeviceClaim {
        let ctx = BackendContext::new();
        let backend = MockBackend::new(Arc::clone(&ctx));
        backend.add_device("mock:0", device);
        DeviceClaim::new(
            Arc::new(backend),
            ctx,
            "mock:0",
            settings(),
            ClaimConfig::default(),
        )
    }

    fn notification(id: i32, n: Notification) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_subpacket(FLAG_NOTIFICATION, id, &n.encode(), &mut buf).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn claim_ritual_runs_in_order() {
        let device = MockDevice::builder().stream_ids([5]).build();
        let claim = claim_over(Arc::clone(&device));

        let stream = claim
            .create_connection()
            .await
            .expect("claim + open should succeed");
        assert_eq!(stream.id(), 5);
        assert_eq!(claim.status(), DeviceStatus::Claimed);

        let commands = device.commands();
        let opcodes: Vec<u8> = commands.iter().map(|(op, _)| *op).collect();
        assert_eq!(
            opcodes,
            vec![CMD_RESET_ALL, CMD_SET_PROTOCOL, CMD_OPEN_STREAM]
        );
        // set-current-protocol announces the device's first preference.
        assert_eq!(commands[1].1, 2);
        assert_eq!(device.cleared_halts(), vec![0x81, 0x02]);
    }

    #[tokio::test]
    async fn negative_stream_id_is_invalid() {
        let device = MockDevice::builder().stream_ids([-1]).build();
        let claim = claim_over(device);

        assert!(matches!(
            claim.create_connection().await,
            Err(ClaimError::Invalid(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_exhausts_retry_budget() {
        let device = MockDevice::builder().busy_opens(u32::MAX).build();
        let claim = claim_over(device);

        assert!(matches!(
            claim.create_connection().await,
            Err(ClaimError::Busy)
        ));
        assert_eq!(claim.status(), DeviceStatus::Busy);
    }

    #[tokio::test]
    async fn requests_during_claiming_are_queued_and_replayed_in_order() {
        // Device stays busy until released, so both requests arrive while the
        // first acquisition is still retrying.
        let device = MockDevice::builder().busy_opens(3).stream_ids([5, 9]).build();
        let claim = Arc::new(claim_over(device));

        let first = {
            let claim = Arc::clone(&claim);
            tokio::spawn(async move { claim.create_connection().await })
        };
        // Let the first request enter Claiming before the second arrives.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(claim.status(), DeviceStatus::Claiming);
        let second = {
            let claim = Arc::clone(&claim);
            tokio::spawn(async move { claim.create_connection().await })
        };

        let s1 = first
            .await
            .expect("task should not panic")
            .expect("first queued request should open");
        let s2 = second
            .await
            .expect("task should not panic")
            .expect("second queued request should open");
        assert_eq!(s1.id(), 5);
        assert_eq!(s2.id(), 9);
    }

    #[tokio::test]
    async fn failed_claim_fails_all_queued_requests() {
        let device = MockDevice::builder().unauthorized().build();
        let claim = Arc::new(claim_over(device));

        let first = {
            let claim = Arc::clone(&claim);
            tokio::spawn(async move { claim.create_connection().await })
        };
        let second = {
            let claim = Arc::clone(&claim);
            tokio::spawn(async move { claim.create_connection().await })
        };

        for task in [first, second] {
            let result = task.await.expect("task should not panic");
            assert!(matches!(result, Err(ClaimError::Unauthorized)));
        }
        assert_eq!(claim.status(), DeviceStatus::Unauthorized);
    }

    #[tokio::test]
    async fn command_subpacket_is_claim_fatal() {
        let device = MockDevice::builder().stream_ids([5]).build();
        let claim = claim_over(Arc::clone(&device));
        let stream = claim
            .create_connection()
            .await
            .expect("claim should succeed");

        let mut buf = BytesMut::new();
        encode_subpacket(buslink_frame::FLAG_COMMAND, 5, &[], &mut buf).unwrap();
        device.push_inbound(buf.to_vec());

        // The claim tears down; the stream surfaces the device error once,
        // then reports broken pipe.
        let mut scratch = [0u8; 16];
        let err = stream.read(&mut scratch).await.unwrap_err();
        assert!(matches!(err, ClaimError::Device(_)));
        let err = stream.read(&mut scratch).await.unwrap_err();
        assert!(matches!(err, ClaimError::BrokenPipe));
    }

    #[tokio::test]
    async fn bulk_error_is_claim_fatal() {
        let device = MockDevice::builder().stream_ids([5]).build();
        let claim = claim_over(Arc::clone(&device));
        let stream = claim
            .create_connection()
            .await
            .expect("claim should succeed");

        device.push_inbound_error("cable yanked");

        let mut scratch = [0u8; 16];
        assert!(matches!(
            stream.read(&mut scratch).await,
            Err(ClaimError::Device(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_device() {
        let device = MockDevice::builder().stream_ids([5]).build();
        let claim = claim_over(Arc::clone(&device));
        let _stream = claim
            .create_connection()
            .await
            .expect("claim should succeed");
        assert!(device.exclusively_held());

        claim.close().await;
        assert_eq!(claim.status(), DeviceStatus::Closed);
        assert!(!device.exclusively_held());

        claim.close().await;
        assert_eq!(claim.status(), DeviceStatus::Closed);
    }

    #[tokio::test]
    async fn reclaim_after_close_runs_acquisition_again() {
        let device = MockDevice::builder().stream_ids([5, 9]).build();
        let claim = claim_over(Arc::clone(&device));

        let stream = claim
            .create_connection()
            .await
            .expect("first claim should succeed");
        claim.close().await;

        let mut scratch = [0u8; 4];
        assert!(stream.read(&mut scratch).await.is_err());

        let stream2 = claim
            .create_connection()
            .await
            .expect("re-claim should succeed");
        assert_eq!(stream2.id(), 9);
        assert_eq!(claim.status(), DeviceStatus::Claimed);
        // Two reset-all from the claim rituals plus one from the close.
        let resets = device
            .commands()
            .iter()
            .filter(|(op, _)| *op == CMD_RESET_ALL)
            .count();
        assert_eq!(resets, 3);
    }

    #[tokio::test]
    async fn closing_last_stream_closes_claim() {
        let device = MockDevice::builder().stream_ids([5]).build();
        let claim = claim_over(Arc::clone(&device));
        let stream = claim
            .create_connection()
            .await
            .expect("claim should succeed");

        stream.close().await;
        assert_eq!(claim.status(), DeviceStatus::Closed);
        assert!(!device.exclusively_held());
        assert!(device
            .commands()
            .iter()
            .any(|(op, _)| *op == CMD_CLOSE_STREAM));
    }

    #[tokio::test]
    async fn socket_closed_notification_skips_close_command() {
        let device = MockDevice::builder().stream_ids([5]).build();
        let claim = claim_over(Arc::clone(&device));
        let stream = claim
            .create_connection()
            .await
            .expect("claim should succeed");

        device.push_inbound(notification(5, Notification::SocketClosed));

        // Reads drain to a clean EOF once the peer closes.
        let mut scratch = [0u8; 4];
        assert_eq!(
            stream.read(&mut scratch).await.expect("EOF expected"),
            0
        );

        stream.close().await;
        assert!(!device
            .commands()
            .iter()
            .any(|(op, _)| *op == CMD_CLOSE_STREAM));
    }
}
