//! In-memory mock backend for unit and integration tests.
//!
//! Always compiled (zero runtime cost), hidden from public docs. Tests script
//! a [`MockDevice`] (descriptor bytes, string table, stream-id assignments,
//! busy/unauthorized open behavior), attach it to a [`MockBackend`] under a
//! path, and drive the engine above without hardware. Device-to-host traffic
//! is injected with [`MockDevice::push_inbound`]; host-to-device bulk traffic
//! is captured and inspected with [`MockDevice::sent`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::context::BackendContext;
use crate::error::{BackendError, Result};
use crate::traits::{
    CandidateDevice, ControlRequest, DeviceBackend, DeviceIo, PipeInfo, PipePair,
};

const GET_DESCRIPTOR: u8 = 6;
const DESCRIPTOR_TYPE_STRING: u8 = 3;

/// Scriptable backend holding mock devices keyed by path.
pub struct MockBackend {
    ctx: Arc<BackendContext>,
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
}

impl MockBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        Self {
            ctx,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_device(&self, path: impl Into<String>, device: Arc<MockDevice>) {
        self.devices
            .lock()
            .expect("mock device map poisoned")
            .insert(path.into(), device);
    }

    /// Simulate the device disappearing from the bus.
    pub fn remove_device(&self, path: &str) {
        self.devices
            .lock()
            .expect("mock device map poisoned")
            .remove(path);
    }

    fn device(&self, path: &str) -> Result<Arc<MockDevice>> {
        self.devices
            .lock()
            .expect("mock device map poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl DeviceBackend for MockBackend {
    async fn enumerate_candidate_devices(&self) -> Result<Vec<CandidateDevice>> {
        self.ctx.check()?;
        let devices = self.devices.lock().expect("mock device map poisoned");
        let mut candidates: Vec<CandidateDevice> = devices
            .iter()
            .map(|(path, dev)| CandidateDevice {
                path: path.clone(),
                interface: dev.interface,
            })
            .collect();
        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(candidates)
    }

    async fn open_readonly(&self, path: &str) -> Result<Arc<dyn DeviceIo>> {
        self.ctx.check()?;
        self.device(path)?.open(false)
    }

    async fn open_exclusive(&self, path: &str) -> Result<Arc<dyn DeviceIo>> {
        self.ctx.check()?;
        self.device(path)?.open(true)
    }
}

/// One scripted device.
pub struct MockDevice {
    interface: u8,
    pipes: PipePair,
    descriptor_block: Vec<u8>,
    strings: HashMap<u8, String>,

    busy_opens: AtomicU32,
    unauthorized: AtomicBool,
    open_calls: AtomicU32,
    exclusive_held: Arc<AtomicBool>,

    scripted_stream_ids: Mutex<VecDeque<i32>>,
    next_stream_id: AtomicI32,

    commands: Mutex<Vec<(u8, u16)>>,
    cleared_halts: Mutex<Vec<u8>>,

    inbound_tx: mpsc::UnboundedSender<Result<Vec<u8>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<u8>>>>,

    outbound: Mutex<Vec<Vec<u8>>>,
    outbound_notify: Notify,
}

impl MockDevice {
    pub fn builder() -> MockDeviceBuilder {
        MockDeviceBuilder::default()
    }

    fn open(self: &Arc<Self>, exclusive: bool) -> Result<Arc<dyn DeviceIo>> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(BackendError::Unauthorized);
        }
        let remaining = self.busy_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.busy_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Busy);
        }
        if exclusive && self.exclusive_held.swap(true, Ordering::SeqCst) {
            return Err(BackendError::Busy);
        }
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockDeviceIo {
            device: Arc::clone(self),
            exclusive,
        }))
    }

    // ── Scripting / inspection helpers ──

    /// Inject a device-to-host bulk completion.
    pub fn push_inbound(&self, payload: impl Into<Vec<u8>>) {
        let _ = self.inbound_tx.send(Ok(payload.into()));
    }

    /// Inject a failing bulk-in completion (claim-fatal upstream).
    pub fn push_inbound_error(&self, message: &str) {
        let _ = self
            .inbound_tx
            .send(Err(BackendError::Transfer(message.to_string())));
    }

    /// Every host-to-device bulk transfer captured so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().expect("outbound poisoned").clone()
    }

    /// Wait until at least `n` bulk-out transfers have been captured.
    pub async fn wait_sent(&self, n: usize) -> Vec<Vec<u8>> {
        loop {
            let notified = self.outbound_notify.notified();
            {
                let outbound = self.outbound.lock().expect("outbound poisoned");
                if outbound.len() >= n {
                    return outbound.clone();
                }
            }
            notified.await;
        }
    }

    /// Vendor control commands received, as (opcode, value) pairs.
    pub fn commands(&self) -> Vec<(u8, u16)> {
        self.commands.lock().expect("commands poisoned").clone()
    }

    /// Wait until a given opcode has been received at least once.
    pub async fn wait_command(&self, opcode: u8) {
        loop {
            if self.commands().iter().any(|(op, _)| *op == opcode) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    /// Pipes on which `clear_halt` was called.
    pub fn cleared_halts(&self) -> Vec<u8> {
        self.cleared_halts.lock().expect("halts poisoned").clone()
    }

    /// Successful opens so far (busy/unauthorized rejections not counted).
    pub fn open_count(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// True while an exclusive handle is outstanding.
    pub fn exclusively_held(&self) -> bool {
        self.exclusive_held.load(Ordering::SeqCst)
    }

    fn string_descriptor(&self, index: u8) -> Result<Vec<u8>> {
        if index == 0 {
            // Language table: one entry, en-US.
            return Ok(vec![4, DESCRIPTOR_TYPE_STRING, 0x09, 0x04]);
        }
        let value = self
            .strings
            .get(&index)
            .ok_or_else(|| BackendError::Transfer(format!("no string descriptor {index}")))?;
        let mut bytes = vec![0, DESCRIPTOR_TYPE_STRING];
        for unit in value.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes[0] = bytes.len() as u8;
        Ok(bytes)
    }

    fn next_stream_id(&self) -> i32 {
        let mut scripted = self
            .scripted_stream_ids
            .lock()
            .expect("stream ids poisoned");
        match scripted.pop_front() {
            Some(id) => id,
            None => self.next_stream_id.fetch_add(1, Ordering::SeqCst),
        }
    }
}

/// Builder for a scripted device.
pub struct MockDeviceBuilder {
    interface: u8,
    pipes: PipePair,
    descriptor_block: Vec<u8>,
    strings: HashMap<u8, String>,
    busy_opens: u32,
    unauthorized: bool,
    stream_ids: VecDeque<i32>,
    first_stream_id: i32,
}

impl Default for MockDeviceBuilder {
    fn default() -> Self {
        Self {
            interface: 0,
            pipes: PipePair {
                bulk_in: PipeInfo {
                    address: 0x81,
                    max_packet_size: 512,
                },
                bulk_out: PipeInfo {
                    address: 0x02,
                    max_packet_size: 512,
                },
            },
            descriptor_block: Vec::new(),
            strings: HashMap::new(),
            busy_opens: 0,
            unauthorized: false,
            stream_ids: VecDeque::new(),
            first_stream_id: 1,
        }
    }
}

impl MockDeviceBuilder {
    pub fn interface(mut self, interface: u8) -> Self {
        self.interface = interface;
        self
    }

    pub fn pipes(mut self, pipes: PipePair) -> Self {
        self.pipes = pipes;
        self
    }

    pub fn descriptor_block(mut self, block: impl Into<Vec<u8>>) -> Self {
        self.descriptor_block = block.into();
        self
    }

    pub fn string(mut self, index: u8, value: impl Into<String>) -> Self {
        self.strings.insert(index, value.into());
        self
    }

    /// The first `n` opens report Busy before one succeeds.
    pub fn busy_opens(mut self, n: u32) -> Self {
        self.busy_opens = n;
        self
    }

    /// Every open reports permission denied.
    pub fn unauthorized(mut self) -> Self {
        self.unauthorized = true;
        self
    }

    /// Scripted stream ids handed out by open-stream, in order. Once
    /// exhausted, a counter takes over.
    pub fn stream_ids(mut self, ids: impl IntoIterator<Item = i32>) -> Self {
        self.stream_ids = ids.into_iter().collect();
        self
    }

    pub fn build(self) -> Arc<MockDevice> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(MockDevice {
            interface: self.interface,
            pipes: self.pipes,
            descriptor_block: self.descriptor_block,
            strings: self.strings,
            busy_opens: AtomicU32::new(self.busy_opens),
            unauthorized: AtomicBool::new(self.unauthorized),
            open_calls: AtomicU32::new(0),
            exclusive_held: Arc::new(AtomicBool::new(false)),
            scripted_stream_ids: Mutex::new(self.stream_ids),
            next_stream_id: AtomicI32::new(self.first_stream_id),
            commands: Mutex::new(Vec::new()),
            cleared_halts: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound: Mutex::new(Vec::new()),
            outbound_notify: Notify::new(),
        })
    }
}

struct MockDeviceIo {
    device: Arc<MockDevice>,
    exclusive: bool,
}

impl Drop for MockDeviceIo {
    fn drop(&mut self) {
        if self.exclusive {
            self.device.exclusive_held.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl DeviceIo for MockDeviceIo {
    fn interface_number(&self) -> u8 {
        self.device.interface
    }

    fn pipes(&self) -> Result<PipePair> {
        Ok(self.device.pipes)
    }

    fn descriptor_block(&self) -> Result<Vec<u8>> {
        Ok(self.device.descriptor_block.clone())
    }

    async fn control_in(&self, req: ControlRequest, len: usize) -> Result<Vec<u8>> {
        // Standard GET_DESCRIPTOR for strings.
        if req.request_type == 0x80 && req.request == GET_DESCRIPTOR {
            let desc_type = (req.value >> 8) as u8;
            if desc_type == DESCRIPTOR_TYPE_STRING {
                let mut bytes = self.device.string_descriptor((req.value & 0xFF) as u8)?;
                bytes.truncate(len);
                return Ok(bytes);
            }
            return Err(BackendError::Transfer(format!(
                "mock: unsupported descriptor type {desc_type}"
            )));
        }

        // Vendor IN: control commands that return data.
        self.device
            .commands
            .lock()
            .expect("commands poisoned")
            .push((req.request, req.value));
        match req.request {
            1 => {
                // open-stream: 4-byte LE stream id
                let id = self.device.next_stream_id();
                Ok(id.to_le_bytes().to_vec())
            }
            other => Err(BackendError::Transfer(format!(
                "mock: unsupported IN command {other}"
            ))),
        }
    }

    async fn control_out(&self, req: ControlRequest, _data: &[u8]) -> Result<usize> {
        self.device
            .commands
            .lock()
            .expect("commands poisoned")
            .push((req.request, req.value));
        Ok(0)
    }

    async fn bulk_in(&self, _pipe: u8, _len: usize) -> Result<Vec<u8>> {
        let mut rx = self.device.inbound_rx.lock().await;
        match rx.recv().await {
            Some(result) => result,
            None => Err(BackendError::Transfer("mock: inbound closed".to_string())),
        }
    }

    async fn bulk_out(&self, _pipe: u8, data: &[u8]) -> Result<usize> {
        self.device
            .outbound
            .lock()
            .expect("outbound poisoned")
            .push(data.to_vec());
        self.device.outbound_notify.notify_one();
        Ok(data.len())
    }

    async fn clear_halt(&self, pipe: u8) -> Result<()> {
        self.device
            .cleared_halts
            .lock()
            .expect("halts poisoned")
            .push(pipe);
        Ok(())
    }
}
