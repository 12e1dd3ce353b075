use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// A device path + interface pair reported by enumeration, not yet opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDevice {
    /// Backend-specific stable path (e.g. `usb:003/011`).
    pub path: String,
    /// The vendor-specific interface number to talk to.
    pub interface: u8,
}

/// Parameters of a control transfer on the shared control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// bmRequestType byte (direction | type | recipient).
    pub request_type: u8,
    /// bRequest: a standard request or a device control-command opcode.
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// One bulk pipe as discovered from the interface's endpoint descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeInfo {
    /// Endpoint address, direction bit included.
    pub address: u8,
    /// Largest single transfer unit for this pipe.
    pub max_packet_size: usize,
}

/// The bulk in/out pipe pair a claimed device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipePair {
    pub bulk_in: PipeInfo,
    pub bulk_out: PipeInfo,
}

/// Discovers candidate devices and opens handles to them.
///
/// One implementation per bus/platform, selected at startup. The multiplex
/// engine holds this as `Arc<dyn DeviceBackend>` and never learns which
/// implementation is behind it.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// List devices that look like they might speak the multiplex protocol.
    ///
    /// Candidates are unvalidated; initialization decides whether a device
    /// really carries the expected vendor sub-descriptor.
    async fn enumerate_candidate_devices(&self) -> Result<Vec<CandidateDevice>>;

    /// Open a device for descriptor and string reads only.
    async fn open_readonly(&self, path: &str) -> Result<Arc<dyn DeviceIo>>;

    /// Open a device and take exclusive ownership of its bulk pipes.
    ///
    /// Returns [`BackendError::Busy`](crate::BackendError::Busy) while another
    /// claimant holds the device.
    async fn open_exclusive(&self, path: &str) -> Result<Arc<dyn DeviceIo>>;
}

/// An opened device handle.
///
/// All transfer methods suspend until the platform completes the transfer;
/// none of them blocks a worker thread.
#[async_trait]
pub trait DeviceIo: Send + Sync {
    /// The interface number this handle is bound to.
    fn interface_number(&self) -> u8;

    /// The bulk pipe pair, from the interface's endpoint descriptors.
    fn pipes(&self) -> Result<PipePair>;

    /// Raw descriptor chain of the bound interface (interface descriptor plus
    /// any vendor sub-descriptors that follow it).
    fn descriptor_block(&self) -> Result<Vec<u8>>;

    /// IN control transfer; reads up to `len` bytes.
    async fn control_in(&self, req: ControlRequest, len: usize) -> Result<Vec<u8>>;

    /// OUT control transfer; returns bytes accepted.
    async fn control_out(&self, req: ControlRequest, data: &[u8]) -> Result<usize>;

    /// Bulk IN transfer; reads up to `len` bytes from `pipe`.
    async fn bulk_in(&self, pipe: u8, len: usize) -> Result<Vec<u8>>;

    /// Bulk OUT transfer; returns bytes written.
    async fn bulk_out(&self, pipe: u8, data: &[u8]) -> Result<usize>;

    /// Clear a latched halt/stall condition on one pipe.
    async fn clear_halt(&self, pipe: u8) -> Result<()>;
}
