use buslink_backend::{PipeInfo, PipePair};
use serde::Serialize;
use uuid::Uuid;

/// Host-side buffer floor per bulk pipe. The working buffer is at least one
/// max-packet unit and at least this many bytes.
pub const DEFAULT_PIPE_BUFFER: usize = 16 * 1024;

/// One bulk pipe as the claim will use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipeSettings {
    /// Endpoint address, direction bit included.
    pub address: u8,
    /// Largest single transfer unit for this pipe.
    pub max_packet_size: usize,
    /// Host-side working buffer for transfers on this pipe.
    pub buffer_size: usize,
}

impl PipeSettings {
    pub fn from_info(info: PipeInfo) -> Self {
        Self {
            address: info.address,
            max_packet_size: info.max_packet_size,
            buffer_size: info.max_packet_size.max(DEFAULT_PIPE_BUFFER),
        }
    }
}

/// Descriptor-derived device settings. Immutable once initialization succeeds.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSettings {
    /// The vendor-specific interface the multiplex protocol lives on.
    pub interface: u8,
    pub alt_setting: u8,
    pub bulk_in: PipeSettings,
    pub bulk_out: PipeSettings,
    /// Declared node identifier, resolved from a device string.
    pub node_id: Option<Uuid>,
    /// Declared node name, resolved from a device string.
    pub node_name: Option<String>,
    /// Supported protocol versions in device-preference order.
    pub protocol_versions: Vec<u16>,
}

impl DeviceSettings {
    pub fn from_pipes(interface: u8, pipes: PipePair) -> Self {
        Self {
            interface,
            alt_setting: 0,
            bulk_in: PipeSettings::from_info(pipes.bulk_in),
            bulk_out: PipeSettings::from_info(pipes.bulk_out),
            node_id: None,
            node_name: None,
            protocol_versions: Vec::new(),
        }
    }

    /// The protocol version to announce: the device's first preference.
    pub fn preferred_protocol(&self) -> Option<u16> {
        self.protocol_versions.first().copied()
    }

    /// Identity matching policy: fields present in the target must all match;
    /// an empty target matches any device.
    pub fn matches_target(&self, target: &TargetIdentity) -> bool {
        if let Some(id) = &target.node_id {
            if self.node_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(name) = &target.node_name {
            if self.node_name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        true
    }
}

/// The identity a connection request is looking for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetIdentity {
    pub node_id: Option<Uuid>,
    pub node_name: Option<String>,
}

impl TargetIdentity {
    pub fn by_id(node_id: Uuid) -> Self {
        Self {
            node_id: Some(node_id),
            node_name: None,
        }
    }

    pub fn by_name(node_name: impl Into<String>) -> Self {
        Self {
            node_id: None,
            node_name: Some(node_name.into()),
        }
    }
}

/// Lifecycle of one known device. Exactly one status is current at a time;
/// transitions are serialized under the owning component's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    NotInitialized,
    Initializing,
    Busy,
    Ready,
    Claiming,
    Claimed,
    Error,
    Cleanup,
    Closing,
    Closed,
    Invalid,
    Unauthorized,
    Shutdown,
}

impl DeviceStatus {
    /// Statuses a connection request may be routed to.
    pub fn is_connectable(self) -> bool {
        matches!(
            self,
            DeviceStatus::Ready | DeviceStatus::Claimed | DeviceStatus::Closed | DeviceStatus::Busy
        )
    }

    /// Statuses that get re-initialized on the next device scan.
    pub fn needs_reinit(self) -> bool {
        matches!(self, DeviceStatus::Busy | DeviceStatus::Error)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceStatus::NotInitialized => "not-initialized",
            DeviceStatus::Initializing => "initializing",
            DeviceStatus::Busy => "busy",
            DeviceStatus::Ready => "ready",
            DeviceStatus::Claiming => "claiming",
            DeviceStatus::Claimed => "claimed",
            DeviceStatus::Error => "error",
            DeviceStatus::Cleanup => "cleanup",
            DeviceStatus::Closing => "closing",
            DeviceStatus::Closed => "closed",
            DeviceStatus::Invalid => "invalid",
            DeviceStatus::Unauthorized => "unauthorized",
            DeviceStatus::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}
