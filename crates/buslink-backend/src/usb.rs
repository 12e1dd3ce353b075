//! Linux USB backend on top of `nusb`.
//!
//! Candidates are devices exposing a vendor-specific interface (class 255).
//! Whether a candidate really speaks the multiplex protocol is decided above
//! this layer, from the vendor sub-descriptor in the interface chain.

use std::sync::Arc;

use async_trait::async_trait;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, RequestBuffer};
use tracing::debug;

use crate::context::BackendContext;
use crate::error::{BackendError, Result};
use crate::traits::{
    CandidateDevice, ControlRequest, DeviceBackend, DeviceIo, PipeInfo, PipePair,
};

const VENDOR_CLASS: u8 = 255;

const EBUSY: i32 = 16;
const EPERM: i32 = 1;
const EACCES: i32 = 13;

/// USB discovery backend.
pub struct UsbBackend {
    ctx: Arc<BackendContext>,
}

impl UsbBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        Self { ctx }
    }

    fn open_by_path(&self, path: &str) -> Result<UsbDeviceIo> {
        self.ctx.check()?;

        let device_info = nusb::list_devices()
            .map_err(map_io)?
            .find(|dev| bus_path(dev) == path)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;

        let iface_num = device_info
            .interfaces()
            .find(|iface| iface.class() == VENDOR_CLASS)
            .map(|iface| iface.interface_number())
            .ok_or_else(|| {
                BackendError::Transfer(format!("{path}: no vendor-specific interface"))
            })?;

        let device = device_info.open().map_err(map_io)?;

        // Gather endpoint + raw descriptor info before claiming.
        let config = device
            .active_configuration()
            .map_err(|e| BackendError::Transfer(format!("active configuration: {e}")))?;

        let mut descriptor_block = Vec::new();
        let mut bulk_in = None;
        let mut bulk_out = None;
        for alt in config.interface_alt_settings() {
            if alt.interface_number() != iface_num {
                continue;
            }
            for descriptor in alt.descriptors() {
                descriptor_block.extend_from_slice(&descriptor);
            }
            for ep in alt.endpoints() {
                if ep.transfer_type() != nusb::transfer::EndpointType::Bulk {
                    continue;
                }
                let info = PipeInfo {
                    address: ep.address(),
                    max_packet_size: ep.max_packet_size(),
                };
                if ep.direction() == nusb::transfer::Direction::In {
                    bulk_in.get_or_insert(info);
                } else {
                    bulk_out.get_or_insert(info);
                }
            }
        }

        let pipes = match (bulk_in, bulk_out) {
            (Some(bulk_in), Some(bulk_out)) => PipePair { bulk_in, bulk_out },
            _ => {
                return Err(BackendError::Transfer(format!(
                    "{path}: interface {iface_num} has no bulk in/out pipe pair"
                )))
            }
        };

        // nusb auto-detaches the kernel driver; a claim held elsewhere
        // surfaces as EBUSY.
        let interface = device.claim_interface(iface_num).map_err(map_io)?;

        debug!(path, iface_num, "opened usb device");

        Ok(UsbDeviceIo {
            interface,
            interface_number: iface_num,
            pipes,
            descriptor_block,
        })
    }
}

#[async_trait]
impl DeviceBackend for UsbBackend {
    async fn enumerate_candidate_devices(&self) -> Result<Vec<CandidateDevice>> {
        self.ctx.check()?;
        let devices = nusb::list_devices().map_err(map_io)?;
        Ok(devices
            .filter_map(|dev| {
                let iface = dev
                    .interfaces()
                    .find(|iface| iface.class() == VENDOR_CLASS)?;
                Some(CandidateDevice {
                    path: bus_path(&dev),
                    interface: iface.interface_number(),
                })
            })
            .collect())
    }

    async fn open_readonly(&self, path: &str) -> Result<Arc<dyn DeviceIo>> {
        // USB has no shared open; a read-only handle is a convention. The
        // caller only reads descriptors and strings and drops the handle
        // before anyone claims the pipes.
        Ok(Arc::new(self.open_by_path(path)?))
    }

    async fn open_exclusive(&self, path: &str) -> Result<Arc<dyn DeviceIo>> {
        Ok(Arc::new(self.open_by_path(path)?))
    }
}

/// One opened USB device interface.
pub struct UsbDeviceIo {
    interface: nusb::Interface,
    interface_number: u8,
    pipes: PipePair,
    descriptor_block: Vec<u8>,
}

#[async_trait]
impl DeviceIo for UsbDeviceIo {
    fn interface_number(&self) -> u8 {
        self.interface_number
    }

    fn pipes(&self) -> Result<PipePair> {
        Ok(self.pipes)
    }

    fn descriptor_block(&self) -> Result<Vec<u8>> {
        Ok(self.descriptor_block.clone())
    }

    async fn control_in(&self, req: ControlRequest, len: usize) -> Result<Vec<u8>> {
        let (control_type, recipient) = split_request_type(req.request_type);
        let completion = self
            .interface
            .control_in(ControlIn {
                control_type,
                recipient,
                request: req.request,
                value: req.value,
                index: req.index,
                length: len as u16,
            })
            .await;
        completion
            .into_result()
            .map_err(|e| BackendError::Transfer(format!("control_in(request={}): {e}", req.request)))
    }

    async fn control_out(&self, req: ControlRequest, data: &[u8]) -> Result<usize> {
        let (control_type, recipient) = split_request_type(req.request_type);
        let completion = self
            .interface
            .control_out(ControlOut {
                control_type,
                recipient,
                request: req.request,
                value: req.value,
                index: req.index,
                data,
            })
            .await;
        completion
            .into_result()
            .map(|_| data.len())
            .map_err(|e| BackendError::Transfer(format!("control_out(request={}): {e}", req.request)))
    }

    async fn bulk_in(&self, pipe: u8, len: usize) -> Result<Vec<u8>> {
        let completion = self.interface.bulk_in(pipe, RequestBuffer::new(len)).await;
        completion
            .into_result()
            .map_err(|e| BackendError::Transfer(format!("bulk_in(pipe={pipe:#04x}): {e}")))
    }

    async fn bulk_out(&self, pipe: u8, data: &[u8]) -> Result<usize> {
        let completion = self.interface.bulk_out(pipe, data.to_vec()).await;
        completion
            .into_result()
            .map(|buf| buf.actual_length())
            .map_err(|e| BackendError::Transfer(format!("bulk_out(pipe={pipe:#04x}): {e}")))
    }

    async fn clear_halt(&self, pipe: u8) -> Result<()> {
        self.interface
            .clear_halt(pipe)
            .map_err(|e| BackendError::Transfer(format!("clear_halt(pipe={pipe:#04x}): {e}")))
    }
}

/// Stable enumeration path, e.g. `usb:003/011`.
fn bus_path(dev: &nusb::DeviceInfo) -> String {
    format!("usb:{:03}/{:03}", dev.bus_number(), dev.device_address())
}

/// Split a raw bmRequestType byte into nusb's type/recipient pair.
fn split_request_type(request_type: u8) -> (ControlType, Recipient) {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    };
    let recipient = match request_type & 0x1f {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };
    (control_type, recipient)
}

fn map_io(err: std::io::Error) -> BackendError {
    match err.raw_os_error() {
        Some(EBUSY) => BackendError::Busy,
        Some(EPERM) | Some(EACCES) => BackendError::Unauthorized,
        _ => BackendError::Io(err),
    }
}
