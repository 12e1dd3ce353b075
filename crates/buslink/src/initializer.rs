use std::sync::Arc;

use buslink_backend::{BackendContext, DeviceBackend, DeviceIo};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::descriptor::{
    find_vendor_descriptor, language_table_request, parse_language_table,
    parse_string_descriptor, string_request,
};
use crate::error::{ClaimError, Result};
use crate::retry::RetryPolicy;
use crate::settings::{DeviceSettings, DeviceStatus};

const STRING_READ_LEN: usize = 255;

/// Validates one candidate device and produces its immutable settings.
///
/// The device is opened read-only; nothing here touches the bulk pipes.
/// Busy opens are retried under the policy; permission and descriptor
/// problems are surfaced immediately. Concurrent callers coalesce: while one
/// initialization runs, later callers wait for its outcome instead of
/// starting a second one.
pub struct DeviceInitializer {
    backend: Arc<dyn DeviceBackend>,
    ctx: Arc<BackendContext>,
    path: String,
    retry: RetryPolicy,
    /// Bumped after every completed initialization; read before blocking on
    /// the state lock so coalesced waiters can tell "finished while I waited"
    /// from "not run yet".
    epoch: std::sync::atomic::AtomicU64,
    state: tokio::sync::Mutex<InitState>,
    status: std::sync::Mutex<DeviceStatus>,
}

struct InitState {
    outcome: Option<Outcome>,
}

/// Settled initialization outcome, cheap to hand to every coalesced waiter.
#[derive(Debug, Clone)]
enum Outcome {
    Ready(Arc<DeviceSettings>),
    Busy,
    Unauthorized,
    Invalid(String),
    Error(String),
}

impl Outcome {
    fn to_result(&self) -> Result<Arc<DeviceSettings>> {
        match self {
            Outcome::Ready(settings) => Ok(Arc::clone(settings)),
            Outcome::Busy => Err(ClaimError::Busy),
            Outcome::Unauthorized => Err(ClaimError::Unauthorized),
            Outcome::Invalid(msg) => Err(ClaimError::Invalid(msg.clone())),
            Outcome::Error(msg) => Err(ClaimError::Device(msg.clone())),
        }
    }

    fn status(&self) -> DeviceStatus {
        match self {
            Outcome::Ready(_) => DeviceStatus::Ready,
            Outcome::Busy => DeviceStatus::Busy,
            Outcome::Unauthorized => DeviceStatus::Unauthorized,
            Outcome::Invalid(_) => DeviceStatus::Invalid,
            Outcome::Error(_) => DeviceStatus::Error,
        }
    }
}

impl DeviceInitializer {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        ctx: Arc<BackendContext>,
        path: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            ctx,
            path: path.into(),
            retry,
            epoch: std::sync::atomic::AtomicU64::new(0),
            state: tokio::sync::Mutex::new(InitState { outcome: None }),
            status: std::sync::Mutex::new(DeviceStatus::NotInitialized),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current device status as seen by discovery.
    pub fn status(&self) -> DeviceStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    /// Settings from the last successful initialization, if any.
    pub async fn settings(&self) -> Option<Arc<DeviceSettings>> {
        let state = self.state.lock().await;
        match &state.outcome {
            Some(Outcome::Ready(settings)) => Some(Arc::clone(settings)),
            _ => None,
        }
    }

    /// Initialize the device, or join an initialization already in flight.
    pub async fn initialize(&self) -> Result<Arc<DeviceSettings>> {
        use std::sync::atomic::Ordering;

        if self.ctx.is_shutdown() {
            return Err(ClaimError::Shutdown);
        }

        let entry_epoch = self.epoch.load(Ordering::SeqCst);
        let mut state = self.state.lock().await;

        // An initialization completed while we waited for the lock; its
        // outcome is ours too.
        if self.epoch.load(Ordering::SeqCst) != entry_epoch {
            if let Some(outcome) = &state.outcome {
                return outcome.to_result();
            }
        }
        // A settled success stays settled; settings are immutable.
        if let Some(outcome @ Outcome::Ready(_)) = &state.outcome {
            return outcome.to_result();
        }

        self.set_status(DeviceStatus::Initializing);
        let outcome = self.run_initialization().await;
        self.set_status(outcome.status());
        match &outcome {
            Outcome::Ready(settings) => {
                info!(path = %self.path, node_id = ?settings.node_id, node_name = ?settings.node_name, "device initialized");
            }
            other => {
                warn!(path = %self.path, outcome = ?other, "device initialization failed");
            }
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
        state.outcome = Some(outcome.clone());
        outcome.to_result()
    }

    /// Forget a failed outcome so the next `initialize` starts fresh.
    /// Used by discovery when re-scanning Busy/Error devices.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if !matches!(state.outcome, Some(Outcome::Ready(_))) {
            state.outcome = None;
            self.set_status(DeviceStatus::NotInitialized);
        }
    }

    fn set_status(&self, status: DeviceStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    async fn run_initialization(&self) -> Outcome {
        let io = match self
            .retry
            .run(|| async { Ok(self.backend.open_readonly(&self.path).await?) })
            .await
        {
            Ok(io) => io,
            Err(ClaimError::Busy) => return Outcome::Busy,
            Err(ClaimError::Unauthorized) => return Outcome::Unauthorized,
            Err(err) => return Outcome::Error(err.to_string()),
        };

        match self.read_settings(io.as_ref()).await {
            Ok(settings) => Outcome::Ready(Arc::new(settings)),
            Err(ClaimError::Invalid(msg)) => Outcome::Invalid(msg),
            Err(err) => Outcome::Error(err.to_string()),
        }
    }

    async fn read_settings(&self, io: &dyn DeviceIo) -> Result<DeviceSettings> {
        let block = io.descriptor_block()?;
        let vendor = find_vendor_descriptor(&block)?;
        debug!(path = %self.path, versions = ?vendor.protocol_versions, "vendor sub-descriptor found");

        let mut settings = DeviceSettings::from_pipes(io.interface_number(), io.pipes()?);
        settings.protocol_versions = vendor.protocol_versions;

        // String resolution failures are terminal, never retried: the device
        // answered descriptor reads, so a failing string read means a fault,
        // not contention.
        if vendor.node_id_index != 0 || vendor.node_name_index != 0 {
            let language = {
                let table = io
                    .control_in(language_table_request(), STRING_READ_LEN)
                    .await
                    .map_err(|e| ClaimError::Device(e.to_string()))?;
                parse_language_table(&table)?
            };

            if vendor.node_id_index != 0 {
                let raw = self
                    .read_string(io, vendor.node_id_index, language)
                    .await?;
                let id = Uuid::parse_str(raw.trim()).map_err(|_| {
                    ClaimError::Invalid(format!("node identifier is not a UUID: {raw:?}"))
                })?;
                settings.node_id = Some(id);
            }
            if vendor.node_name_index != 0 {
                settings.node_name =
                    Some(self.read_string(io, vendor.node_name_index, language).await?);
            }
        }

        Ok(settings)
    }

    async fn read_string(&self, io: &dyn DeviceIo, index: u8, language: u16) -> Result<String> {
        let bytes = io
            .control_in(string_request(index, language), STRING_READ_LEN)
            .await
            .map_err(|e| ClaimError::Device(e.to_string()))?;
        parse_string_descriptor(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use buslink_backend::mock::{MockBackend, MockDevice};

    use super::*;
    use crate::descriptor::{build_vendor_descriptor, DETECTION_UUID};

    const NODE_ID: &str = "7b9a6e5c-1f2d-4a3b-8c7d-0e1f2a3b4c5d";

    fn valid_device() -> Arc<MockDevice> {
        MockDevice::builder()
            .descriptor_block(build_vendor_descriptor(&DETECTION_UUID, 4, 5, &[2, 1]))
            .string(4, NODE_ID)
            .string(5, "robot-7")
            .build()
    }

    fn harness(device: Arc<MockDevice>) -> DeviceInitializer {
        let ctx = BackendContext::new();
        let backend = MockBackend::new(Arc::clone(&ctx));
        backend.add_device("mock:0", device);
        DeviceInitializer::new(Arc::new(backend), ctx, "mock:0", RetryPolicy::default())
    }

    #[tokio::test]
    async fn initialize_produces_settings() {
        let init = harness(valid_device());
        let settings = init.initialize().await.expect("initialization should succeed");

        assert_eq!(init.status(), DeviceStatus::Ready);
        assert_eq!(settings.node_id, Some(NODE_ID.parse().unwrap()));
        assert_eq!(settings.node_name.as_deref(), Some("robot-7"));
        assert_eq!(settings.protocol_versions, vec![2, 1]);
        assert_eq!(settings.bulk_in.address, 0x81);
        assert_eq!(settings.bulk_out.address, 0x02);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_retries_then_succeeds() {
        let device = MockDevice::builder()
            .descriptor_block(build_vendor_descriptor(&DETECTION_UUID, 0, 0, &[1]))
            .busy_opens(3)
            .build();
        let init = harness(device);

        let settings = init.initialize().await.expect("retries should win");
        assert!(settings.node_id.is_none());
        assert_eq!(init.status(), DeviceStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_busy_exhausts_budget() {
        let device = MockDevice::builder()
            .descriptor_block(build_vendor_descriptor(&DETECTION_UUID, 0, 0, &[1]))
            .busy_opens(u32::MAX)
            .build();
        let init = harness(device);

        assert!(matches!(init.initialize().await, Err(ClaimError::Busy)));
        assert_eq!(init.status(), DeviceStatus::Busy);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let device = MockDevice::builder().unauthorized().build();
        let init = harness(device);

        assert!(matches!(
            init.initialize().await,
            Err(ClaimError::Unauthorized)
        ));
        assert_eq!(init.status(), DeviceStatus::Unauthorized);
    }

    #[tokio::test]
    async fn missing_vendor_descriptor_is_invalid() {
        let device = MockDevice::builder()
            .descriptor_block(vec![9, 0x04, 0, 0, 2, 0xFF, 0, 0, 0])
            .build();
        let init = harness(device);

        assert!(matches!(init.initialize().await, Err(ClaimError::Invalid(_))));
        assert_eq!(init.status(), DeviceStatus::Invalid);
    }

    #[tokio::test]
    async fn missing_string_is_terminal_error() {
        // Descriptor references string index 4, but the device has no strings.
        let device = MockDevice::builder()
            .descriptor_block(build_vendor_descriptor(&DETECTION_UUID, 4, 0, &[1]))
            .build();
        let init = harness(device);

        assert!(matches!(init.initialize().await, Err(ClaimError::Device(_))));
        assert_eq!(init.status(), DeviceStatus::Error);
    }

    #[tokio::test]
    async fn non_uuid_node_identifier_is_invalid() {
        let device = MockDevice::builder()
            .descriptor_block(build_vendor_descriptor(&DETECTION_UUID, 4, 0, &[1]))
            .string(4, "not-a-uuid")
            .build();
        let init = harness(device);

        assert!(matches!(init.initialize().await, Err(ClaimError::Invalid(_))));
        assert_eq!(init.status(), DeviceStatus::Invalid);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce() {
        let device = valid_device();
        let init = Arc::new(harness(Arc::clone(&device)));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let init = Arc::clone(&init);
                tokio::spawn(async move { init.initialize().await })
            })
            .collect();
        for task in tasks {
            task.await
                .expect("task should not panic")
                .expect("initialization should succeed");
        }

        // One backend open serves every caller.
        assert_eq!(device.open_count(), 1);
    }

    #[tokio::test]
    async fn settled_success_is_cached() {
        let device = valid_device();
        let init = harness(Arc::clone(&device));

        init.initialize().await.expect("first init should succeed");
        init.initialize().await.expect("second init should reuse");
        assert_eq!(device.open_count(), 1);
    }

    #[tokio::test]
    async fn reset_allows_reinitialization() {
        let device = MockDevice::builder()
            .descriptor_block(build_vendor_descriptor(&DETECTION_UUID, 0, 0, &[1]))
            .busy_opens(u32::MAX)
            .build();
        let ctx = BackendContext::new();
        let backend = MockBackend::new(Arc::clone(&ctx));
        backend.add_device("mock:0", Arc::clone(&device));
        let init = DeviceInitializer::new(
            Arc::new(backend),
            ctx,
            "mock:0",
            RetryPolicy {
                max_retries: 0,
                delay: std::time::Duration::from_millis(1),
            },
        );

        assert!(matches!(init.initialize().await, Err(ClaimError::Busy)));
        init.reset().await;
        assert_eq!(init.status(), DeviceStatus::NotInitialized);
    }

    #[tokio::test]
    async fn shutdown_fails_fast() {
        let device = valid_device();
        let ctx = BackendContext::new();
        let backend = MockBackend::new(Arc::clone(&ctx));
        backend.add_device("mock:0", device);
        let init = DeviceInitializer::new(
            Arc::new(backend),
            Arc::clone(&ctx),
            "mock:0",
            RetryPolicy::default(),
        );

        ctx.shutdown();
        assert!(matches!(init.initialize().await, Err(ClaimError::Shutdown)));
    }
}
