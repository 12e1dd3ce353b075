//! Device discovery bookkeeping and connection routing.
//!
//! One [`DeviceManager`] per backend. It keeps a path-indexed table of known
//! devices (settings + initializer + optional claim, referenced by path
//! rather than by pointer), re-runs discovery on demand, and routes
//! connection requests to the device whose declared identity matches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use buslink_backend::{BackendContext, DeviceBackend};
use tracing::{debug, info, warn};

use crate::claim::{ClaimConfig, DeviceClaim};
use crate::error::{ClaimError, Result};
use crate::initializer::DeviceInitializer;
use crate::settings::{DeviceSettings, DeviceStatus, TargetIdentity};
use crate::stream::StreamConnection;

/// A row in the manager's device table, for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceView {
    pub path: String,
    pub status: DeviceStatus,
    pub node_id: Option<uuid::Uuid>,
    pub node_name: Option<String>,
}

struct ManagedDevice {
    initializer: Arc<DeviceInitializer>,
    settings: Option<Arc<DeviceSettings>>,
    claim: Option<Arc<DeviceClaim>>,
}

impl ManagedDevice {
    fn status(&self) -> DeviceStatus {
        if let Some(claim) = &self.claim {
            let status = claim.status();
            // A claim that was never acquired reports Ready; fall through to
            // what discovery knows in that case.
            if status != DeviceStatus::Ready {
                return status;
            }
        }
        self.initializer.status()
    }
}

/// Tracks one device table per backend and routes connection requests.
pub struct DeviceManager {
    backend: Arc<dyn DeviceBackend>,
    ctx: Arc<BackendContext>,
    config: ClaimConfig,
    devices: Mutex<HashMap<String, ManagedDevice>>,
    connections: Mutex<HashMap<u64, StreamConnection>>,
    next_connection_id: AtomicU64,
}

impl DeviceManager {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        ctx: Arc<BackendContext>,
        config: ClaimConfig,
    ) -> Self {
        Self {
            backend,
            ctx,
            config,
            devices: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    fn lock_devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, ManagedDevice>> {
        self.devices.lock().expect("device table lock poisoned")
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<u64, StreamConnection>> {
        self.connections.lock().expect("connection table lock poisoned")
    }

    /// Re-enumerate candidate devices: initialize newly seen paths, re-run
    /// initialization for Busy/Error devices, shut down vanished ones.
    pub async fn update_devices(&self) -> Result<()> {
        self.ctx.check().map_err(ClaimError::from)?;

        let candidates = self
            .backend
            .enumerate_candidate_devices()
            .await
            .map_err(ClaimError::from)?;
        let present: Vec<String> = candidates.iter().map(|c| c.path.clone()).collect();

        // Register new paths and pick up the initializers that need a run.
        let mut to_initialize: Vec<Arc<DeviceInitializer>> = Vec::new();
        {
            let mut devices = self.lock_devices();
            for candidate in &candidates {
                let device = devices.entry(candidate.path.clone()).or_insert_with(|| {
                    debug!(path = %candidate.path, interface = candidate.interface, "discovered device");
                    ManagedDevice {
                        initializer: Arc::new(DeviceInitializer::new(
                            Arc::clone(&self.backend),
                            Arc::clone(&self.ctx),
                            candidate.path.clone(),
                            self.config.retry,
                        )),
                        settings: None,
                        claim: None,
                    }
                });
                let status = device.initializer.status();
                if status == DeviceStatus::NotInitialized || status.needs_reinit() {
                    to_initialize.push(Arc::clone(&device.initializer));
                }
            }
        }

        // Initialization happens outside the table lock; each device has its
        // own lock so unrelated devices never contend.
        for initializer in to_initialize {
            if initializer.status().needs_reinit() {
                initializer.reset().await;
            }
            match initializer.initialize().await {
                Ok(settings) => {
                    let mut devices = self.lock_devices();
                    if let Some(device) = devices.get_mut(initializer.path()) {
                        device.settings = Some(settings);
                    }
                }
                Err(err) => {
                    debug!(path = %initializer.path(), error = %err, "initialization attempt failed");
                }
            }
        }

        // Shut down devices whose path is gone.
        let vanished: Vec<(String, Option<Arc<DeviceClaim>>)> = {
            let mut devices = self.lock_devices();
            let gone: Vec<String> = devices
                .keys()
                .filter(|path| !present.iter().any(|p| p == *path))
                .cloned()
                .collect();
            gone.into_iter()
                .map(|path| {
                    let device = devices.remove(&path);
                    (path, device.and_then(|d| d.claim))
                })
                .collect()
        };
        for (path, claim) in vanished {
            info!(path = %path, "device no longer present, shutting down");
            if let Some(claim) = claim {
                claim.close().await;
            }
        }

        Ok(())
    }

    /// Open a logical stream to the device matching `target`.
    ///
    /// Matching policy: identity fields present in the target must all match
    /// the device's resolved identity. Only devices in a connectable status
    /// (Ready, Claimed, Closed, Busy) are considered.
    pub async fn create_transport_connection(
        &self,
        target: &TargetIdentity,
    ) -> Result<StreamConnection> {
        self.ctx.check().map_err(ClaimError::from)?;

        let claim = {
            let mut devices = self.lock_devices();
            let mut chosen: Option<&mut ManagedDevice> = None;
            for device in devices.values_mut() {
                if !device.status().is_connectable() {
                    continue;
                }
                let Some(settings) = &device.settings else {
                    continue;
                };
                if settings.matches_target(target) {
                    chosen = Some(device);
                    break;
                }
            }
            let Some(device) = chosen else {
                return Err(ClaimError::NoMatchingDevice);
            };
            let settings = Arc::clone(
                device
                    .settings
                    .as_ref()
                    .expect("matched device has settings"),
            );
            let path = device.initializer.path().to_string();
            let backend = Arc::clone(&self.backend);
            let ctx = Arc::clone(&self.ctx);
            let config = self.config;
            Arc::clone(device.claim.get_or_insert_with(|| {
                Arc::new(DeviceClaim::new(backend, ctx, path, settings, config))
            }))
        };

        let stream = claim.create_connection().await?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.lock_connections().insert(id, stream.clone());
        Ok(stream)
    }

    /// Close a previously created connection by its stream id.
    pub async fn close_transport_connection(&self, stream_id: i32) {
        let matching: Vec<(u64, StreamConnection)> = {
            let connections = self.lock_connections();
            connections
                .iter()
                .filter(|(_, s)| s.id() == stream_id)
                .map(|(id, s)| (*id, s.clone()))
                .collect()
        };
        for (id, stream) in matching {
            stream.close().await;
            self.lock_connections().remove(&id);
        }
    }

    /// Drop tracked connections whose underlying claim has died.
    pub fn cleanup(&self) {
        let mut connections = self.lock_connections();
        let before = connections.len();
        connections.retain(|_, stream| stream.is_alive());
        let dropped = before - connections.len();
        if dropped > 0 {
            debug!(dropped, "cleaned up dead connections");
        }
    }

    /// Current device table, for diagnostics.
    pub fn devices(&self) -> Vec<DeviceView> {
        let devices = self.lock_devices();
        let mut views: Vec<DeviceView> = devices
            .iter()
            .map(|(path, device)| DeviceView {
                path: path.clone(),
                status: device.status(),
                node_id: device.settings.as_ref().and_then(|s| s.node_id),
                node_name: device.settings.as_ref().and_then(|s| s.node_name.clone()),
            })
            .collect();
        views.sort_by(|a, b| a.path.cmp(&b.path));
        views
    }

    /// Process-wide teardown: fail new work fast, close every claim.
    pub async fn shutdown(&self) {
        self.ctx.shutdown();
        let claims: Vec<Arc<DeviceClaim>> = {
            let devices = self.lock_devices();
            devices.values().filter_map(|d| d.claim.clone()).collect()
        };
        for claim in claims {
            claim.close().await;
        }
        self.lock_connections().clear();
        warn!("device manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use buslink_backend::mock::{MockBackend, MockDevice};

    use super::*;
    use crate::descriptor::{build_vendor_descriptor, DETECTION_UUID};

    const NODE_A: &str = "11111111-2222-3333-4444-555555555555";
    const NODE_B: &str = "66666666-7777-8888-9999-aaaaaaaaaaaa";

    fn device(node_id: &str, name: &str) -> Arc<MockDevice> {
        MockDevice::builder()
            .descriptor_block(build_vendor_descriptor(&DETECTION_UUID, 4, 5, &[1]))
            .string(4, node_id)
            .string(5, name)
            .stream_ids([1, 2, 3])
            .build()
    }

    fn manager_with(backend: MockBackend, ctx: Arc<BackendContext>) -> DeviceManager {
        DeviceManager::new(Arc::new(backend), ctx, ClaimConfig::default())
    }

    async fn two_device_manager() -> (DeviceManager, Arc<MockDevice>, Arc<MockDevice>) {
        let ctx = BackendContext::new();
        let backend = MockBackend::new(Arc::clone(&ctx));
        let dev_a = device(NODE_A, "robot-a");
        let dev_b = device(NODE_B, "robot-b");
        backend.add_device("mock:a", Arc::clone(&dev_a));
        backend.add_device("mock:b", Arc::clone(&dev_b));
        let manager = manager_with(backend, ctx);
        manager.update_devices().await.expect("scan should succeed");
        (manager, dev_a, dev_b)
    }

    #[tokio::test]
    async fn update_devices_initializes_new_paths() {
        let (manager, _, _) = two_device_manager().await;
        let views = manager.devices();
        assert_eq!(views.len(), 2);
        assert!(views.iter().all(|v| v.status == DeviceStatus::Ready));
        assert_eq!(views[0].node_name.as_deref(), Some("robot-a"));
    }

    #[tokio::test]
    async fn routes_by_node_name() {
        let (manager, _dev_a, dev_b) = two_device_manager().await;

        let stream = manager
            .create_transport_connection(&TargetIdentity::by_name("robot-b"))
            .await
            .expect("connection should route to robot-b");
        assert!(stream.is_alive());
        assert!(dev_b.exclusively_held());
    }

    #[tokio::test]
    async fn routes_by_node_id() {
        let (manager, dev_a, _dev_b) = two_device_manager().await;

        manager
            .create_transport_connection(&TargetIdentity::by_id(NODE_A.parse().unwrap()))
            .await
            .expect("connection should route to robot-a");
        assert!(dev_a.exclusively_held());
    }

    #[tokio::test]
    async fn both_fields_must_match_when_both_given() {
        let (manager, _, _) = two_device_manager().await;

        let mismatched = TargetIdentity {
            node_id: Some(NODE_A.parse().unwrap()),
            node_name: Some("robot-b".into()),
        };
        assert!(matches!(
            manager.create_transport_connection(&mismatched).await,
            Err(ClaimError::NoMatchingDevice)
        ));
    }

    #[tokio::test]
    async fn no_match_yields_descriptive_error() {
        let (manager, _, _) = two_device_manager().await;
        let err = manager
            .create_transport_connection(&TargetIdentity::by_name("robot-z"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no matching device or device busy");
    }

    #[tokio::test]
    async fn vanished_device_is_shut_down() {
        let ctx = BackendContext::new();
        let backend = MockBackend::new(Arc::clone(&ctx));
        let dev = device(NODE_A, "robot-a");
        backend.add_device("mock:a", Arc::clone(&dev));
        let backend = Arc::new(backend);
        let manager = DeviceManager::new(
            Arc::clone(&backend) as Arc<dyn DeviceBackend>,
            ctx,
            ClaimConfig::default(),
        );
        manager.update_devices().await.expect("scan should succeed");

        let stream = manager
            .create_transport_connection(&TargetIdentity::by_name("robot-a"))
            .await
            .expect("connection should open");
        assert!(dev.exclusively_held());

        backend.remove_device("mock:a");
        manager.update_devices().await.expect("rescan should succeed");

        assert!(manager.devices().is_empty());
        assert!(!dev.exclusively_held());
        assert!(!stream.is_alive());
    }

    #[tokio::test]
    async fn cleanup_drops_dead_connections() {
        let (manager, _, _) = two_device_manager().await;
        let stream = manager
            .create_transport_connection(&TargetIdentity::by_name("robot-a"))
            .await
            .expect("connection should open");

        assert_eq!(manager.lock_connections().len(), 1);
        stream.close().await;
        manager.cleanup();
        assert!(manager.lock_connections().is_empty());
    }

    #[tokio::test]
    async fn close_transport_connection_by_stream_id() {
        let (manager, _, _) = two_device_manager().await;
        let stream = manager
            .create_transport_connection(&TargetIdentity::by_name("robot-a"))
            .await
            .expect("connection should open");

        manager.close_transport_connection(stream.id()).await;
        assert!(!stream.is_alive());
        assert!(manager.lock_connections().is_empty());
    }

    #[tokio::test]
    async fn shutdown_fails_fast_and_closes_claims() {
        let (manager, dev_a, _) = two_device_manager().await;
        manager
            .create_transport_connection(&TargetIdentity::by_name("robot-a"))
            .await
            .expect("connection should open");

        manager.shutdown().await;
        assert!(!dev_a.exclusively_held());
        assert!(matches!(
            manager
                .create_transport_connection(&TargetIdentity::by_name("robot-a"))
                .await,
            Err(ClaimError::Shutdown)
        ));
        assert!(matches!(
            manager.update_devices().await,
            Err(ClaimError::Shutdown)
        ));
    }
}
