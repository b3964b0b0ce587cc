//! One shared session per device endpoint.
//!
//! [`SessionRegistry`] maps a [`DeviceKey`] to a per-key once-cell holding
//! the connected [`Device`]. Lookups take the read lock; only the first access
//! to a new key takes the write lock, to insert the empty cell. The connect
//! itself runs inside the cell's initialiser, outside the map lock, so
//! concurrent first access to one device performs exactly one `openDevice`
//! while other devices proceed independently. A failed connect leaves the
//! cell empty and the next caller retries.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info};

use crate::binding::Binding;
use crate::device::Device;
use crate::error::RpcError;
use crate::session::{ConnectOptions, DeviceKey, Session};

/// A device shared between the registry and the task driving it.
pub type SharedDevice = Arc<Mutex<Device>>;

type Slot = Arc<OnceCell<SharedDevice>>;

/// Registry of connected devices, keyed by `host:port`.
pub struct SessionRegistry {
    binding: Binding,
    options: ConnectOptions,
    devices: RwLock<HashMap<DeviceKey, Slot>>,
}

impl SessionRegistry {
    pub fn new(binding: Binding, options: ConnectOptions) -> Self {
        Self {
            binding,
            options,
            devices: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: &DeviceKey) -> Slot {
        if let Some(slot) = self.devices.read().await.get(key) {
            return slot.clone();
        }
        let mut devices = self.devices.write().await;
        devices.entry(key.clone()).or_default().clone()
    }

    /// Returns the device for `host:port`, connecting on first use.
    pub async fn get_or_create(&self, host: &str, port: u16) -> Result<SharedDevice, RpcError> {
        let key = DeviceKey::new(host, port);
        let slot = self.slot(&key).await;
        let device = slot
            .get_or_try_init(|| async {
                debug!(device = %key, "connecting");
                let session = Session::connect(self.binding.clone(), host, port, &self.options).await?;
                info!(device = %key, "session ready");
                Ok::<_, RpcError>(Arc::new(Mutex::new(Device::new(session))))
            })
            .await?;
        Ok(device.clone())
    }

    /// Returns the device for `key` if it is connected.
    pub async fn get(&self, key: &DeviceKey) -> Option<SharedDevice> {
        self.devices
            .read()
            .await
            .get(key)
            .and_then(|slot| slot.get().cloned())
    }

    /// Returns the keys of all connected devices.
    pub async fn keys(&self) -> Vec<DeviceKey> {
        let devices = self.devices.read().await;
        let mut keys: Vec<DeviceKey> = devices
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Returns the number of connected devices.
    pub async fn len(&self) -> usize {
        self.devices
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every session and empties the registry.
    ///
    /// Waits for each device's lock, so call this after the tasks using the
    /// devices have finished.
    pub async fn close_all(&self) {
        let slots: Vec<(DeviceKey, Slot)> = self.devices.write().await.drain().collect();
        for (key, slot) in slots {
            if let Some(device) = slot.get() {
                device.lock().await.close();
                debug!(device = %key, "removed from registry");
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("options", &self.options)
            .field("devices", &"<RwLock<HashMap<DeviceKey, OnceCell<SharedDevice>>>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::entry;
    use crate::mock_engine::MockEngine;

    fn registry(engine: Arc<MockEngine>) -> SessionRegistry {
        let options = ConnectOptions {
            settle_ms: 0,
            ..Default::default()
        };
        SessionRegistry::new(Binding::new(engine), options)
    }

    #[tokio::test]
    async fn second_lookup_reuses_session() {
        let engine = Arc::new(MockEngine::device());
        let registry = registry(engine.clone());

        let a = registry.get_or_create("10.0.0.5", 7101).await.unwrap();
        let b = registry.get_or_create("10.0.0.5", 7101).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(engine.call_count(entry::OPEN_DEVICE), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_ports_get_distinct_sessions() {
        let engine = Arc::new(MockEngine::device());
        let registry = registry(engine.clone());

        let a = registry.get_or_create("10.0.0.5", 7101).await.unwrap();
        let b = registry.get_or_create("10.0.0.5", 7102).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(
            registry.keys().await,
            vec![DeviceKey::new("10.0.0.5", 7101), DeviceKey::new("10.0.0.5", 7102)]
        );
    }

    #[tokio::test]
    async fn failed_connect_can_be_retried() {
        let engine = Arc::new(MockEngine::device().with_sequence(
            entry::OPEN_DEVICE,
            [0, MockEngine::DEVICE_HANDLE],
        ));
        let registry = registry(engine.clone());

        let err = registry.get_or_create("h", 1).await.unwrap_err();
        assert!(matches!(err, RpcError::Rejected { .. }));
        assert!(registry.get(&DeviceKey::new("h", 1)).await.is_none());
        assert!(registry.is_empty().await);

        registry.get_or_create("h", 1).await.unwrap();
        assert_eq!(engine.call_count(entry::OPEN_DEVICE), 2);
    }

    #[tokio::test]
    async fn close_all_closes_each_session_once() {
        let engine = Arc::new(MockEngine::device());
        let registry = registry(engine.clone());
        let device = registry.get_or_create("h", 1).await.unwrap();
        registry.get_or_create("h", 2).await.unwrap();

        registry.close_all().await;
        assert_eq!(engine.call_count(entry::CLOSE_DEVICE), 2);
        assert!(registry.is_empty().await);
        assert!(!device.lock().await.session().is_open());

        drop(device);
        assert_eq!(engine.call_count(entry::CLOSE_DEVICE), 2);
    }
}
