//! Connection handle ownership for one device.
//!
//! A [`Session`] owns the handle returned by `openDevice` for one
//! `host:port` endpoint and releases it through `closeDevice` exactly once,
//! either on an explicit [`Session::close`] or when dropped. Every operation
//! goes through [`Session::live`], which fails with
//! [`RpcError::InvalidHandle`] once the session is closed; a closed session is
//! never silently a no-op.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use droidrpc_core::binding::Binding;
//! use droidrpc_core::mock_engine::MockEngine;
//! use droidrpc_core::session::{ConnectOptions, Session};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), droidrpc_core::RpcError> {
//! let binding = Binding::new(Arc::new(MockEngine::device()));
//! let options = ConnectOptions { settle_ms: 0, ..Default::default() };
//! let mut session = Session::connect(binding, "10.0.0.5", 7101, &options).await?;
//! assert!(session.check_liveness()?);
//! session.close();
//! # Ok(())
//! # }
//! ```

use std::ffi::CString;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binding::{entry, Arg, Binding, Handle};
use crate::error::RpcError;

/// Identifies a device endpoint. Displays as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub host: String,
    pub port: u16,
}

impl DeviceKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parameters for [`Session::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Timeout passed to `openDevice`, in seconds.
    pub timeout_secs: u32,
    /// Delay after a successful open before the session is handed out.
    pub settle_ms: u64,
    /// Run `checkLive` after connecting and fail with
    /// [`RpcError::NotAlive`] if the device does not answer.
    pub verify_liveness: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            settle_ms: 1000,
            verify_liveness: true,
        }
    }
}

impl ConnectOptions {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

struct Connection {
    binding: Binding,
    handle: Handle,
}

/// An open connection to one device.
///
/// Not `Clone`: the handle has exactly one owner. Share a session by putting
/// the [`Device`](crate::device::Device) that wraps it behind a mutex, as the
/// [`SessionRegistry`](crate::registry::SessionRegistry) does.
pub struct Session {
    key: DeviceKey,
    conn: Option<Connection>,
}

impl Session {
    /// Opens a connection to `host:port`.
    ///
    /// A zero handle from the engine is [`RpcError::Rejected`]; a missing
    /// `openDevice` export is [`RpcError::Binding`].
    pub async fn connect(
        binding: Binding,
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Self, RpcError> {
        let key = DeviceKey::new(host, port);
        let raw = {
            let c_host = CString::new(host)?;
            // SAFETY: a borrowed string and two scalars.
            unsafe {
                binding.call(
                    entry::OPEN_DEVICE,
                    [
                        Arg::from(&c_host),
                        u32::from(port).into(),
                        options.timeout_secs.into(),
                    ],
                )?
            }
        };
        let handle = Handle::new(raw).ok_or_else(|| RpcError::Rejected {
            host: host.to_string(),
            port,
        })?;
        info!(device = %key, %handle, "device connected");

        let mut session = Self {
            key,
            conn: Some(Connection { binding, handle }),
        };

        if options.settle_ms > 0 {
            tokio::time::sleep(options.settle()).await;
        }

        if options.verify_liveness && !session.check_liveness()? {
            warn!(device = %session.key, "device failed liveness check");
            session.close();
            return Err(RpcError::NotAlive(session.key.to_string()));
        }

        Ok(session)
    }

    /// Returns the binding and handle of a live session.
    pub fn live(&self) -> Result<(&Binding, Handle), RpcError> {
        self.conn
            .as_ref()
            .map(|c| (&c.binding, c.handle))
            .ok_or(RpcError::InvalidHandle)
    }

    /// Returns the connection handle.
    pub fn handle(&self) -> Result<Handle, RpcError> {
        self.live().map(|(_, handle)| handle)
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.key.host
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Asks the engine whether the connection is alive.
    pub fn check_liveness(&self) -> Result<bool, RpcError> {
        let (binding, handle) = self.live()?;
        // SAFETY: `handle` stays open while `self` is borrowed.
        Ok(unsafe { binding.call(entry::CHECK_LIVE, [handle.into()])? } != 0)
    }

    /// Returns the engine version identifier.
    pub fn engine_version(&self) -> Result<String, RpcError> {
        let (binding, _) = self.live()?;
        // SAFETY: no arguments.
        let version = unsafe { binding.call_checked(entry::GET_VERSION, [])? };
        Ok(version.to_string())
    }

    /// Closes the connection. Idempotent and infallible: a failing
    /// `closeDevice` is logged and otherwise ignored.
    pub fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        // SAFETY: the connection was just taken out of `self.conn`, so its
        // handle is closed at most once.
        match unsafe { conn.binding.call(entry::CLOSE_DEVICE, [conn.handle.into()]) } {
            Ok(_) => info!(device = %self.key, "device closed"),
            Err(e) => debug!(device = %self.key, error = %e, "closeDevice failed"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("handle", &self.conn.as_ref().map(|c| c.handle))
            .finish()
    }
}
