//! # droidrpc-core
//!
//! Session and resource-ownership layer for a native Android automation
//! engine reached through a foreign-call boundary.
//!
//! The engine does the real work (touch injection, text entry, capture, UI
//! queries). This crate owns what crosses the boundary: connection handles,
//! engine-allocated buffers, selector and node handles, and the concurrency
//! discipline for driving many devices at once.
//!
//! ## Modules
//!
//! - [`binding`] - The [`Engine`](binding::Engine) capability, typed call arguments and entry point names
//! - [`native`] - Engine backed by the `libmytrpc` shared library
//! - [`mock_engine`] - Scripted in-process engine for tests and dry runs
//! - [`buffer`] - Decode-then-release adapter for engine-owned buffers
//! - [`session`] - Connection handle ownership for one device
//! - [`device`] - Touch, key, text, capture, app, shell and UI dump operations
//! - [`node`] - Selectors and handle-backed UI nodes
//! - [`registry`] - One shared session per device endpoint
//! - [`script`] - Per-iteration device scripts
//! - [`orchestrator`] - Concurrent per-device tasks with cooperative cancellation
//! - [`config`] - Persistent configuration in `~/.droidrpc/config.json`
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use droidrpc_core::binding::Binding;
//! use droidrpc_core::device::{Device, KeyCode};
//! use droidrpc_core::session::{ConnectOptions, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), droidrpc_core::RpcError> {
//!     let binding = Binding::load("lib/libmytrpc.so")?;
//!     let session = Session::connect(binding, "192.168.1.181", 7101, &ConnectOptions::default()).await?;
//!     let device = Device::new(session);
//!
//!     device.key_press(KeyCode::HOME)?;
//!     device.open_app("com.example.app")?;
//!
//!     let mut selector = device.selector()?;
//!     selector.add_text_query("Sign in")?;
//!     if let Some(node) = selector.find_one(Duration::from_secs(3))? {
//!         node.click()?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod binding;
pub mod buffer;
pub mod config;
pub mod device;
pub mod element;
pub mod error;
pub mod mock_engine;
pub mod native;
pub mod node;
pub mod orchestrator;
pub mod registry;
pub mod script;
pub mod session;

pub use error::RpcError;
