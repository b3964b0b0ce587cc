//! Persistent configuration for droidrpc.
//!
//! Stores settings in `~/.droidrpc/config.json`. Every field has a default,
//! so a missing or partial file is fine; command-line flags override whatever
//! is loaded.
//!
//! # Example
//!
//! ```no_run
//! use droidrpc_core::config::DroidRpcConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = DroidRpcConfig::load();
//! println!("engine library: {}", config.library_path().display());
//! println!("iterations per device: {}", config.iterations);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::TextEntryPolicy;
use crate::native::default_library_path;
use crate::script::ReplyLayout;
use crate::session::ConnectOptions;

const CONFIG_FILENAME: &str = "config.json";

/// Returns the droidrpc state directory (`~/.droidrpc`), creating it if needed.
///
/// Falls back to `.droidrpc` in the working directory when there is no home
/// directory.
pub fn droidrpc_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".droidrpc");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Returns the default config file path.
pub fn default_config_path() -> PathBuf {
    droidrpc_dir().join(CONFIG_FILENAME)
}

/// Persistent droidrpc configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroidRpcConfig {
    /// Path to the engine shared library. Discovered when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_path: Option<PathBuf>,

    /// Iterations of the device script per device.
    pub iterations: u32,

    /// Connection parameters.
    pub connect: ConnectOptions,

    /// Text-entry retry policy.
    pub text_entry: TextEntryPolicy,

    /// Screen layout of the reply script.
    pub reply: ReplyLayout,
}

impl Default for DroidRpcConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            iterations: 100,
            connect: ConnectOptions::default(),
            text_entry: TextEntryPolicy::default(),
            reply: ReplyLayout::default(),
        }
    }
}

impl DroidRpcConfig {
    /// Load config from `~/.droidrpc/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&default_config_path())
    }

    /// Load config from `path`, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unparsable config");
                Self::default()
            }
        }
    }

    /// Save config to `path`.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Save config to `~/.droidrpc/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&default_config_path())
    }

    /// Returns the configured engine library path, or the discovered default.
    pub fn library_path(&self) -> PathBuf {
        self.library_path.clone().unwrap_or_else(default_library_path)
    }
}
