//! Device control surface.
//!
//! [`Device`] wraps a [`Session`] and exposes the engine's interaction
//! primitives as typed methods: touch, keys, swipes, text entry, screenshots,
//! app lifecycle, shell commands and UI dumps. Each method passes the session
//! handle plus its arguments to one entry point (or a short fixed sequence of
//! them), treats a zero result as [`RpcError::OperationFailed`], and routes
//! any returned buffer through the [`buffer`](crate::buffer) adapter so the
//! caller only ever sees owned data.
//!
//! Timed waits (long clicks, the text-entry retry policy) are plain sleeps.
//! They give the device and its IME time to catch up and are the main source
//! of flakiness on slow devices; tune them through [`TextEntryPolicy`].

use std::ffi::CString;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::binding::{entry, Arg};
use crate::buffer::{copy_owned_bytes, decode_owned_string, Encoding};
use crate::element::{Point, Rect};
use crate::error::RpcError;
use crate::node::Selector;
use crate::session::{DeviceKey, Session};

/// An Android key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyCode(pub u32);

impl KeyCode {
    pub const HOME: KeyCode = KeyCode(3);
    pub const BACK: KeyCode = KeyCode(4);
    pub const VOLUME_UP: KeyCode = KeyCode(24);
    pub const VOLUME_DOWN: KeyCode = KeyCode(25);
    pub const POWER: KeyCode = KeyCode(26);
    pub const ENTER: KeyCode = KeyCode(66);
    pub const DEL: KeyCode = KeyCode(67);
    pub const ESCAPE: KeyCode = KeyCode(111);
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Image format selector of the capture entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageType {
    Png = 0,
    Jpg = 1,
}

/// Attempts, clear counts and delays of [`Device::type_text_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextEntryPolicy {
    /// Maximum number of clear-and-send cycles.
    pub attempts: u32,
    /// DEL presses issued before each send.
    pub clear_count: u32,
    /// Wait between clearing and sending.
    pub ime_settle_ms: u64,
    /// Wait between a successful send and the ENTER confirmation.
    pub confirm_delay_ms: u64,
    /// Wait after a failed send.
    pub failure_backoff_ms: u64,
}

impl Default for TextEntryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            clear_count: 1000,
            ime_settle_ms: 800,
            confirm_delay_ms: 500,
            failure_backoff_ms: 1000,
        }
    }
}

/// Interaction surface of one connected device.
pub struct Device {
    session: Session,
    screenshot_entry: OnceLock<&'static str>,
}

impl Device {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            screenshot_entry: OnceLock::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn key(&self) -> &DeviceKey {
        self.session.key()
    }

    /// Closes the underlying session. Every later call fails with
    /// [`RpcError::InvalidHandle`].
    pub fn close(&mut self) {
        self.session.close();
    }

    /// Creates a selector bound to this device's session.
    pub fn selector(&self) -> Result<Selector<'_>, RpcError> {
        Selector::create(&self.session)
    }

    // ------------------------------------------------------------------
    // Touch
    // ------------------------------------------------------------------

    #[instrument(skip(self), level = "debug")]
    pub fn touch_down(&self, finger: u32, x: i32, y: i32) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        // SAFETY: `handle` stays open while the session is borrowed.
        unsafe {
            binding.call_checked(
                entry::TOUCH_DOWN,
                [handle.into(), finger.into(), x.into(), y.into()],
            )?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn touch_up(&self, finger: u32, x: i32, y: i32) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        // SAFETY: `handle` stays open while the session is borrowed.
        unsafe {
            binding.call_checked(
                entry::TOUCH_UP,
                [handle.into(), finger.into(), x.into(), y.into()],
            )?;
        }
        Ok(())
    }

    /// Swipes from `from` to `to` over `duration_ms`.
    #[instrument(skip(self), level = "debug")]
    pub fn swipe(&self, from: Point, to: Point, duration_ms: u32) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        // SAFETY: `handle` stays open while the session is borrowed.
        unsafe {
            binding.call_checked(
                entry::SWIPE,
                [
                    handle.into(),
                    1u32.into(),
                    from.x.into(),
                    from.y.into(),
                    to.x.into(),
                    to.y.into(),
                    duration_ms.into(),
                    0u32.into(),
                ],
            )?;
        }
        Ok(())
    }

    /// Presses at `(x, y)`, holds for `hold`, and releases.
    ///
    /// A failed `touchDown` returns immediately without a release.
    #[instrument(skip(self), level = "debug")]
    pub async fn long_click(&self, finger: u32, x: i32, y: i32, hold: Duration) -> Result<(), RpcError> {
        self.touch_down(finger, x, y)?;
        tokio::time::sleep(hold).await;
        self.touch_up(finger, x, y)
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    #[instrument(skip(self), level = "debug")]
    pub fn key_press(&self, code: KeyCode) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        // SAFETY: `handle` stays open while the session is borrowed.
        unsafe { binding.call_checked(entry::KEY_PRESS, [handle.into(), code.0.into()])? };
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn send_text(&self, text: &str) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        let text = CString::new(text)?;
        // SAFETY: `handle` is open and `text` is borrowed for the call.
        unsafe { binding.call_checked(entry::SEND_TEXT, [handle.into(), Arg::from(&text)])? };
        Ok(())
    }

    /// Presses DEL `count` times, stopping at the first failure.
    #[instrument(skip(self), level = "debug")]
    pub fn clear_text(&self, count: u32) -> Result<(), RpcError> {
        for _ in 0..count {
            self.key_press(KeyCode::DEL)?;
        }
        Ok(())
    }

    /// Enters `text` into the focused field, retrying per `policy`.
    ///
    /// Each attempt clears the field, waits for the IME, and sends the text.
    /// On success it waits and confirms with ENTER, returning the number of
    /// attempts used. Transient failures back off and retry; after the last
    /// attempt the result is [`RpcError::RetriesExhausted`]. Fatal errors and
    /// a closed session are returned immediately.
    #[instrument(skip(self, policy), level = "debug")]
    pub async fn type_text_with_retry(&self, text: &str, policy: &TextEntryPolicy) -> Result<u32, RpcError> {
        for attempt in 1..=policy.attempts {
            if let Err(e) = self.clear_text(policy.clear_count) {
                if !e.is_retryable() {
                    return Err(e);
                }
                debug!(device = %self.key(), attempt, error = %e, "clear failed");
            }
            tokio::time::sleep(Duration::from_millis(policy.ime_settle_ms)).await;

            match self.send_text(text) {
                Ok(()) => {
                    tokio::time::sleep(Duration::from_millis(policy.confirm_delay_ms)).await;
                    self.key_press(KeyCode::ENTER)?;
                    info!(device = %self.key(), attempt, "text entered");
                    return Ok(attempt);
                }
                Err(e) if e.is_retryable() => {
                    warn!(device = %self.key(), attempt, error = %e, "text entry failed");
                    tokio::time::sleep(Duration::from_millis(policy.failure_backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(RpcError::RetriesExhausted(policy.attempts))
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------

    /// Captures the whole screen as PNG.
    ///
    /// The capture entry point has no region parameter; use
    /// [`save_screenshot_to_file`](Self::save_screenshot_to_file) for a region.
    /// A zero-length capture is an empty vector.
    #[instrument(skip(self), level = "debug")]
    pub fn screenshot(&self, quality: u32) -> Result<Vec<u8>, RpcError> {
        let (binding, handle) = self.session.live()?;
        let mut len = 0i32;
        // SAFETY: `handle` is open and `len` is borrowed for the call. The
        // returned buffer is owned by us and adopted exactly once.
        unsafe {
            let ptr = binding.call(
                entry::TAKE_CAPTURE_COMPRESS,
                [
                    handle.into(),
                    (ImageType::Png as u32).into(),
                    quality.into(),
                    Arg::from(&mut len),
                ],
            )?;
            copy_owned_bytes(binding, ptr, len)?.ok_or(RpcError::OperationFailed(entry::TAKE_CAPTURE_COMPRESS))
        }
    }

    /// Saves a JPEG of `region` to `path` on the host.
    ///
    /// Uses the engine's direct-to-file export under whichever spelling it
    /// ships; the resolved name is remembered for later calls. When none is
    /// exported, falls back to [`screenshot`](Self::screenshot) and writes the
    /// PNG bytes to `path` itself.
    #[instrument(skip(self), level = "debug")]
    pub fn save_screenshot_to_file(&self, path: &Path, region: Rect, quality: u32) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        let resolved = match self.screenshot_entry.get() {
            Some(name) => Some(*name),
            None => binding
                .resolve_first(&entry::SCREENSHOT_EX)
                .map(|name| *self.screenshot_entry.get_or_init(|| name)),
        };

        let Some(name) = resolved else {
            debug!(device = %self.key(), "no direct screenshot export, capturing instead");
            let bytes = self.screenshot(quality)?;
            std::fs::write(path, bytes)?;
            return Ok(());
        };

        let c_path = CString::new(path.to_string_lossy().into_owned())?;
        // SAFETY: `handle` is open and `c_path` is borrowed for the call.
        unsafe {
            binding.call_checked(
                name,
                [
                    handle.into(),
                    region.left.into(),
                    region.top.into(),
                    region.right.into(),
                    region.bottom.into(),
                    (ImageType::Jpg as u32).into(),
                    quality.into(),
                    Arg::from(&c_path),
                ],
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Apps and shell
    // ------------------------------------------------------------------

    #[instrument(skip(self), level = "debug")]
    pub fn open_app(&self, package: &str) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        let package = CString::new(package)?;
        // SAFETY: `handle` is open and `package` is borrowed for the call.
        unsafe { binding.call_checked(entry::OPEN_APP, [handle.into(), Arg::from(&package)])? };
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn stop_app(&self, package: &str) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        let package = CString::new(package)?;
        // SAFETY: `handle` is open and `package` is borrowed for the call.
        unsafe { binding.call_checked(entry::STOP_APP, [handle.into(), Arg::from(&package)])? };
        Ok(())
    }

    /// Runs a shell command on the device and returns its output.
    #[instrument(skip(self), level = "debug")]
    pub fn exec_command(&self, command: &str) -> Result<String, RpcError> {
        let (binding, handle) = self.session.live()?;
        let command = CString::new(command)?;
        // SAFETY: `handle` is open and `command` is borrowed for the call.
        // `execCmd` returns a fresh UTF-16 buffer, adopted exactly once.
        unsafe {
            let ptr = binding.call(entry::EXEC_CMD, [handle.into(), 1u32.into(), Arg::from(&command)])?;
            decode_owned_string(binding, ptr, Encoding::Utf16)?.ok_or(RpcError::OperationFailed(entry::EXEC_CMD))
        }
    }

    // ------------------------------------------------------------------
    // UI hierarchy
    // ------------------------------------------------------------------

    /// Dumps the UI hierarchy as XML. `dump_all` includes invisible nodes.
    #[instrument(skip(self), level = "debug")]
    pub fn dump_node_xml(&self, dump_all: bool) -> Result<String, RpcError> {
        let (binding, handle) = self.session.live()?;
        // SAFETY: `handle` is open. The returned buffer is a fresh
        // terminated string, adopted exactly once.
        unsafe {
            let ptr = binding.call(entry::DUMP_NODE_XML, [handle.into(), dump_all.into()])?;
            decode_owned_string(binding, ptr, Encoding::Bytes)?.ok_or(RpcError::OperationFailed(entry::DUMP_NODE_XML))
        }
    }

    /// Dumps the UI hierarchy with an explicit work mode and timeout.
    #[instrument(skip(self), level = "debug")]
    pub fn dump_node_xml_ex(&self, work_mode: bool, timeout_ms: u32) -> Result<String, RpcError> {
        let (binding, handle) = self.session.live()?;
        // SAFETY: `handle` is open. The returned buffer is a fresh
        // terminated string, adopted exactly once.
        unsafe {
            let ptr = binding.call(
                entry::DUMP_NODE_XML_EX,
                [handle.into(), work_mode.into(), timeout_ms.into()],
            )?;
            decode_owned_string(binding, ptr, Encoding::Bytes)?
                .ok_or(RpcError::OperationFailed(entry::DUMP_NODE_XML_EX))
        }
    }

    /// Switches the engine's node-query backend.
    #[instrument(skip(self), level = "debug")]
    pub fn set_node_mode(&self, mode: u32) -> Result<(), RpcError> {
        let (binding, handle) = self.session.live()?;
        // SAFETY: `handle` stays open while the session is borrowed.
        unsafe { binding.call_checked(entry::USE_NEW_NODE_MODE, [handle.into(), mode.into()])? };
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("session", &self.session)
            .field("screenshot_entry", &self.screenshot_entry.get())
            .finish()
    }
}
