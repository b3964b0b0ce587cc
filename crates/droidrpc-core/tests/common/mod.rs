//! Shared test helpers for droidrpc-core integration tests.
//!
//! Everything runs against `MockEngine`; these helpers wire it into the
//! session, device and registry layers with delays that suit tests.

#![allow(dead_code)]

use std::sync::Arc;

use droidrpc_core::binding::{entry, Binding};
use droidrpc_core::device::{Device, KeyCode, TextEntryPolicy};
use droidrpc_core::mock_engine::MockEngine;
use droidrpc_core::registry::SessionRegistry;
use droidrpc_core::script::{ReplyLayout, ReplyScript};
use droidrpc_core::session::{ConnectOptions, Session};

// ---------------------------------------------------------------------------
// Connection helpers
// ---------------------------------------------------------------------------

/// Connect options without the settle delay.
pub fn quick_options() -> ConnectOptions {
    ConnectOptions {
        settle_ms: 0,
        ..Default::default()
    }
}

/// Wrap a mock engine in a binding, keeping a handle for assertions.
pub fn bind(engine: MockEngine) -> (Arc<MockEngine>, Binding) {
    let engine = Arc::new(engine);
    let binding = Binding::new(engine.clone());
    (engine, binding)
}

/// Connect a device at `10.0.0.5:7101` on a mock engine.
pub async fn connected_device(engine: MockEngine) -> (Arc<MockEngine>, Device) {
    let (engine, binding) = bind(engine);
    let session = Session::connect(binding, "10.0.0.5", 7101, &quick_options())
        .await
        .unwrap();
    (engine, Device::new(session))
}

/// A registry over a mock engine with no settle delay.
pub fn registry(engine: MockEngine) -> (Arc<MockEngine>, Arc<SessionRegistry>) {
    let (engine, binding) = bind(engine);
    (engine, Arc::new(SessionRegistry::new(binding, quick_options())))
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// Text-entry policy with a small clear count and the usual delays.
pub fn small_policy(clear_count: u32) -> TextEntryPolicy {
    TextEntryPolicy {
        clear_count,
        ..Default::default()
    }
}

/// Reply script that always sends `text` and clears `clear_count` characters.
pub fn reply_script(text: &str, clear_count: u32) -> ReplyScript {
    ReplyScript::new(ReplyLayout::default(), small_policy(clear_count)).with_fixed_text(text)
}

// ---------------------------------------------------------------------------
// Call inspection
// ---------------------------------------------------------------------------

/// Key codes passed to `keyPress`, in call order.
pub fn key_codes(engine: &MockEngine) -> Vec<usize> {
    engine
        .calls_to(entry::KEY_PRESS)
        .into_iter()
        .map(|c| c.args[1])
        .collect()
}

/// How many times `code` was pressed.
pub fn presses(engine: &MockEngine, code: KeyCode) -> usize {
    key_codes(engine)
        .into_iter()
        .filter(|&c| c == code.0 as usize)
        .count()
}

/// Entry point names called, in order.
pub fn call_names(engine: &MockEngine) -> Vec<String> {
    engine.calls().into_iter().map(|c| c.name).collect()
}
