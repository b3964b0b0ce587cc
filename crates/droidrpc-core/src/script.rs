//! Scripted per-iteration device interactions.
//!
//! The orchestrator runs a [`DeviceScript`] once per loop iteration on each
//! device. [`ReplyScript`] is the shipped script: dismiss the keyboard, open
//! the "more" menu, open the comment box, and post a random number through
//! the text-entry retry policy.
//!
//! Steps tolerate transient failures: a step that fails with a retryable
//! error is logged with the device and step name and the script moves on.
//! Configuration problems (missing entry points) and a closed session end the
//! iteration with an error, which retires the device's loop.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::{Device, KeyCode, TextEntryPolicy};
use crate::error::RpcError;

/// One iteration of scripted interaction with a device.
#[async_trait]
pub trait DeviceScript: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Runs iteration `iteration` (zero-based) on `device`.
    ///
    /// Returning an error stops the device's loop.
    async fn run_iteration(&self, device: &Device, iteration: u32) -> Result<(), RpcError>;
}

/// A press-and-hold target on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tap {
    pub finger: u32,
    pub x: i32,
    pub y: i32,
}

/// Screen positions and timings of [`ReplyScript`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyLayout {
    /// Key pressed first to dismiss any keyboard or popup.
    pub dismiss_key: KeyCode,
    pub dismiss_wait_ms: u64,
    /// The "more" button.
    pub more_button: Tap,
    /// The "comment" button.
    pub comment_button: Tap,
    /// How long each button is held.
    pub hold_ms: u64,
    /// Wait after each button release for the screen to change.
    pub after_tap_ms: u64,
    /// Wait at the end of every iteration.
    pub final_wait_ms: u64,
    /// Replies are random integers in `0..reply_max`.
    pub reply_max: u32,
}

impl Default for ReplyLayout {
    fn default() -> Self {
        Self {
            dismiss_key: KeyCode::ESCAPE,
            dismiss_wait_ms: 1000,
            more_button: Tap {
                finger: 1,
                x: 660,
                y: 1200,
            },
            comment_button: Tap {
                finger: 2,
                x: 200,
                y: 1000,
            },
            hold_ms: 1500,
            after_tap_ms: 1500,
            final_wait_ms: 300,
            reply_max: 1_000_000,
        }
    }
}

/// Posts a numeric reply through the comment box.
#[derive(Debug, Clone, Default)]
pub struct ReplyScript {
    layout: ReplyLayout,
    policy: TextEntryPolicy,
    fixed_text: Option<String>,
}

impl ReplyScript {
    pub fn new(layout: ReplyLayout, policy: TextEntryPolicy) -> Self {
        Self {
            layout,
            policy,
            fixed_text: None,
        }
    }

    /// Sends `text` every iteration instead of a random number.
    pub fn with_fixed_text(mut self, text: impl Into<String>) -> Self {
        self.fixed_text = Some(text.into());
        self
    }

    pub fn layout(&self) -> &ReplyLayout {
        &self.layout
    }

    fn reply_text(&self) -> String {
        match &self.fixed_text {
            Some(text) => text.clone(),
            None => rand::thread_rng()
                .gen_range(0..self.layout.reply_max.max(1))
                .to_string(),
        }
    }

    async fn tap(&self, device: &Device, step: &'static str, target: Tap) -> Result<(), RpcError> {
        let hold = Duration::from_millis(self.layout.hold_ms);
        let result = device.long_click(target.finger, target.x, target.y, hold).await;
        tolerate(device, step, result)?;
        tokio::time::sleep(Duration::from_millis(self.layout.after_tap_ms)).await;
        Ok(())
    }
}

/// Logs and swallows a transient step failure; passes anything else through.
fn tolerate(device: &Device, step: &'static str, result: Result<(), RpcError>) -> Result<(), RpcError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_retryable() => {
            warn!(device = %device.key(), step, error = %e, "step failed, skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl DeviceScript for ReplyScript {
    fn name(&self) -> &str {
        "reply"
    }

    async fn run_iteration(&self, device: &Device, iteration: u32) -> Result<(), RpcError> {
        debug!(device = %device.key(), iteration = iteration + 1, "iteration started");

        tolerate(device, "dismiss", device.key_press(self.layout.dismiss_key))?;
        tokio::time::sleep(Duration::from_millis(self.layout.dismiss_wait_ms)).await;

        self.tap(device, "more", self.layout.more_button).await?;
        self.tap(device, "comment", self.layout.comment_button).await?;

        let text = self.reply_text();
        let entered = device
            .type_text_with_retry(&text, &self.policy)
            .await
            .map(|attempts| {
                info!(device = %device.key(), attempts, "reply sent");
            });
        tolerate(device, "reply", entered)?;

        tokio::time::sleep(Duration::from_millis(self.layout.final_wait_ms)).await;
        debug!(device = %device.key(), iteration = iteration + 1, "iteration finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{entry, Binding};
    use crate::mock_engine::MockEngine;
    use crate::session::{ConnectOptions, Session};
    use std::sync::Arc;

    async fn connect(engine: MockEngine) -> (Arc<MockEngine>, Device) {
        let engine = Arc::new(engine);
        let binding = Binding::new(engine.clone());
        let options = ConnectOptions {
            settle_ms: 0,
            ..Default::default()
        };
        let session = Session::connect(binding, "10.0.0.5", 7101, &options)
            .await
            .unwrap();
        (engine, Device::new(session))
    }

    fn quick_script() -> ReplyScript {
        let policy = TextEntryPolicy {
            clear_count: 3,
            ..Default::default()
        };
        ReplyScript::new(ReplyLayout::default(), policy)
    }

    #[test]
    fn default_layout_matches_reply_screen() {
        let layout = ReplyLayout::default();
        assert_eq!(layout.dismiss_key, KeyCode::ESCAPE);
        assert_eq!(
            layout.more_button,
            Tap {
                finger: 1,
                x: 660,
                y: 1200
            }
        );
        assert_eq!(layout.comment_button.finger, 2);
    }

    #[test]
    fn random_reply_is_in_range() {
        let script = ReplyScript::default();
        for _ in 0..100 {
            let n: u32 = script.reply_text().parse().unwrap();
            assert!(n < 1_000_000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_runs_steps_in_order() {
        let (engine, device) = connect(MockEngine::device()).await;
        let script = quick_script().with_fixed_text("42");
        script.run_iteration(&device, 0).await.unwrap();

        let steps: Vec<String> = engine
            .calls()
            .into_iter()
            .map(|c| c.name)
            .filter(|n| n != entry::OPEN_DEVICE && n != entry::CHECK_LIVE)
            .collect();
        let expected = [
            "keyPress",
            "touchDown",
            "touchUp",
            "touchDown",
            "touchUp",
            "keyPress",
            "keyPress",
            "keyPress",
            "sendText",
            "keyPress",
        ];
        assert_eq!(steps, expected);
        assert_eq!(engine.strings_for(entry::SEND_TEXT), vec!["42"]);

        let touches = engine.calls_to(entry::TOUCH_DOWN);
        assert_eq!(&touches[0].args[1..], &[1, 660, 1200]);
        assert_eq!(&touches[1].args[1..], &[2, 200, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_do_not_stop_iteration() {
        let engine = MockEngine::device()
            .with(entry::TOUCH_DOWN, 0)
            .with(entry::SEND_TEXT, 0);
        let (engine, device) = connect(engine).await;
        quick_script().run_iteration(&device, 0).await.unwrap();
        assert_eq!(engine.call_count(entry::SEND_TEXT), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_ends_iteration() {
        let (_engine, device) = connect(MockEngine::device().without(entry::TOUCH_DOWN)).await;
        let err = quick_script().run_iteration(&device, 0).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
