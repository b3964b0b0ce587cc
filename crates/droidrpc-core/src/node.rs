//! UI node queries.
//!
//! A [`Selector`] is an engine-side query object owned by one session. Query
//! predicates accumulate on it, [`Selector::find_one`] runs a bounded search,
//! and the selector is cleared after every search so predicates never leak
//! into the next one:
//!
//! ```text
//! Created -> QueriesAccumulated -> Searching -> (found | empty) -> Created
//! ```
//!
//! Selectors and the [`Node`]s they return borrow the [`Session`], so neither
//! can outlive a close of the connection.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use droidrpc_core::device::Device;
//!
//! # fn example(device: &Device) -> Result<(), droidrpc_core::RpcError> {
//! let mut selector = device.selector()?;
//! selector
//!     .add_text_query("Comment")?
//!     .add_class_query("android.widget.TextView")?;
//! if let Some(node) = selector.find_one(Duration::from_secs(2))? {
//!     println!("{:?}", node.bounds()?);
//!     node.click()?;
//! }
//! # Ok(())
//! # }
//! ```

use std::ffi::CString;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::binding::{entry, Arg, Handle};
use crate::buffer::{decode_owned_string, Encoding};
use crate::element::Rect;
use crate::error::RpcError;
use crate::session::Session;

/// The kind of a selector predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
    /// Node text contains the value.
    TextContains,
    /// Node class name equals the value.
    ClassEquals,
    /// Node enabled state equals the value.
    Enabled,
}

impl QueryKind {
    fn entry(self) -> &'static str {
        match self {
            QueryKind::TextContains => entry::ADD_QUERY_TEXT,
            QueryKind::ClassEquals => entry::ADD_QUERY_CLASS,
            QueryKind::Enabled => entry::ADD_QUERY_ENABLED,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryKind::TextContains => "text-contains",
            QueryKind::ClassEquals => "class-equals",
            QueryKind::Enabled => "enabled",
        };
        f.write_str(name)
    }
}

/// An engine-side node query bound to one session.
pub struct Selector<'s> {
    session: &'s Session,
    handle: Handle,
    queries: Vec<(QueryKind, String)>,
}

impl<'s> Selector<'s> {
    /// Creates an empty selector on `session`.
    pub fn create(session: &'s Session) -> Result<Self, RpcError> {
        let (binding, device) = session.live()?;
        // SAFETY: `device` stays open while `session` is borrowed.
        let raw = unsafe { binding.call_checked(entry::NEW_SELECTOR, [device.into()])? };
        let handle = Handle::new(raw).ok_or(RpcError::OperationFailed(entry::NEW_SELECTOR))?;
        Ok(Self {
            session,
            handle,
            queries: Vec::new(),
        })
    }

    /// Requires node text to contain `text`.
    pub fn add_text_query(&mut self, text: &str) -> Result<&mut Self, RpcError> {
        self.add_query(QueryKind::TextContains, text.to_string())
    }

    /// Requires the node class to equal `class`.
    pub fn add_class_query(&mut self, class: &str) -> Result<&mut Self, RpcError> {
        self.add_query(QueryKind::ClassEquals, class.to_string())
    }

    /// Requires the node enabled state to equal `enabled`.
    pub fn add_enabled_query(&mut self, enabled: bool) -> Result<&mut Self, RpcError> {
        self.add_query(QueryKind::Enabled, enabled.to_string())
    }

    fn add_query(&mut self, kind: QueryKind, value: String) -> Result<&mut Self, RpcError> {
        let (binding, _) = self.session.live()?;
        let c_value = CString::new(value.as_str())?;
        // SAFETY: the selector belongs to the borrowed session and `c_value`
        // is borrowed for the call.
        let accepted = unsafe { binding.call(kind.entry(), [self.handle.into(), Arg::from(&c_value)])? };
        if accepted == 0 {
            return Err(RpcError::QueryRejected { kind, value });
        }
        self.queries.push((kind, value));
        Ok(self)
    }

    /// Returns the predicates added since the last clear.
    pub fn queries(&self) -> &[(QueryKind, String)] {
        &self.queries
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Searches for the first node matching the accumulated predicates,
    /// waiting at most `timeout`.
    ///
    /// An empty result is `Ok(None)`. The selector is cleared afterwards,
    /// whatever the outcome.
    pub fn find_one(&mut self, timeout: Duration) -> Result<Option<Node<'s>>, RpcError> {
        let found = self.search(timeout);
        if let Err(e) = self.clear() {
            warn!(selector = %self.handle, error = %e, "failed to clear selector");
        }
        found
    }

    fn search(&self, timeout: Duration) -> Result<Option<Node<'s>>, RpcError> {
        let (binding, _) = self.session.live()?;
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        // SAFETY: the selector and the node list it yields belong to the
        // borrowed session, which keeps them valid.
        let nodes = unsafe { binding.call(entry::FIND_NODES, [self.handle.into(), 1u32.into(), timeout_ms.into()])? };
        let Some(nodes) = Handle::new(nodes) else {
            debug!(queries = ?self.queries, "no matching node");
            return Ok(None);
        };
        if unsafe { binding.call(entry::GET_NODES_SIZE, [nodes.into()])? } == 0 {
            return Ok(None);
        }
        let node = unsafe { binding.call(entry::GET_NODE_BY_INDEX, [nodes.into(), 0u32.into()])? };
        Ok(Handle::new(node).map(|handle| Node {
            session: self.session,
            handle,
        }))
    }

    /// Drops every predicate, engine-side and locally.
    pub fn clear(&mut self) -> Result<(), RpcError> {
        self.queries.clear();
        let (binding, _) = self.session.live()?;
        // SAFETY: the selector belongs to the borrowed session.
        unsafe { binding.call_checked(entry::CLEAR_SELECTOR, [self.handle.into()])? };
        Ok(())
    }
}

impl fmt::Debug for Selector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("device", self.session.key())
            .field("handle", &self.handle)
            .field("queries", &self.queries)
            .finish()
    }
}

/// A UI node found by a [`Selector`], backed by an engine handle.
pub struct Node<'s> {
    session: &'s Session,
    handle: Handle,
}

impl Node<'_> {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn click(&self) -> Result<(), RpcError> {
        let (binding, _) = self.session.live()?;
        // SAFETY: the node belongs to the borrowed session.
        unsafe { binding.call_checked(entry::CLICK_NODE, [self.handle.into()])? };
        Ok(())
    }

    /// Returns the node's bounding box.
    pub fn bounds(&self) -> Result<Rect, RpcError> {
        let (binding, _) = self.session.live()?;
        let mut rect = Rect::default();
        // SAFETY: the node belongs to the borrowed session and the four
        // out-parameters are borrowed for the call.
        unsafe {
            binding.call_checked(
                entry::GET_NODE_BOUND,
                [
                    self.handle.into(),
                    Arg::from(&mut rect.left),
                    Arg::from(&mut rect.top),
                    Arg::from(&mut rect.right),
                    Arg::from(&mut rect.bottom),
                ],
            )?;
        }
        Ok(rect)
    }

    /// Returns the node's text. A node without text yields an empty string.
    pub fn text(&self) -> Result<String, RpcError> {
        let (binding, _) = self.session.live()?;
        // SAFETY: the node belongs to the borrowed session. The returned
        // buffer is a fresh terminated string, adopted exactly once.
        let text = unsafe {
            let ptr = binding.call(entry::GET_NODE_TEXT, [self.handle.into()])?;
            decode_owned_string(binding, ptr, Encoding::Bytes)?
        };
        Ok(text.unwrap_or_default())
    }

    /// Returns the node's attributes as pretty-printed JSON.
    ///
    /// If the engine's JSON does not parse, it is returned unchanged.
    pub fn json(&self) -> Result<String, RpcError> {
        let (binding, _) = self.session.live()?;
        // SAFETY: the node belongs to the borrowed session. The returned
        // buffer is a fresh terminated string, adopted exactly once.
        let raw = unsafe {
            let ptr = binding.call(entry::GET_NODE_JSON, [self.handle.into()])?;
            decode_owned_string(binding, ptr, Encoding::Bytes)?
        }
        .ok_or(RpcError::OperationFailed(entry::GET_NODE_JSON))?;
        Ok(pretty_json(raw))
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("device", self.session.key())
            .field("handle", &self.handle)
            .finish()
    }
}

fn pretty_json(raw: String) -> String {
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or(raw),
        Err(_) => raw,
    }
}
