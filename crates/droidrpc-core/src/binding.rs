//! Foreign interface binding for the automation engine.
//!
//! The engine is reached only through named entry points that take
//! pointer-sized words and return a pointer-sized word. This module defines
//! that capability as the [`Engine`] trait and wraps it in [`Binding`], which
//! is what the rest of the crate talks to.
//!
//! # Typed arguments
//!
//! Callers pass [`Arg`] values, which borrow whatever memory a pointer
//! argument refers to, so a C string or an out-parameter is guaranteed to
//! outlive the call. Handles and engine buffers still travel as plain words,
//! so [`Binding::call`] is `unsafe`: the caller vouches that every such word
//! is one the engine issued and has not yet released.
//!
//! ```no_run
//! use std::ffi::CString;
//! use droidrpc_core::binding::{entry, Arg, Binding};
//!
//! # fn example(binding: &Binding) -> Result<(), droidrpc_core::RpcError> {
//! let host = CString::new("10.0.0.5")?;
//! // SAFETY: every argument is a borrowed string or a scalar.
//! let handle = unsafe {
//!     binding.call(entry::OPEN_DEVICE, [Arg::from(&host), 7101u32.into(), 10u32.into()])?
//! };
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```
//!
//! # Implementations
//!
//! - [`NativeEngine`](crate::native::NativeEngine) loads the engine's shared
//!   library and calls its exports with the C calling convention.
//! - [`MockEngine`](crate::mock_engine::MockEngine) is a scripted in-process
//!   engine used by tests.

use std::ffi::{CStr, CString};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use tracing::trace;

use crate::error::RpcError;

/// Largest argument count any entry point takes (`swipe`, `screentshotEx`).
pub const MAX_ARITY: usize = 8;

/// Names of the entry points exported by the engine.
pub mod entry {
    pub const OPEN_DEVICE: &str = "openDevice";
    pub const CLOSE_DEVICE: &str = "closeDevice";
    pub const GET_VERSION: &str = "getVersion";
    pub const CHECK_LIVE: &str = "checkLive";
    pub const USE_NEW_NODE_MODE: &str = "useNewNodeMode";
    pub const TAKE_CAPTURE_COMPRESS: &str = "takeCaptrueCompress";
    pub const KEY_PRESS: &str = "keyPress";
    pub const SWIPE: &str = "swipe";
    pub const TOUCH_DOWN: &str = "touchDown";
    pub const TOUCH_UP: &str = "touchUp";
    /// Casing variants of the direct-to-file screenshot export, probed in order.
    pub const SCREENSHOT_EX: [&str; 3] = ["screentshotEx", "ScreentshotEx", "screentShotEx"];
    pub const EXEC_CMD: &str = "execCmd";
    pub const OPEN_APP: &str = "openApp";
    pub const STOP_APP: &str = "stopApp";
    pub const SEND_TEXT: &str = "sendText";
    pub const DUMP_NODE_XML: &str = "dumpNodeXml";
    pub const DUMP_NODE_XML_EX: &str = "dumpNodeXmlEx";
    pub const NEW_SELECTOR: &str = "newSelector";
    pub const ADD_QUERY_TEXT: &str = "addQuery_TextContainWith";
    pub const ADD_QUERY_CLASS: &str = "addQuery_ClzEqual";
    pub const ADD_QUERY_ENABLED: &str = "addQuery_Enable";
    pub const FIND_NODES: &str = "findNodes";
    pub const GET_NODES_SIZE: &str = "getNodesSize";
    pub const GET_NODE_BY_INDEX: &str = "getNodeByIndex";
    pub const CLEAR_SELECTOR: &str = "clearSelector";
    pub const CLICK_NODE: &str = "clickNode";
    pub const GET_NODE_BOUND: &str = "getNodeNound";
    pub const GET_NODE_TEXT: &str = "getNodeText";
    pub const GET_NODE_JSON: &str = "getNodeJson";
    pub const FREE_RPC_PTR: &str = "freeRpcPtr";
}

/// An opaque, resolved entry point.
///
/// For the native engine this is the function address; other engines may use
/// any token they can map back to a callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint(pub usize);

/// The capability exposed by an automation engine.
///
/// Implementations must be shareable across device tasks; the engine itself
/// keeps per-connection state behind the handles it hands out.
pub trait Engine: Send + Sync {
    /// Resolves an entry point by name.
    ///
    /// Returns [`RpcError::Binding`] if the engine does not export it.
    fn resolve(&self, name: &str) -> Result<EntryPoint, RpcError>;

    /// Invokes a resolved entry point with ordinal word arguments.
    ///
    /// # Safety
    ///
    /// Every word that the entry point interprets as a pointer must point to
    /// memory that is valid, correctly typed and large enough for the whole
    /// duration of the call. `entry` must come from [`Engine::resolve`] on the
    /// same engine.
    unsafe fn invoke(&self, entry: EntryPoint, args: &[usize]) -> Result<usize, RpcError>;
}

/// A non-zero handle issued by the engine (device, selector, node list, node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Wraps a raw engine word, returning `None` for the zero handle.
    pub fn new(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    /// Returns the raw word passed back to the engine.
    pub fn raw(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.raw())
    }
}

/// One argument to an entry point.
///
/// Pointer-carrying variants borrow their target, which keeps it alive and
/// exclusively accessible until the call has returned.
#[derive(Debug)]
pub enum Arg<'a> {
    /// A scalar passed as-is.
    Word(usize),
    /// A NUL-terminated byte string.
    Str(&'a CStr),
    /// A 32-bit integer the engine writes through.
    Out(&'a mut i32),
}

impl Arg<'_> {
    fn into_word(self) -> usize {
        match self {
            Arg::Word(word) => word,
            Arg::Str(s) => s.as_ptr() as usize,
            Arg::Out(out) => out as *mut i32 as usize,
        }
    }
}

impl From<usize> for Arg<'_> {
    fn from(value: usize) -> Self {
        Arg::Word(value)
    }
}

impl From<u32> for Arg<'_> {
    fn from(value: u32) -> Self {
        Arg::Word(value as usize)
    }
}

impl From<i32> for Arg<'_> {
    /// Negative values are sign-extended to the full word.
    fn from(value: i32) -> Self {
        Arg::Word(value as isize as usize)
    }
}

impl From<bool> for Arg<'_> {
    fn from(value: bool) -> Self {
        Arg::Word(usize::from(value))
    }
}

impl From<Handle> for Arg<'_> {
    fn from(handle: Handle) -> Self {
        Arg::Word(handle.raw())
    }
}

impl<'a> From<&'a CStr> for Arg<'a> {
    fn from(s: &'a CStr) -> Self {
        Arg::Str(s)
    }
}

impl<'a> From<&'a CString> for Arg<'a> {
    fn from(s: &'a CString) -> Self {
        Arg::Str(s.as_c_str())
    }
}

impl<'a> From<&'a mut i32> for Arg<'a> {
    fn from(out: &'a mut i32) -> Self {
        Arg::Out(out)
    }
}

/// Shared, cloneable access to an [`Engine`].
///
/// Cloning is cheap; the engine (and for a native engine, the loaded library)
/// stays alive until the last clone is dropped.
#[derive(Clone)]
pub struct Binding {
    engine: Arc<dyn Engine>,
}

impl Binding {
    /// Wraps an existing engine.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Loads the engine shared library at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let engine = crate::native::NativeEngine::load(path)?;
        Ok(Self::new(Arc::new(engine)))
    }

    /// Returns `true` if the engine exports `name`.
    pub fn exports(&self, name: &str) -> bool {
        self.engine.resolve(name).is_ok()
    }

    /// Resolves the first of `candidates` the engine exports.
    pub fn resolve_first(&self, candidates: &[&'static str]) -> Option<&'static str> {
        candidates.iter().copied().find(|name| self.exports(name))
    }

    /// Resolves `name` and invokes it with typed arguments.
    ///
    /// Returns the raw result word; interpreting zero is up to the caller.
    ///
    /// # Safety
    ///
    /// Every [`Arg::Word`] that `name` interprets as a handle or a buffer
    /// pointer must have been issued by this engine and must not have been
    /// closed or released. Passing a buffer to `freeRpcPtr` transfers it back
    /// to the engine; the caller must not use that word again.
    pub unsafe fn call<const N: usize>(&self, name: &str, args: [Arg<'_>; N]) -> Result<usize, RpcError> {
        if N > MAX_ARITY {
            return Err(RpcError::Arity {
                name: name.to_string(),
                arity: N,
                max: MAX_ARITY,
            });
        }
        let entry = self.engine.resolve(name)?;
        let words = args.map(Arg::into_word);
        trace!(entry = name, args = ?words, "invoke");
        // SAFETY: borrowed pointer words come from `Arg` borrows that are
        // still live here. Handle and buffer words are covered by the
        // caller's contract.
        unsafe { self.engine.invoke(entry, &words) }
    }

    /// Like [`call`](Self::call), mapping a zero result to
    /// [`RpcError::OperationFailed`].
    ///
    /// # Safety
    ///
    /// Same contract as [`call`](Self::call).
    pub unsafe fn call_checked<const N: usize>(
        &self,
        name: &'static str,
        args: [Arg<'_>; N],
    ) -> Result<usize, RpcError> {
        // SAFETY: forwarded from the caller.
        match unsafe { self.call(name, args)? } {
            0 => Err(RpcError::OperationFailed(name)),
            word => Ok(word),
        }
    }

    /// Returns the underlying engine.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("engine", &"<dyn Engine>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_engine::MockEngine;

    #[test]
    fn handle_rejects_zero() {
        assert!(Handle::new(0).is_none());
        let handle = Handle::new(0x51).unwrap();
        assert_eq!(handle.raw(), 0x51);
        assert_eq!(handle.to_string(), "0x51");
    }

    #[test]
    fn negative_ints_are_sign_extended() {
        assert_eq!(Arg::from(-1i32).into_word(), usize::MAX);
        assert_eq!(Arg::from(42i32).into_word(), 42);
        assert_eq!(Arg::from(true).into_word(), 1);
        assert_eq!(Arg::from(false).into_word(), 0);
    }

    #[test]
    fn out_arg_points_at_target() {
        let mut value = 0i32;
        let expected = &mut value as *mut i32 as usize;
        assert_eq!(Arg::from(&mut value).into_word(), expected);
    }

    #[test]
    fn call_missing_entry_is_binding_error() {
        let binding = Binding::new(Arc::new(MockEngine::new()));
        let err = unsafe { binding.call(entry::KEY_PRESS, [1usize.into(), 66u32.into()]) };
        assert!(matches!(err, Err(RpcError::Binding(name)) if name == "keyPress"));
    }

    #[test]
    fn call_checked_maps_zero_to_failure() {
        let engine = MockEngine::new().with(entry::KEY_PRESS, 0);
        let binding = Binding::new(Arc::new(engine));
        let err = unsafe { binding.call_checked(entry::KEY_PRESS, [1usize.into(), 66u32.into()]) };
        assert!(matches!(err, Err(RpcError::OperationFailed("keyPress"))));
    }

    #[test]
    fn call_rejects_excess_arity() {
        let engine = MockEngine::new().with("wide", 1);
        let binding = Binding::new(Arc::new(engine));
        let args: [Arg<'_>; 9] = std::array::from_fn(|i| Arg::Word(i));
        let err = unsafe { binding.call("wide", args) };
        assert!(matches!(err, Err(RpcError::Arity { arity: 9, .. })));
    }

    #[test]
    fn resolve_first_probes_in_order() {
        let engine = MockEngine::new()
            .with("ScreentshotEx", 1)
            .with("screentShotEx", 1);
        let binding = Binding::new(Arc::new(engine));
        assert_eq!(binding.resolve_first(&entry::SCREENSHOT_EX), Some("ScreentshotEx"));

        let binding = Binding::new(Arc::new(MockEngine::new()));
        assert_eq!(binding.resolve_first(&entry::SCREENSHOT_EX), None);
    }

    #[test]
    fn string_args_reach_the_engine() {
        let engine = Arc::new(MockEngine::new().with(entry::SEND_TEXT, 1));
        let binding = Binding::new(engine.clone());
        let text = CString::new("hello").unwrap();
        unsafe { binding.call_checked(entry::SEND_TEXT, [7usize.into(), Arg::from(&text)]) }.unwrap();
        assert_eq!(engine.strings_for(entry::SEND_TEXT), vec!["hello".to_string()]);
    }
}
