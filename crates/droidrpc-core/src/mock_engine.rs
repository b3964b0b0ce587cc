//! A scripted, in-process [`Engine`] for tests and dry runs.
//!
//! `MockEngine` exports whatever entry points it is told to, answers them
//! with programmable responders, and records every call. Buffers it hands out
//! are real heap allocations owned by a [`BufferArena`], so the buffer
//! ownership adapter reads and releases them exactly as it would engine
//! memory; the arena reports every release and flags any release of a
//! pointer it does not own.
//!
//! # Example
//!
//! ```
//! use std::ffi::CString;
//! use std::sync::Arc;
//! use droidrpc_core::binding::{entry, Arg, Binding};
//! use droidrpc_core::mock_engine::MockEngine;
//!
//! let engine = Arc::new(MockEngine::device().with_sequence(entry::SEND_TEXT, [0, 1]));
//! let binding = Binding::new(engine.clone());
//! let text = CString::new("hi").unwrap();
//!
//! // SAFETY: the mock treats the handle as a plain word and `text` is borrowed.
//! let send = || unsafe {
//!     binding.call(entry::SEND_TEXT, [MockEngine::DEVICE_HANDLE.into(), Arg::from(&text)])
//! };
//! assert_eq!(send().unwrap(), 0);
//! assert_eq!(send().unwrap(), 1);
//! assert_eq!(engine.call_count(entry::SEND_TEXT), 2);
//! assert_eq!(engine.strings_for(entry::SEND_TEXT), vec!["hi", "hi"]);
//! ```

use std::collections::{HashMap, VecDeque};
use std::ffi::{c_char, CStr};
use std::sync::{Mutex, MutexGuard};

use crate::binding::{entry, Engine, EntryPoint};
use crate::element::Rect;
use crate::error::RpcError;

/// Computes the result word of one entry-point call.
pub type Responder = Box<dyn FnMut(&mut BufferArena, &[usize]) -> usize + Send>;

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Entry point name.
    pub name: String,
    /// Raw argument words.
    pub args: Vec<usize>,
    /// C string arguments, decoded at call time.
    pub strings: Vec<String>,
}

/// Heap buffers handed to callers as "engine-owned" memory.
#[derive(Default)]
pub struct BufferArena {
    live: HashMap<usize, Box<[u8]>>,
    released: Vec<usize>,
    invalid_releases: Vec<usize>,
}

impl BufferArena {
    /// Allocates a copy of `bytes` and returns its address.
    ///
    /// At least one byte is always allocated so the address is unique.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> usize {
        let mut storage = bytes.to_vec();
        if storage.is_empty() {
            storage.push(0);
        }
        let buffer = storage.into_boxed_slice();
        let ptr = buffer.as_ptr() as usize;
        self.live.insert(ptr, buffer);
        ptr
    }

    /// Allocates a NUL-terminated byte string.
    pub fn alloc_c_str(&mut self, text: &str) -> usize {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.alloc_bytes(&bytes)
    }

    /// Allocates a NUL-terminated UTF-16 string in native byte order.
    pub fn alloc_utf16(&mut self, text: &str) -> usize {
        let bytes: Vec<u8> = text
            .encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_ne_bytes)
            .collect();
        self.alloc_bytes(&bytes)
    }

    fn release(&mut self, ptr: usize) {
        if self.live.remove(&ptr).is_some() {
            self.released.push(ptr);
        } else {
            self.invalid_releases.push(ptr);
        }
    }
}

/// Writes `value` through an out-parameter word.
///
/// # Safety
///
/// `ptr` must be the address of a live, writable `i32`.
pub unsafe fn write_out(ptr: usize, value: i32) {
    *(ptr as *mut i32) = value;
}

/// Positions of C string arguments for entry points that take them.
fn string_arg_positions(name: &str) -> &'static [usize] {
    match name {
        entry::OPEN_DEVICE => &[0],
        entry::EXEC_CMD => &[2],
        entry::OPEN_APP
        | entry::STOP_APP
        | entry::SEND_TEXT
        | entry::ADD_QUERY_TEXT
        | entry::ADD_QUERY_CLASS
        | entry::ADD_QUERY_ENABLED => &[1],
        other if entry::SCREENSHOT_EX.contains(&other) => &[7],
        _ => &[],
    }
}

struct Export {
    name: String,
    responder: Responder,
}

#[derive(Default)]
struct MockState {
    exports: Vec<Export>,
    index: HashMap<String, usize>,
    calls: Vec<MockCall>,
    arena: BufferArena,
}

impl MockState {
    fn export(&mut self, name: &str, responder: Responder) {
        match self.index.get(name) {
            Some(&i) => self.exports[i].responder = responder,
            None => {
                self.index.insert(name.to_string(), self.exports.len());
                self.exports.push(Export {
                    name: name.to_string(),
                    responder,
                });
            }
        }
    }
}

/// Scripted engine. See the [module documentation](self).
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Handle returned by `openDevice` in [`MockEngine::device`].
    pub const DEVICE_HANDLE: usize = 0xD1;
    /// Handle returned by `newSelector` in [`MockEngine::device`].
    pub const SELECTOR_HANDLE: usize = 0x5E1;
    /// Node list returned by `findNodes` after [`MockEngine::with_match`].
    pub const NODES_HANDLE: usize = 0x7A0;
    /// Node returned by `getNodeByIndex` after [`MockEngine::with_match`].
    pub const NODE_HANDLE: usize = 0x70DE;
    /// Value returned by `getVersion` in [`MockEngine::device`].
    pub const VERSION: usize = 113;
    /// Bytes returned by `takeCaptrueCompress` in [`MockEngine::device`].
    pub const SCREENSHOT: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    /// Creates an engine exporting only `freeRpcPtr`.
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.export(
            entry::FREE_RPC_PTR,
            Box::new(|arena: &mut BufferArena, args: &[usize]| {
                if let Some(&ptr) = args.first() {
                    arena.release(ptr);
                }
                1
            }),
        );
        Self {
            state: Mutex::new(state),
        }
    }

    /// Creates an engine exporting the full device surface with benign
    /// answers: every action succeeds, searches find nothing, text results
    /// are short fixed strings.
    pub fn device() -> Self {
        Self::new()
            .with(entry::OPEN_DEVICE, Self::DEVICE_HANDLE)
            .with(entry::CLOSE_DEVICE, 1)
            .with(entry::GET_VERSION, Self::VERSION)
            .with(entry::CHECK_LIVE, 1)
            .with(entry::USE_NEW_NODE_MODE, 1)
            .with(entry::KEY_PRESS, 1)
            .with(entry::SWIPE, 1)
            .with(entry::TOUCH_DOWN, 1)
            .with(entry::TOUCH_UP, 1)
            .with(entry::OPEN_APP, 1)
            .with(entry::STOP_APP, 1)
            .with(entry::SEND_TEXT, 1)
            .with(entry::SCREENSHOT_EX[0], 1)
            .with_utf16(entry::EXEC_CMD, "ok")
            .with_c_str(entry::DUMP_NODE_XML, "<hierarchy rotation=\"0\"/>")
            .with_c_str(entry::DUMP_NODE_XML_EX, "<hierarchy rotation=\"0\"/>")
            .with_screenshot(&Self::SCREENSHOT)
            .with(entry::NEW_SELECTOR, Self::SELECTOR_HANDLE)
            .with(entry::ADD_QUERY_TEXT, 1)
            .with(entry::ADD_QUERY_CLASS, 1)
            .with(entry::ADD_QUERY_ENABLED, 1)
            .with(entry::FIND_NODES, 0)
            .with(entry::GET_NODES_SIZE, 0)
            .with(entry::GET_NODE_BY_INDEX, 0)
            .with(entry::CLEAR_SELECTOR, 1)
            .with(entry::CLICK_NODE, 1)
            .with_bounds(Rect::default())
            .with_c_str(entry::GET_NODE_TEXT, "")
            .with_c_str(entry::GET_NODE_JSON, "{}")
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exports `name` with a custom responder.
    pub fn with_fn(
        self,
        name: &str,
        responder: impl FnMut(&mut BufferArena, &[usize]) -> usize + Send + 'static,
    ) -> Self {
        self.lock().export(name, Box::new(responder));
        self
    }

    /// Exports `name` returning a constant.
    pub fn with(self, name: &str, value: usize) -> Self {
        self.with_fn(name, move |_, _| value)
    }

    /// Exports `name` returning `values` in order, repeating the last one.
    pub fn with_sequence(self, name: &str, values: impl IntoIterator<Item = usize>) -> Self {
        let mut queue: VecDeque<usize> = values.into_iter().collect();
        let mut last = 0;
        self.with_fn(name, move |_, _| {
            if let Some(value) = queue.pop_front() {
                last = value;
            }
            last
        })
    }

    /// Exports `name` returning a fresh NUL-terminated byte string per call.
    pub fn with_c_str(self, name: &str, text: &str) -> Self {
        let text = text.to_string();
        self.with_fn(name, move |arena, _| arena.alloc_c_str(&text))
    }

    /// Exports `name` returning a fresh NUL-terminated UTF-16 string per call.
    pub fn with_utf16(self, name: &str, text: &str) -> Self {
        let text = text.to_string();
        self.with_fn(name, move |arena, _| arena.alloc_utf16(&text))
    }

    /// Exports `takeCaptrueCompress` returning `bytes` through its length
    /// out-parameter.
    pub fn with_screenshot(self, bytes: &[u8]) -> Self {
        let bytes = bytes.to_vec();
        self.with_fn(entry::TAKE_CAPTURE_COMPRESS, move |arena, args| {
            if let Some(&len_ptr) = args.get(3) {
                // SAFETY: the device surface passes a live `i32` here.
                unsafe { write_out(len_ptr, bytes.len() as i32) };
            }
            arena.alloc_bytes(&bytes)
        })
    }

    /// Exports `getNodeNound` filling its four out-parameters from `rect`.
    pub fn with_bounds(self, rect: Rect) -> Self {
        self.with_fn(entry::GET_NODE_BOUND, move |_, args| {
            let values = [rect.left, rect.top, rect.right, rect.bottom];
            for (ptr, value) in args.iter().skip(1).zip(values) {
                // SAFETY: the node surface passes four live `i32`s here.
                unsafe { write_out(*ptr, value) };
            }
            1
        })
    }

    /// Makes every search find exactly one node.
    pub fn with_match(self) -> Self {
        self.with(entry::FIND_NODES, Self::NODES_HANDLE)
            .with(entry::GET_NODES_SIZE, 1)
            .with(entry::GET_NODE_BY_INDEX, Self::NODE_HANDLE)
    }

    /// Stops exporting `name`.
    pub fn without(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            if let Some(i) = state.index.remove(name) {
                // Keep indices stable; the slot just becomes unreachable.
                state.exports[i].name.clear();
            }
        }
        self
    }

    /// Returns every call in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Returns the calls made to `name`.
    pub fn calls_to(&self, name: &str) -> Vec<MockCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    /// Returns how many times `name` was called.
    pub fn call_count(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.name == name).count()
    }

    /// Returns the C string arguments passed to `name`, one per call.
    pub fn strings_for(&self, name: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.name == name)
            .flat_map(|c| c.strings.clone())
            .collect()
    }

    /// Returns the addresses released through `freeRpcPtr`, in order.
    pub fn released(&self) -> Vec<usize> {
        self.lock().arena.released.clone()
    }

    /// Returns releases of addresses the engine never handed out (or had
    /// already released).
    pub fn invalid_releases(&self) -> Vec<usize> {
        self.lock().arena.invalid_releases.clone()
    }

    /// Returns how many buffers are handed out and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.lock().arena.live.len()
    }

    /// Allocates a buffer in the engine's arena, for feeding the buffer
    /// adapter directly.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> usize {
        self.lock().arena.alloc_bytes(bytes)
    }
}

impl Engine for MockEngine {
    fn resolve(&self, name: &str) -> Result<EntryPoint, RpcError> {
        self.lock()
            .index
            .get(name)
            .map(|&i| EntryPoint(i))
            .ok_or_else(|| RpcError::Binding(name.to_string()))
    }

    unsafe fn invoke(&self, entry: EntryPoint, args: &[usize]) -> Result<usize, RpcError> {
        let mut guard = self.lock();
        let MockState {
            exports,
            calls,
            arena,
            ..
        } = &mut *guard;
        let export = exports
            .get_mut(entry.0)
            .filter(|e| !e.name.is_empty())
            .ok_or_else(|| RpcError::Binding(format!("#{}", entry.0)))?;

        let strings = string_arg_positions(&export.name)
            .iter()
            .filter_map(|&i| args.get(i).copied())
            .filter(|&ptr| ptr != 0)
            // SAFETY: the caller guarantees string arguments are live C strings.
            .map(|ptr| CStr::from_ptr(ptr as *const c_char).to_string_lossy().into_owned())
            .collect();
        calls.push(MockCall {
            name: export.name.clone(),
            args: args.to_vec(),
            strings,
        });

        Ok((export.responder)(arena, args))
    }
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockEngine")
            .field("exports", &state.index.keys().collect::<Vec<_>>())
            .field("calls", &state.calls.len())
            .field("live_buffers", &state.arena.live.len())
            .finish()
    }
}
