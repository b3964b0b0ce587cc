//! Ownership adapter for buffers allocated by the engine.
//!
//! Every string or byte array the engine returns is engine-owned memory that
//! must be handed back through `freeRpcPtr` exactly once. [`ForeignBuffer`]
//! adopts such a pointer and releases it when dropped, so the release happens
//! on every exit path, including a failed decode. The free functions in this
//! module copy the data out into owned Rust values before the guard goes away.
//!
//! Adopting a pointer is `unsafe`: the caller hands over the only reference
//! to a buffer the engine just returned. Safe code cannot adopt a word twice
//! or adopt an address the engine never issued:
//!
//! ```compile_fail,E0133
//! use std::sync::Arc;
//! use droidrpc_core::binding::Binding;
//! use droidrpc_core::buffer::{decode_owned_string, Encoding};
//! use droidrpc_core::mock_engine::MockEngine;
//!
//! let binding = Binding::new(Arc::new(MockEngine::new()));
//! let _ = decode_owned_string(&binding, 0x10, Encoding::Bytes);
//! ```

use std::ffi::{c_char, CStr};
use std::num::NonZeroUsize;

use tracing::warn;

use crate::binding::{entry, Binding};
use crate::error::RpcError;

/// How a terminated string buffer is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8 bytes ending in a zero byte.
    Bytes,
    /// Native-endian UTF-16 code units ending in a zero unit.
    Utf16,
}

/// Scoped owner of one engine-allocated buffer.
///
/// Releases the buffer through the binding when dropped. A zero pointer is
/// never adopted, so it is never released.
pub struct ForeignBuffer<'b> {
    binding: &'b Binding,
    ptr: NonZeroUsize,
}

impl<'b> ForeignBuffer<'b> {
    /// Adopts `ptr`, returning `None` if it is zero.
    ///
    /// # Safety
    ///
    /// A non-zero `ptr` must be a buffer allocated by `binding`'s engine that
    /// has not been released, and nothing else may release or read it once
    /// the guard exists.
    pub unsafe fn adopt(binding: &'b Binding, ptr: usize) -> Option<Self> {
        NonZeroUsize::new(ptr).map(|ptr| Self { binding, ptr })
    }

    /// Returns the adopted address.
    pub fn addr(&self) -> usize {
        self.ptr.get()
    }

    /// Copies the bytes up to (not including) the terminating zero byte.
    ///
    /// # Safety
    ///
    /// The buffer must hold a zero-terminated byte sequence.
    unsafe fn terminated_bytes(&self) -> Vec<u8> {
        CStr::from_ptr(self.addr() as *const c_char).to_bytes().to_vec()
    }

    /// Copies the code units up to (not including) the terminating zero unit.
    ///
    /// # Safety
    ///
    /// The buffer must hold a zero-terminated UTF-16 sequence.
    unsafe fn terminated_units(&self) -> Vec<u16> {
        let base = self.addr() as *const u16;
        let mut units = Vec::new();
        loop {
            let unit = base.add(units.len()).read_unaligned();
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        units
    }

    /// Copies exactly `len` bytes.
    ///
    /// # Safety
    ///
    /// The buffer must be at least `len` bytes long.
    unsafe fn prefix(&self, len: usize) -> Vec<u8> {
        std::slice::from_raw_parts(self.addr() as *const u8, len).to_vec()
    }
}

impl Drop for ForeignBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard is the sole owner of a live engine buffer and
        // drops exactly once.
        if let Err(e) = unsafe { self.binding.call(entry::FREE_RPC_PTR, [self.addr().into()]) } {
            warn!(ptr = self.addr(), error = %e, "failed to release engine buffer");
        }
    }
}

impl std::fmt::Debug for ForeignBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignBuffer")
            .field("ptr", &format_args!("{:#x}", self.addr()))
            .finish()
    }
}

/// Decodes a terminated string buffer and releases it.
///
/// Returns `Ok(None)` for a zero pointer. The buffer is released exactly once
/// whether or not decoding succeeds.
///
/// # Safety
///
/// Same ownership contract as [`ForeignBuffer::adopt`]. A non-zero `ptr` must
/// also hold a string in `encoding` that ends in a zero terminator.
pub unsafe fn decode_owned_string(
    binding: &Binding,
    ptr: usize,
    encoding: Encoding,
) -> Result<Option<String>, RpcError> {
    // SAFETY: ownership of `ptr` is transferred by the caller.
    let Some(buffer) = (unsafe { ForeignBuffer::adopt(binding, ptr) }) else {
        return Ok(None);
    };
    // SAFETY: the engine returns terminated strings for these entry points and
    // the buffer stays allocated until `buffer` is dropped below.
    let text = match encoding {
        Encoding::Bytes => {
            let bytes = unsafe { buffer.terminated_bytes() };
            String::from_utf8(bytes).map_err(|e| RpcError::Decode(e.to_string()))?
        }
        Encoding::Utf16 => {
            let units = unsafe { buffer.terminated_units() };
            String::from_utf16(&units).map_err(|e| RpcError::Decode(e.to_string()))?
        }
    };
    Ok(Some(text))
}

/// Copies a length-prefixed byte buffer and releases it.
///
/// Returns `Ok(None)` for a zero pointer and an empty vector for a zero
/// length. A negative length with a live pointer is a [`RpcError::Decode`]
/// error. The buffer is released in every case.
///
/// # Safety
///
/// Same ownership contract as [`ForeignBuffer::adopt`]. A non-zero `ptr` must
/// also be at least `len` bytes long.
pub unsafe fn copy_owned_bytes(binding: &Binding, ptr: usize, len: i32) -> Result<Option<Vec<u8>>, RpcError> {
    // SAFETY: ownership of `ptr` is transferred by the caller.
    let Some(buffer) = (unsafe { ForeignBuffer::adopt(binding, ptr) }) else {
        return Ok(None);
    };
    let len = usize::try_from(len).map_err(|_| RpcError::Decode(format!("invalid buffer length {len}")))?;
    if len == 0 {
        return Ok(Some(Vec::new()));
    }
    // SAFETY: the engine reported `len` as the size of this buffer.
    Ok(Some(unsafe { buffer.prefix(len) }))
}
