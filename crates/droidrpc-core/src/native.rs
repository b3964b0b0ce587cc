//! [`Engine`] implementation backed by the engine's shared library.
//!
//! The library is loaded once and shared by every session through
//! [`Binding`](crate::binding::Binding) clones. Resolved entry points are
//! cached, so probing or repeated calls never hit the dynamic loader twice
//! for the same name.
//!
//! Arguments are passed as pointer-sized words using the C calling
//! convention, which matches how the engine declares its exports (integer and
//! pointer parameters only).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use libloading::Library;
use tracing::{debug, info};

use crate::binding::{Engine, EntryPoint, MAX_ARITY};
use crate::error::RpcError;

/// File name of the engine library on the current platform.
pub fn library_file_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "libmytrpc.dll"
    } else if cfg!(target_os = "macos") {
        "libmytrpc.dylib"
    } else {
        "libmytrpc.so"
    }
}

/// Default location of the engine library.
///
/// Prefers `lib/<name>` relative to the working directory and falls back to
/// `lib/<name>` next to the running executable.
pub fn default_library_path() -> PathBuf {
    let relative = Path::new("lib").join(library_file_name());
    if relative.exists() {
        return relative;
    }
    match std::env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("lib").join(library_file_name()))
            .unwrap_or(relative),
        Err(_) => relative,
    }
}

/// The engine shared library, loaded into this process.
pub struct NativeEngine {
    library: Library,
    path: PathBuf,
    symbols: RwLock<HashMap<String, EntryPoint>>,
}

impl NativeEngine {
    /// Loads the library at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let path = path.as_ref().to_path_buf();
        info!(path = %path.display(), "loading engine library");
        // SAFETY: loading runs the library's initialisers. The engine library
        // is a trusted collaborator whose initialisers have no preconditions.
        let library = unsafe { Library::new(&path) }.map_err(|e| RpcError::LibraryLoad {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            library,
            path,
            symbols: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the path the library was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cached(&self, name: &str) -> Option<EntryPoint> {
        match self.symbols.read() {
            Ok(symbols) => symbols.get(name).copied(),
            Err(poisoned) => poisoned.into_inner().get(name).copied(),
        }
    }
}

impl Engine for NativeEngine {
    fn resolve(&self, name: &str) -> Result<EntryPoint, RpcError> {
        if let Some(entry) = self.cached(name) {
            return Ok(entry);
        }

        // SAFETY: the symbol is only turned into an address here; it is
        // called later through `invoke` with the signature the engine uses.
        let symbol = unsafe { self.library.get::<unsafe extern "C" fn()>(name.as_bytes()) }
            .map_err(|_| RpcError::Binding(name.to_string()))?;
        let entry = EntryPoint(*symbol as usize);
        debug!(entry = name, "resolved entry point");

        let mut symbols = match self.symbols.write() {
            Ok(symbols) => symbols,
            Err(poisoned) => poisoned.into_inner(),
        };
        symbols.insert(name.to_string(), entry);
        Ok(entry)
    }

    unsafe fn invoke(&self, entry: EntryPoint, args: &[usize]) -> Result<usize, RpcError> {
        type F0 = unsafe extern "C" fn() -> usize;
        type F1 = unsafe extern "C" fn(usize) -> usize;
        type F2 = unsafe extern "C" fn(usize, usize) -> usize;
        type F3 = unsafe extern "C" fn(usize, usize, usize) -> usize;
        type F4 = unsafe extern "C" fn(usize, usize, usize, usize) -> usize;
        type F5 = unsafe extern "C" fn(usize, usize, usize, usize, usize) -> usize;
        type F6 = unsafe extern "C" fn(usize, usize, usize, usize, usize, usize) -> usize;
        type F7 = unsafe extern "C" fn(usize, usize, usize, usize, usize, usize, usize) -> usize;
        type F8 =
            unsafe extern "C" fn(usize, usize, usize, usize, usize, usize, usize, usize) -> usize;

        let addr = entry.0;
        // SAFETY: `addr` is an exported function of the loaded library (it came
        // from `resolve`), and the library stays loaded while `self` is alive.
        let result = match *args {
            [] => std::mem::transmute::<usize, F0>(addr)(),
            [a] => std::mem::transmute::<usize, F1>(addr)(a),
            [a, b] => std::mem::transmute::<usize, F2>(addr)(a, b),
            [a, b, c] => std::mem::transmute::<usize, F3>(addr)(a, b, c),
            [a, b, c, d] => std::mem::transmute::<usize, F4>(addr)(a, b, c, d),
            [a, b, c, d, e] => std::mem::transmute::<usize, F5>(addr)(a, b, c, d, e),
            [a, b, c, d, e, f] => std::mem::transmute::<usize, F6>(addr)(a, b, c, d, e, f),
            [a, b, c, d, e, f, g] => std::mem::transmute::<usize, F7>(addr)(a, b, c, d, e, f, g),
            [a, b, c, d, e, f, g, h] => {
                std::mem::transmute::<usize, F8>(addr)(a, b, c, d, e, f, g, h)
            }
            _ => {
                return Err(RpcError::Arity {
                    name: format!("{addr:#x}"),
                    arity: args.len(),
                    max: MAX_ARITY,
                })
            }
        };
        Ok(result)
    }
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("path", &self.path)
            .field("symbols", &"<RwLock<HashMap<String, EntryPoint>>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_name_matches_platform() {
        let name = library_file_name();
        assert!(name.starts_with("libmytrpc."));
        #[cfg(target_os = "linux")]
        assert_eq!(name, "libmytrpc.so");
    }

    #[test]
    fn default_path_ends_with_lib_dir() {
        let path = default_library_path();
        assert!(path.ends_with(Path::new("lib").join(library_file_name())));
    }

    #[test]
    fn load_missing_library_is_fatal() {
        let err = NativeEngine::load("/nonexistent/dir/libmytrpc.so").unwrap_err();
        assert!(matches!(err, RpcError::LibraryLoad { .. }));
        assert!(err.is_fatal());
    }
}
