use super::PatchError;
use super::Result;

use libloading::{Library, Symbol};
use log::trace;
use std::path::PathBuf;

/// SymbolSource maps a (library, exported symbol) pair to a process-space
/// address. Patch application and hook installation only ever see this trait,
/// so tests can point symbols at synthetic buffers.
pub trait SymbolSource {
    fn resolve(&self, library: &str, symbol: &str) -> Result<usize>;
}

/// Resolves exports through the dynamic loader.
///
/// Each lookup opens the library, queries the export table and drops the
/// handle again; the refcount bump is scoped to the call, so a module the host
/// already has mapped is not kept "more loaded" than before. Library paths are
/// interpreted relative to `root` (the server's working directory, e.g.
/// `cstrike/bin/server_srv.so`).
pub struct LoaderSource {
    root: PathBuf,
}

impl LoaderSource {
    pub fn new() -> Self {
        Self::with_root(".")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        LoaderSource { root: root.into() }
    }
}

impl Default for LoaderSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderSource {
    /// Bare sonames go straight to the loader so its search path applies;
    /// anything with a directory component is anchored at `root`.
    fn library_path(&self, library: &str) -> PathBuf {
        if library.contains('/') {
            self.root.join(library)
        } else {
            PathBuf::from(library)
        }
    }
}

impl SymbolSource for LoaderSource {
    fn resolve(&self, library: &str, symbol: &str) -> Result<usize> {
        trace!("Resolving `{}` in `{}`", symbol, library);
        let path = self.library_path(library);
        let handle = unsafe { Library::new(&path) }
            .map_err(|_| PatchError::LibraryNotFound(library.to_string()))?;
        let address = unsafe {
            let function: Symbol<unsafe extern "C" fn()> =
                handle.get(symbol.as_bytes()).map_err(|_| {
                    PatchError::SymbolNotFound(library.to_string(), symbol.to_string())
                })?;
            *function as usize
        };
        // Dropping the handle dlcloses; the host's own reference keeps the
        // module mapped.
        drop(handle);
        Ok(address)
    }
}
