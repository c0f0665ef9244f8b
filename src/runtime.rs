//! Provider shim loader and process-wide API singleton.
//!
//! This module is responsible for:
//! - Locating the provider shim dynamic library for the current target.
//! - Dynamically loading it and resolving its ABI symbols into an [`Api`] handle.
//! - Exposing a process-wide singleton [`Runtime`] via [`runtime()`].
//!
//! ## Environment variables
//!
//! - `WMI_BRIDGE_PROVIDER_PATH` *(optional)*: load the shim from this path instead of
//!   letting the OS loader search for the platform library name.
//!
//! ## Initialization semantics
//!
//! The runtime is initialized lazily on first use and stored in a global [`OnceLock`]. If
//! initialization fails, subsequent calls to [`runtime()`] return the same error. A shim that
//! is missing a symbol is an environment integrity failure: nothing in the bridge can work
//! against a partial ABI.

use std::{env, path::PathBuf, sync::OnceLock};

use libloading::Library;

use crate::{api::Api, Error, Result};

/// Environment variable overriding the shim location.
pub const PROVIDER_PATH_ENV: &str = "WMI_BRIDGE_PROVIDER_PATH";

/// Process-wide singleton storage for the runtime.
///
/// A failed initialization is cached as its message and reported on every later call.
static RUNTIME: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();

/// Loaded provider shim and resolved ABI API.
///
/// - `_lib` keeps the dynamic library mapped for the lifetime of the process.
/// - `api` provides access to the resolved ABI symbols.
/// - `path` is what was handed to the loader.
pub struct Runtime {
    _lib: Library,
    pub api: Api,
    pub path: PathBuf,
}

/// Get the process-wide provider runtime.
///
/// # Errors
///
/// Returns [`Error::EnvironmentIntegrity`] if the library cannot be loaded or does not export
/// the full shim ABI.
pub fn runtime() -> Result<&'static Runtime> {
    match RUNTIME.get_or_init(|| Runtime::init().map_err(|e| e.to_string())) {
        Ok(rt) => Ok(rt),
        Err(message) => Err(Error::EnvironmentIntegrity(message.clone())),
    }
}

impl Runtime {
    fn init() -> Result<Self> {
        let path = match env::var(PROVIDER_PATH_ENV) {
            Ok(p) => PathBuf::from(p),
            Err(_) => PathBuf::from(default_library_name()),
        };
        unsafe { Self::load_from_path(path) }
    }

    /// Load the shim from `path` and resolve its ABI into an [`Api`].
    ///
    /// # Safety
    ///
    /// `path` must name a library implementing the shim ABI declared in `sys`; calling
    /// symbols with a different signature is undefined behavior.
    unsafe fn load_from_path(path: PathBuf) -> Result<Self> {
        let lib = Library::new(&path).map_err(|e| {
            Error::EnvironmentIntegrity(format!(
                "failed to load provider shim '{}': {e}",
                path.display()
            ))
        })?;

        let api = Api::load(&lib).map_err(|e| {
            Error::EnvironmentIntegrity(format!(
                "failed to resolve provider shim symbols from '{}': {e}",
                path.display()
            ))
        })?;

        tracing::debug!(path = %path.display(), "Loaded provider shim");
        Ok(Self {
            _lib: lib,
            api,
            path,
        })
    }
}

fn default_library_name() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "wbemshim.dll"
    }
    #[cfg(target_os = "macos")]
    {
        "libwbemshim.dylib"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "libwbemshim.so"
    }
}
