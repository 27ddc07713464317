//! Trusted module loading
//!
//! The executor admits exactly the modules named in [`TRUSTED_MODULES`]. A
//! path is checked against the table before anything is read; the bytes are
//! then staged in memory, compiled and instantiated as a WebAssembly unit, and
//! the staging buffer is dropped whatever the outcome.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use wasmer::{imports, Instance, Module, Store};

use crate::error::{Error, Result};

/// One allow-listed module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSpec {
    /// Path relative to the trusted root, always starting with `/`
    pub path: &'static str,
    pub max_bytes: u64,
    /// Symbols the module must export
    pub required_exports: &'static [&'static str],
}

/// Compiled-in allow-list.
pub const TRUSTED_MODULES: &[ModuleSpec] = &[ModuleSpec {
    path: "/sql-engine.wasm",
    max_bytes: 4 * 1024 * 1024,
    required_exports: &["tally_engine_abi"],
}];

/// Where module bytes come from.
pub trait ModuleSource: Send + Sync {
    /// Size in bytes of the module at `path`, without reading it.
    fn size(&self, path: &str) -> Result<u64>;

    /// Module bytes at `path`.
    fn fetch(&self, path: &str) -> Result<Vec<u8>>;
}

/// Reads modules from a trusted root directory.
#[derive(Debug, Clone)]
pub struct DirectoryModuleSource {
    root: PathBuf,
}

impl DirectoryModuleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.root.join(path.trim_start_matches('/'));
        let canonical_root = self.root.canonicalize()?;
        let canonical = resolved.canonicalize()?;
        if !canonical.starts_with(&canonical_root) {
            return Err(Error::UntrustedModule(format!(
                "{path} resolves outside the trusted root"
            )));
        }
        Ok(canonical)
    }
}

impl ModuleSource for DirectoryModuleSource {
    fn size(&self, path: &str) -> Result<u64> {
        Ok(std::fs::metadata(self.resolve(path)?)?.len())
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.resolve(path)?)?)
    }
}

/// A module that passed every check, kept alive for the executor's lifetime.
pub struct LoadedModule {
    pub path: String,
    pub size: u64,
    pub exports: Vec<String>,
    _store: Store,
    _instance: Instance,
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LoadedModule")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

/// Checks module requests against an allow-list and loads admitted ones.
#[derive(Clone)]
pub struct ModuleLoader {
    source: Arc<dyn ModuleSource>,
    table: &'static [ModuleSpec],
}

impl ModuleLoader {
    pub fn new(source: Arc<dyn ModuleSource>) -> Self {
        Self::with_table(source, TRUSTED_MODULES)
    }

    pub fn with_table(source: Arc<dyn ModuleSource>, table: &'static [ModuleSpec]) -> Self {
        Self { source, table }
    }

    /// Allow-list lookup. Never touches the module source.
    pub fn spec_for(&self, path: &str) -> Result<&'static ModuleSpec> {
        if !path.starts_with('/') {
            return Err(Error::UntrustedModule(format!(
                "{path} does not start at the trusted root"
            )));
        }
        let traverses = Path::new(path)
            .components()
            .any(|component| matches!(component, Component::ParentDir))
            || path.contains('\\');
        if traverses {
            return Err(Error::UntrustedModule(format!(
                "{path} contains directory traversal"
            )));
        }
        self.table
            .iter()
            .find(|spec| spec.path == path)
            .ok_or_else(|| Error::UntrustedModule(format!("{path} is not allow-listed")))
    }

    /// Fetch, stage, and load the module at `path`.
    pub fn load(&self, path: &str) -> Result<LoadedModule> {
        let spec = self.spec_for(path)?;

        let declared = self.source.size(path)?;
        if declared > spec.max_bytes {
            return Err(Error::ModuleTooLarge {
                path: path.to_string(),
                actual: declared,
                limit: spec.max_bytes,
            });
        }

        let staged = StagedModule::new(path, self.source.fetch(path)?);
        let actual = staged.len();
        if actual > spec.max_bytes {
            return Err(Error::ModuleTooLarge {
                path: path.to_string(),
                actual,
                limit: spec.max_bytes,
            });
        }

        let mut store = Store::default();
        let module = Module::new(&store, staged.bytes()).map_err(|error| {
            Error::ModuleContractViolation(format!("{path} failed to compile: {error}"))
        })?;

        let exports = module
            .exports()
            .map(|export| export.name().to_string())
            .collect::<Vec<_>>();
        if let Some(missing) = spec
            .required_exports
            .iter()
            .find(|required| !exports.iter().any(|name| name == *required))
        {
            return Err(Error::ModuleContractViolation(format!(
                "{path} does not export `{missing}`"
            )));
        }

        let instance = Instance::new(&mut store, &module, &imports! {}).map_err(|error| {
            Error::ModuleContractViolation(format!("{path} failed to instantiate: {error}"))
        })?;
        drop(staged);

        tracing::info!(path, size = actual, "Loaded trusted module");
        Ok(LoadedModule {
            path: path.to_string(),
            size: actual,
            exports,
            _store: store,
            _instance: instance,
        })
    }
}

/// Throwaway in-memory copy of module bytes; cleared when dropped.
struct StagedModule {
    path: String,
    bytes: Vec<u8>,
}

impl StagedModule {
    fn new(path: &str, bytes: Vec<u8>) -> Self {
        Self {
            path: path.to_string(),
            bytes,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl Drop for StagedModule {
    fn drop(&mut self) {
        self.bytes.fill(0);
        self.bytes.clear();
        self.bytes.shrink_to_fit();
        tracing::trace!(path = %self.path, "Released module staging buffer");
    }
}
