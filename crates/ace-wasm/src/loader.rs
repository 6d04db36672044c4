//! Compiling and instantiating the accelerated module.

use crate::instance::AcceleratedInstance;
use crate::{WasmError, WasmResult};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wasmtime::{Config, Engine, Module, OptLevel};

/// Text of the bundled kernel module.
pub const BUNDLED_KERNELS_WAT: &str = include_str!("../kernels/ace_kernels.wat");

/// Default cap on linear memory: 4096 pages, 256 MiB.
pub const DEFAULT_MAX_MEMORY_PAGES: u32 = 4_096;

/// Where the module's bytes come from.
#[derive(Clone)]
pub enum ModuleSource {
    /// The kernel module shipped with this crate.
    Bundled,
    /// A `.wasm` or `.wat` file on disk.
    File(PathBuf),
    /// Bytes already in memory (binary or text format).
    Bytes(Arc<[u8]>),
}

impl ModuleSource {
    /// Human-readable origin, for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Bundled => "<bundled>".to_string(),
            Self::File(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleSource({})", self.describe())
    }
}

/// Loader settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Module file; the bundled module is used when `None`.
    pub module_path: Option<PathBuf>,
    /// Linear memory limit in 64 KiB pages.
    pub max_memory_pages: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            module_path: None,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
        }
    }
}

impl LoaderConfig {
    /// The source this configuration selects.
    #[must_use]
    pub fn source(&self) -> ModuleSource {
        match &self.module_path {
            Some(path) => ModuleSource::File(path.clone()),
            None => ModuleSource::Bundled,
        }
    }
}

/// Compiles the accelerated module once and hands out instances.
///
/// The compiled artifact, or the compilation error, is cached: a loader never
/// compiles twice, even when many threads ask at once.
pub struct ModuleLoader {
    engine: Engine,
    source: ModuleSource,
    max_memory_pages: u32,
    compiled: OnceCell<WasmResult<Module>>,
    compile_count: AtomicUsize,
}

impl ModuleLoader {
    /// Create a loader for the source selected by `config`.
    pub fn new(config: &LoaderConfig) -> WasmResult<Self> {
        Self::with_source(config.source(), config.max_memory_pages)
    }

    /// Create a loader for an explicit source.
    pub fn with_source(source: ModuleSource, max_memory_pages: u32) -> WasmResult<Self> {
        let mut config = Config::new();
        config.cranelift_opt_level(OptLevel::Speed);
        let engine = Engine::new(&config).map_err(|e| WasmError::Engine(e.to_string()))?;
        Ok(Self {
            engine,
            source,
            max_memory_pages,
            compiled: OnceCell::new(),
            compile_count: AtomicUsize::new(0),
        })
    }

    /// The configured source.
    #[must_use]
    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    /// Compile without instantiating. Later calls reuse the first outcome.
    pub fn precompile(&self) -> WasmResult<()> {
        self.module().map(|_| ())
    }

    /// Whether compilation has finished (successfully or not).
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }

    /// How many times this loader has actually run the compiler.
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::Acquire)
    }

    fn module(&self) -> WasmResult<&Module> {
        self.compiled
            .get_or_init(|| self.compile())
            .as_ref()
            .map_err(Clone::clone)
    }

    fn compile(&self) -> WasmResult<Module> {
        self.compile_count.fetch_add(1, Ordering::AcqRel);
        let source_name = self.source.describe();
        let compile_err = |e: wasmtime::Error| WasmError::Compile {
            source_name: source_name.clone(),
            message: e.to_string(),
        };
        let module = match &self.source {
            ModuleSource::Bundled => Module::new(&self.engine, BUNDLED_KERNELS_WAT),
            ModuleSource::File(path) => Module::from_file(&self.engine, path),
            ModuleSource::Bytes(bytes) => Module::new(&self.engine, &bytes[..]),
        }
        .map_err(compile_err)?;
        tracing::info!(source = %source_name, "wasm: module compiled");
        Ok(module)
    }

    /// Compile if needed, then create a fresh instance with its own memory.
    pub fn instantiate(&self) -> WasmResult<AcceleratedInstance> {
        let module = self.module()?;
        let instance = AcceleratedInstance::instantiate(&self.engine, module, self.max_memory_pages)?;
        tracing::debug!(source = %self.source.describe(), "wasm: instance created");
        Ok(instance)
    }

    /// Like [`ModuleLoader::instantiate`], but every failure means "unavailable".
    #[must_use]
    pub fn load(&self) -> Option<AcceleratedInstance> {
        match self.instantiate() {
            Ok(instance) => Some(instance),
            Err(err) => {
                tracing::warn!(
                    source = %self.source.describe(),
                    error = %err,
                    "wasm: accelerated module unavailable"
                );
                None
            }
        }
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("source", &self.source)
            .field("max_memory_pages", &self.max_memory_pages)
            .field("compiled", &self.is_compiled())
            .finish_non_exhaustive()
    }
}
