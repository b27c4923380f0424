// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::observability::messages::wasm::{ModuleCacheHit, ModuleCompiled, ModuleLoadFailed, ModuleLoaded};
use crate::observability::messages::StructuredLog;
use crate::wasm::error::{WasmError, WasmResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use wasmtime::{Engine, Instance, Module, Store, WasmParams, WasmResults};

/// Maximum allowed size for WASM binaries (16 MB)
pub const MAX_WASM_SIZE: usize = 16 * 1024 * 1024;

/// Loads WASM bytes from a file and validates the size
///
/// This function reads the entire WASM binary into memory and checks that it
/// doesn't exceed the maximum allowed size. It does not parse the binary.
pub fn load_wasm_bytes<P: AsRef<Path>>(path: P) -> WasmResult<Vec<u8>> {
    let path = path.as_ref();
    let module_path = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|e| {
        let error = WasmError::IoError(e);
        ModuleLoadFailed {
            module_path: &module_path,
            error: &error,
        }
        .log();
        error
    })?;

    check_size(&module_path, &bytes)?;

    ModuleLoaded {
        module_path: &module_path,
        size_bytes: bytes.len(),
    }
    .log();

    Ok(bytes)
}

fn check_size(key: &str, bytes: &[u8]) -> WasmResult<()> {
    if bytes.len() > MAX_WASM_SIZE {
        let error = WasmError::ValidationError(format!(
            "WASM file too large: {} bytes (max: {} bytes)",
            bytes.len(),
            MAX_WASM_SIZE
        ));
        ModuleLoadFailed {
            module_path: key,
            error: &error,
        }
        .log();
        return Err(error);
    }
    Ok(())
}

/// Where a module comes from. The key identifies it in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum WasmSource {
    File(PathBuf),
    Bytes { key: String, bytes: Vec<u8> },
}

impl WasmSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        WasmSource::File(path.into())
    }

    pub fn bytes(key: impl Into<String>, bytes: Vec<u8>) -> Self {
        WasmSource::Bytes {
            key: key.into(),
            bytes,
        }
    }

    pub fn key(&self) -> String {
        match self {
            WasmSource::File(path) => path.display().to_string(),
            WasmSource::Bytes { key, .. } => key.clone(),
        }
    }
}

/// A fresh store plus the instance living in it.
pub struct WasmInstance {
    pub store: Store<()>,
    pub instance: Instance,
}

impl WasmInstance {
    /// Call an exported function with typed parameters and results.
    pub fn call<Params, Results>(&mut self, export: &str, params: Params) -> WasmResult<Results>
    where
        Params: WasmParams,
        Results: WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<Params, Results>(&mut self.store, export)?;
        Ok(func.call(&mut self.store, params)?)
    }
}

/// Compiles and instantiates WASM modules, caching compiled modules by source key.
pub struct WasmLoader {
    engine: Engine,
    cache: Mutex<HashMap<String, Module>>,
}

impl WasmLoader {
    pub fn new() -> WasmResult<Self> {
        let engine = Engine::new(&wasmtime::Config::new())
            .map_err(|e| WasmError::EngineError(e.to_string()))?;
        Ok(Self::with_engine(engine))
    }

    pub fn with_engine(engine: Engine) -> Self {
        Self {
            engine,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compile a module, or return the cached one for the same source key.
    pub fn compile(&self, source: &WasmSource) -> WasmResult<Module> {
        let key = source.key();
        if let Some(module) = self.lock_cache().get(&key) {
            ModuleCacheHit { module_key: &key }.log();
            return Ok(module.clone());
        }

        let bytes = match source {
            WasmSource::File(path) => load_wasm_bytes(path)?,
            WasmSource::Bytes { bytes, .. } => {
                check_size(&key, bytes)?;
                bytes.clone()
            }
        };

        wasmparser::Validator::new().validate_all(&bytes).map_err(|e| {
            let error = WasmError::ParserError(e);
            ModuleLoadFailed {
                module_path: &key,
                error: &error,
            }
            .log();
            error
        })?;

        let module = Module::new(&self.engine, &bytes).map_err(|e| WasmError::ModuleError(e.to_string()))?;
        ModuleCompiled {
            module_key: &key,
            size_bytes: bytes.len(),
        }
        .log();

        // Two contexts may compile the same source concurrently; the first insert wins.
        let module = self.lock_cache().entry(key).or_insert(module).clone();
        Ok(module)
    }

    /// Instantiate a compiled module in a new store. Modules with imports are not supported.
    pub fn instantiate(&self, module: &Module) -> WasmResult<WasmInstance> {
        let mut store = Store::new(&self.engine, ());
        let instance = Instance::new(&mut store, module, &[])?;
        Ok(WasmInstance { store, instance })
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.lock_cache().contains_key(key)
    }

    pub fn cached_count(&self) -> usize {
        self.lock_cache().len()
    }

    pub fn evict(&self, key: &str) -> bool {
        self.lock_cache().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock_cache().clear();
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Module>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WasmLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmLoader")
            .field("cached_modules", &self.cached_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ADDER_WAT: &str = r#"
        (module
          (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))
    "#;

    fn adder_bytes() -> Vec<u8> {
        wat::parse_str(ADDER_WAT).unwrap()
    }

    #[test]
    fn test_load_small_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let test_data = b"test wasm data";
        temp_file.write_all(test_data).unwrap();

        let result = load_wasm_bytes(temp_file.path());
        assert_eq!(result.unwrap(), test_data);
    }

    #[test]
    fn test_file_too_large() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let large_data = vec![0u8; MAX_WASM_SIZE + 1];
        temp_file.write_all(&large_data).unwrap();

        match load_wasm_bytes(temp_file.path()) {
            Err(WasmError::ValidationError(msg)) => {
                assert!(msg.contains("too large"));
                assert!(msg.contains(&format!("{}", MAX_WASM_SIZE + 1)));
            }
            _ => panic!("Expected ValidationError for oversized file"),
        }
    }

    #[test]
    fn test_nonexistent_file() {
        let result = load_wasm_bytes("/nonexistent/path/to/file.wasm");
        assert!(matches!(result, Err(WasmError::IoError(_))));
    }

    #[test]
    fn test_compile_caches_by_key() {
        let loader = WasmLoader::new().unwrap();
        let source = WasmSource::bytes("adder", adder_bytes());

        assert!(!loader.is_cached("adder"));
        loader.compile(&source).unwrap();
        assert!(loader.is_cached("adder"));
        loader.compile(&source).unwrap();
        assert_eq!(loader.cached_count(), 1);

        assert!(loader.evict("adder"));
        assert_eq!(loader.cached_count(), 0);
    }

    #[test]
    fn test_compile_from_file_and_call() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&adder_bytes()).unwrap();

        let loader = WasmLoader::new().unwrap();
        let module = loader.compile(&WasmSource::file(temp_file.path())).unwrap();
        let mut instance = loader.instantiate(&module).unwrap();

        let sum: i32 = instance.call("add", (2i32, 40i32)).unwrap();
        assert_eq!(sum, 42);
    }

    #[test]
    fn test_invalid_binary_rejected() {
        let loader = WasmLoader::new().unwrap();
        let result = loader.compile(&WasmSource::bytes("junk", b"not wasm".to_vec()));
        assert!(matches!(result, Err(WasmError::ParserError(_))));
        assert!(!loader.is_cached("junk"));
    }

    #[test]
    fn test_missing_export() {
        let loader = WasmLoader::new().unwrap();
        let module = loader.compile(&WasmSource::bytes("adder", adder_bytes())).unwrap();
        let mut instance = loader.instantiate(&module).unwrap();

        let result = instance.call::<(i32, i32), i32>("sub", (1, 2));
        assert!(matches!(result, Err(WasmError::ExecutionError(_))));
    }
}
