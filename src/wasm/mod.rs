// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! WASM loader used to bring remote dependencies into isolation contexts.
//!
//! The loader is an explicit object: build it once, wrap it in an `Arc`, and hand it to the pool.
//! Compiled modules are cached by source key, so every context that loads the same dependency
//! shares one compiled `Module` and only pays for its own `Store` and `Instance`.

pub mod error;
pub mod loader;

pub use error::{WasmError, WasmResult};
pub use loader::{load_wasm_bytes, WasmInstance, WasmLoader, WasmSource, MAX_WASM_SIZE};
